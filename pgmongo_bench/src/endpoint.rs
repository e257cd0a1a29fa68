//! Endpoint URLs and the provider knobs carried in their query strings.

use url::Url;

use crate::Error;

/// Parse an endpoint URL.
pub fn parse(endpoint: &str) -> Result<Url, Error> {
    Url::parse(endpoint).map_err(|err| Error::Endpoint {
        what: format!("{endpoint}: {err}"),
    })
}

/// Table and collection names are interpolated into queries, so they are restricted to
/// non-empty ASCII alphanumerics and underscores.
pub fn check_table_name(table: &str) -> Result<(), Error> {
    if !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        Ok(())
    } else {
        Err(Error::Endpoint {
            what: format!("invalid table name {table:?}"),
        })
    }
}

/// Remove `key` from the query string of `url`, returning its last value.
///
/// Every other parameter is preserved in order.
pub fn take_query_param(url: &mut Url, key: &str) -> Option<String> {
    let mut found = None;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter_map(|(k, v)| {
            if k == key {
                found = Some(v.into_owned());
                None
            } else {
                Some((k.into_owned(), v.into_owned()))
            }
        })
        .collect();
    if found.is_some() {
        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(kept);
        }
    }
    found
}

/// Interpret a boolean knob: empty, `false`, and `0` are off; `true` and `1` are on.
#[cfg(feature = "mongo")]
pub fn parse_flag(key: &str, value: Option<&str>) -> Result<bool, Error> {
    match value.map(str::to_ascii_lowercase).as_deref() {
        None | Some("") | Some("false") | Some("0") => Ok(false),
        Some("true") | Some("1") => Ok(true),
        Some(other) => Err(Error::Endpoint {
            what: format!("{key}={other} is not a valid flag"),
        }),
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
