//! The benchmark entity.

use guacamole::combinators::{any, range_to, uniform};
use guacamole::Guacamole;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Records with an age strictly above this are in the scanned range.
pub const RANGE_AGE_LOWER: u8 = 45;
/// Records with an age strictly below this are in the scanned range.
pub const RANGE_AGE_UPPER: u8 = 75;

const NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const NAME_MIN_LEN: usize = 6;
const NAME_MAX_LEN: usize = 16;
const AGE_MAX: u8 = 100;
const BALANCE_MAX: f64 = 1_000_000.0;

////////////////////////////////////////////// Record //////////////////////////////////////////////

/// One person.  The identifier is assigned by [crate::IdGenerator] at insert time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: u64,
    pub name: String,
    pub age: u8,
    pub balance: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub padding: String,
}

impl Record {
    /// A template whose padding is `padding` bytes of filler.
    pub fn template(padding: usize) -> Self {
        Self {
            padding: "x".repeat(padding),
            ..Self::default()
        }
    }

    /// Draw a fresh name, age and balance.  Neither the identifier nor the padding change.
    pub fn randomise(&mut self, guac: &mut Guacamole) {
        let len = uniform(NAME_MIN_LEN, NAME_MAX_LEN)(guac);
        self.name.clear();
        for idx in 0..len {
            let c = NAME_ALPHABET[range_to(NAME_ALPHABET.len())(guac)] as char;
            if idx == 0 {
                self.name.push(c.to_ascii_uppercase());
            } else {
                self.name.push(c);
            }
        }
        self.age = uniform(0u8, AGE_MAX + 1)(guac);
        self.balance = random_balance(guac);
    }

    /// True when the age falls inside the range query.
    pub fn in_read_range(&self) -> bool {
        self.age > RANGE_AGE_LOWER && self.age < RANGE_AGE_UPPER
    }

    /// Serialize to the JSON stored by the relational and in-memory backends.
    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a record serialized by [Record::to_json].
    pub fn from_json(bytes: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// The document stored in MongoDB.  The identifier becomes `_id`.
    #[cfg(feature = "mongo")]
    pub fn to_document(&self) -> Result<mongodb::bson::Document, Error> {
        let id = i64::try_from(self.id).map_err(|_| Error::Decode {
            what: format!("id {} does not fit a bson int64", self.id),
        })?;
        let mut doc = mongodb::bson::doc! {
            "_id": id,
            "name": self.name.as_str(),
            "age": i32::from(self.age),
            "balance": self.balance,
        };
        if !self.padding.is_empty() {
            doc.insert("padding", self.padding.as_str());
        }
        Ok(doc)
    }
}

#[cfg(feature = "mongo")]
impl TryFrom<&mongodb::bson::Document> for Record {
    type Error = Error;

    fn try_from(doc: &mongodb::bson::Document) -> Result<Self, Error> {
        let id = doc.get_i64("_id")?;
        let age = doc.get_i32("age")?;
        Ok(Self {
            id: u64::try_from(id).map_err(|_| Error::Decode {
                what: format!("negative _id {id}"),
            })?,
            name: doc.get_str("name")?.to_string(),
            age: u8::try_from(age).map_err(|_| Error::Decode {
                what: format!("age {age} out of range"),
            })?,
            balance: doc.get_f64("balance")?,
            padding: doc.get_str("padding").unwrap_or_default().to_string(),
        })
    }
}

/// A balance in `[0, 1_000_000)`.
pub fn random_balance(guac: &mut Guacamole) -> f64 {
    any::<f64>(guac) * BALANCE_MAX
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
