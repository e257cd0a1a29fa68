//! PostgreSQL provider.  Each record is one JSONB document in a single-column table.

use std::str::FromStr;

use futures::TryStreamExt;
use guacamole::Guacamole;
use indicio::{clue, INFO};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Connection;
use url::Url;

use crate::blocking::BlockingClient;
use crate::endpoint::take_query_param;
use crate::record::{random_balance, RANGE_AGE_LOWER, RANGE_AGE_UPPER};
use crate::{
    outcome, sample_existing, update_missed, ConnectOptions, Error, IdGenerator, Operation,
    Provider, Record, COLLECTOR,
};

const SYNCHRONOUS_COMMIT: &[&str] = &["on", "off", "local", "remote_write", "remote_apply"];

/// Strip `synchronous_commit` from the endpoint and validate it.
pub fn synchronous_commit(url: &mut Url) -> Result<Option<String>, Error> {
    match take_query_param(url, "synchronous_commit").map(|s| s.to_ascii_lowercase()) {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) if SYNCHRONOUS_COMMIT.contains(&s.as_str()) => Ok(Some(s)),
        Some(s) => Err(Error::Endpoint {
            what: format!("synchronous_commit={s} is not one of {SYNCHRONOUS_COMMIT:?}"),
        }),
    }
}

////////////////////////////////////////////// Queries /////////////////////////////////////////////

/// SQL for one table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Queries {
    pub create_table: String,
    pub create_index: String,
    pub insert: String,
    pub update: String,
    pub read: String,
    pub read_range: String,
    pub read_most_recent: String,
    pub max_id: String,
}

impl Queries {
    /// `table` must already have passed [crate::check_table_name].
    pub fn new(table: &str) -> Self {
        Self {
            create_table: format!("CREATE TABLE IF NOT EXISTS {table} (data JSONB NOT NULL)"),
            create_index: format!(
                "CREATE INDEX IF NOT EXISTS {table}_id_idx ON {table} ((data->'id'))"
            ),
            insert: format!("INSERT INTO {table} (data) VALUES ($1)"),
            update: format!(
                "UPDATE {table} SET data = jsonb_set(data, '{{balance}}', to_jsonb($1::float8), false) \
                 WHERE data->'id' = to_jsonb($2::bigint)"
            ),
            read: format!("SELECT data FROM {table} WHERE data->'id' = to_jsonb($1::bigint)"),
            read_range: format!(
                "SELECT data FROM {table} \
                 WHERE (data->'age') > '{RANGE_AGE_LOWER}' AND (data->'age') < '{RANGE_AGE_UPPER}'"
            ),
            read_most_recent: format!("SELECT data FROM {table} ORDER BY data->'id' DESC LIMIT 1"),
            max_id: format!(
                "SELECT (data->>'id')::bigint FROM {table} ORDER BY data->'id' DESC LIMIT 1"
            ),
        }
    }
}

fn sql_id(id: u64) -> Result<i64, Error> {
    i64::try_from(id).map_err(|_| Error::Backend {
        what: format!("id {id} does not fit a bigint"),
    })
}

async fn ping(pool: &PgPool) -> Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    conn.ping().await
}

async fn prepare_schema(
    pool: &PgPool,
    table: &str,
    queries: &Queries,
    create: bool,
) -> Result<bool, sqlx::Error> {
    if create {
        sqlx::query(&queries.create_table).execute(pool).await?;
        sqlx::query(&queries.create_index).execute(pool).await?;
    }
    sqlx::query_scalar::<_, bool>("SELECT to_regclass($1) IS NOT NULL")
        .bind(table)
        .fetch_one(pool)
        .await
}

async fn scan(pool: &PgPool, sql: &str) -> Result<u64, Error> {
    let mut rows = sqlx::query_scalar::<_, Json<Record>>(sql).fetch(pool);
    let mut count = 0;
    while let Some(Json(record)) = rows.try_next().await? {
        if record.in_read_range() {
            count += 1;
        }
    }
    Ok(count)
}

///////////////////////////////////////// PostgresProvider /////////////////////////////////////////

/// A provider storing each record as one JSONB document.
pub struct PostgresProvider {
    client: BlockingClient,
    pool: PgPool,
    queries: Queries,
}

impl PostgresProvider {
    /// Connect, ping, and check the table exists.  Each stage fails with its own error.
    pub fn new(mut endpoint: Url, table: &str, options: &ConnectOptions) -> Result<Self, Error> {
        let synchronous_commit = synchronous_commit(&mut endpoint)?;
        let mut connect = PgConnectOptions::from_str(endpoint.as_str()).map_err(|err| {
            Error::Endpoint {
                what: err.to_string(),
            }
        })?;
        if let Some(sc) = &synchronous_commit {
            connect = connect.options([("synchronous_commit", sc.as_str())]);
        }
        let client = BlockingClient::new("postgres", options.timeout)?;
        let pool = client
            .setup(
                PgPoolOptions::new()
                    .max_connections(options.pool_size.max(1))
                    .acquire_timeout(options.timeout)
                    .connect_with(connect),
            )
            .map_err(|err| Error::Connect {
                what: err.to_string(),
            })?;
        client.setup(ping(&pool)).map_err(|err| Error::Ping {
            what: err.to_string(),
        })?;
        let queries = Queries::new(table);
        let exists = client
            .setup(prepare_schema(&pool, table, &queries, options.create_table))
            .map_err(|err| Error::Schema {
                what: err.to_string(),
            })?;
        if !exists {
            return Err(Error::Schema {
                what: format!("table {table} does not exist"),
            });
        }
        clue!(COLLECTOR, INFO, {
            postgres: table,
            synchronous_commit: synchronous_commit.unwrap_or_default(),
        });
        Ok(Self {
            client,
            pool,
            queries,
        })
    }

    fn insert(&self, record: &Record) -> Result<(), Error> {
        self.client.call(
            sqlx::query(&self.queries.insert)
                .bind(Json(record))
                .execute(&self.pool),
        )?;
        Ok(())
    }

    fn update(&self, id: u64, balance: f64) -> Result<(), Error> {
        let done = self.client.call(
            sqlx::query(&self.queries.update)
                .bind(balance)
                .bind(sql_id(id)?)
                .execute(&self.pool),
        )?;
        if done.rows_affected() == 0 {
            update_missed(id);
        }
        Ok(())
    }

    fn read(&self, id: u64) -> Result<Record, Error> {
        let row = self.client.call(
            sqlx::query_scalar::<_, Json<Record>>(&self.queries.read)
                .bind(sql_id(id)?)
                .fetch_optional(&self.pool),
        )?;
        row.map(|Json(record)| record).ok_or(Error::NotFound { id })
    }

    fn most_recent(&self) -> Result<Record, Error> {
        let row = self.client.call(
            sqlx::query_scalar::<_, Json<Record>>(&self.queries.read_most_recent)
                .fetch_optional(&self.pool),
        )?;
        row.map(|Json(record)| record).ok_or(Error::EmptyBackend)
    }
}

impl Provider for PostgresProvider {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn insert_record(&self, record: &mut Record, ids: &IdGenerator, guac: &mut Guacamole) -> bool {
        record.randomise(guac);
        record.id = ids.get_new();
        outcome(Operation::Insert, Some(record.id), self.insert(record))
    }

    fn update_record(&self, _: &mut Record, ids: &IdGenerator, guac: &mut Guacamole) -> bool {
        let Some(id) = sample_existing(Operation::Update, ids, guac) else {
            return false;
        };
        let balance = random_balance(guac);
        outcome(Operation::Update, Some(id), self.update(id, balance))
    }

    fn read_record(&self, _: &mut Record, ids: &IdGenerator, guac: &mut Guacamole) -> bool {
        let Some(id) = sample_existing(Operation::Read, ids, guac) else {
            return false;
        };
        outcome(Operation::Read, Some(id), self.read(id))
    }

    fn read_range(&self, _: &mut Record, _: &IdGenerator, _: &mut Guacamole) -> bool {
        let result = self
            .client
            .call(scan(&self.pool, &self.queries.read_range));
        outcome(Operation::ReadRange, None, result)
    }

    fn read_most_recent_record(&self, _: &mut Record, _: &IdGenerator, _: &mut Guacamole) -> bool {
        outcome(Operation::ReadMostRecent, None, self.most_recent())
    }

    fn get_max_id(&self) -> Result<u64, Error> {
        let max = self.client.call(
            sqlx::query_scalar::<_, Option<i64>>(&self.queries.max_id).fetch_optional(&self.pool),
        )?;
        match max.flatten() {
            None | Some(0) => Err(Error::EmptyBackend),
            Some(id) => u64::try_from(id).map_err(|_| Error::Decode {
                what: format!("negative id {id}"),
            }),
        }
    }
}

impl Drop for PostgresProvider {
    fn drop(&mut self) {
        self.client.setup(self.pool.close());
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
