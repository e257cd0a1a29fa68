#![doc = include_str!("../README.md")]

use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use biometrics::{Collector, Counter, Moments};
use guacamole::Guacamole;
use indicio::{clue, ERROR, INFO};

mod endpoint;

pub mod idgen;
pub mod memory;
pub mod metrics;
pub mod record;
pub mod workload;

#[cfg(any(feature = "postgres", feature = "mongo"))]
mod blocking;
#[cfg(feature = "mongo")]
pub mod mongo;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use endpoint::check_table_name;
pub use idgen::IdGenerator;
pub use metrics::Summary;
pub use record::Record;
pub use workload::mix::{Driver, Mix, Phase, WorkloadOptions};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static INSERT: Counter = Counter::new("pgmongo_bench.insert");
static UPDATE: Counter = Counter::new("pgmongo_bench.update");
static READ: Counter = Counter::new("pgmongo_bench.read");
static READ_RANGE: Counter = Counter::new("pgmongo_bench.read_range");
static READ_MOST_RECENT: Counter = Counter::new("pgmongo_bench.read_most_recent");

static INSERT_LATENCY: Moments = Moments::new("pgmongo_bench.insert_latency_micros");
static UPDATE_LATENCY: Moments = Moments::new("pgmongo_bench.update_latency_micros");
static READ_LATENCY: Moments = Moments::new("pgmongo_bench.read_latency_micros");
static READ_RANGE_LATENCY: Moments = Moments::new("pgmongo_bench.read_range_latency_micros");
static READ_MOST_RECENT_LATENCY: Moments =
    Moments::new("pgmongo_bench.read_most_recent_latency_micros");

static INSERT_FAILED: Counter = Counter::new("pgmongo_bench.insert.failed");
static UPDATE_FAILED: Counter = Counter::new("pgmongo_bench.update.failed");
static READ_FAILED: Counter = Counter::new("pgmongo_bench.read.failed");
static READ_RANGE_FAILED: Counter = Counter::new("pgmongo_bench.read_range.failed");
static READ_MOST_RECENT_FAILED: Counter = Counter::new("pgmongo_bench.read_most_recent.failed");

static UPDATE_MISSED: Counter = Counter::new("pgmongo_bench.update_missed");
static EMPTY_POPULATION: Counter = Counter::new("pgmongo_bench.empty_population");
static TIMEOUT: Counter = Counter::new("pgmongo_bench.timeout");
static DECODE_ERROR: Counter = Counter::new("pgmongo_bench.decode_error");
static IO_ERROR: Counter = Counter::new("pgmongo_bench.io_error");

/// Register this crate's sensors with the collector.
pub fn register_biometrics(collector: &Collector) {
    for op in Operation::ALL {
        collector.register_counter(op.requests());
        collector.register_counter(op.failures());
        collector.register_moments(op.latency());
    }
    collector.register_counter(&UPDATE_MISSED);
    collector.register_counter(&EMPTY_POPULATION);
    collector.register_counter(&TIMEOUT);
    collector.register_counter(&DECODE_ERROR);
    collector.register_counter(&IO_ERROR);
}

////////////////////////////////////////////// indicio /////////////////////////////////////////////

pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

/////////////////////////////////////////////// Error //////////////////////////////////////////////

#[derive(Debug)]
/// Errors reported by providers and the driver.
pub enum Error {
    /// The endpoint or table name could not be used.
    Endpoint { what: String },
    /// The backend could not be reached.
    Connect { what: String },
    /// The backend was reached but did not answer a health check.
    Ping { what: String },
    /// The table or collection is missing or could not be created.
    Schema { what: String },
    /// The backend holds no records.
    EmptyBackend,
    NotInitialized,
    AlreadyInitialized,
    /// No identifier has been issued yet.
    EmptyPopulation,
    NotFound { id: u64 },
    Timeout,
    Decode { what: String },
    Backend { what: String },
    InvalidMix { what: String },
    InvalidOptions { what: String },
    AlreadyStarted,
    Io(std::io::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Endpoint { what } => write!(f, "bad endpoint: {what}"),
            Error::Connect { what } => write!(f, "connect failed: {what}"),
            Error::Ping { what } => write!(f, "ping failed: {what}"),
            Error::Schema { what } => write!(f, "schema lookup failed: {what}"),
            Error::EmptyBackend => write!(f, "backend holds no records"),
            Error::NotInitialized => write!(f, "identifier generator not initialized"),
            Error::AlreadyInitialized => write!(f, "identifier generator already initialized"),
            Error::EmptyPopulation => write!(f, "no identifiers have been issued"),
            Error::NotFound { id } => write!(f, "no record with id {id}"),
            Error::Timeout => write!(f, "operation timed out"),
            Error::Decode { what } => write!(f, "decode failed: {what}"),
            Error::Backend { what } => write!(f, "backend error: {what}"),
            Error::InvalidMix { what } => write!(f, "invalid operation mix: {what}"),
            Error::InvalidOptions { what } => write!(f, "invalid workload options: {what}"),
            Error::AlreadyStarted => write!(f, "driver has already been started"),
            Error::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        IO_ERROR.click();
        Self::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        DECODE_ERROR.click();
        Self::Decode {
            what: err.to_string(),
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::Endpoint {
            what: err.to_string(),
        }
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Backend {
            what: err.to_string(),
        }
    }
}

#[cfg(feature = "mongo")]
impl From<mongodb::error::Error> for Error {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Backend {
            what: err.to_string(),
        }
    }
}

#[cfg(feature = "mongo")]
impl From<mongodb::bson::document::ValueAccessError> for Error {
    fn from(err: mongodb::bson::document::ValueAccessError) -> Self {
        DECODE_ERROR.click();
        Self::Decode {
            what: err.to_string(),
        }
    }
}

///////////////////////////////////////////// Operation ////////////////////////////////////////////

/// The five canonical operations every provider implements.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Operation {
    Insert,
    Update,
    Read,
    ReadRange,
    ReadMostRecent,
}

impl Operation {
    pub const ALL: [Operation; 5] = [
        Operation::Insert,
        Operation::Update,
        Operation::Read,
        Operation::ReadRange,
        Operation::ReadMostRecent,
    ];

    /// The position of this kind in [Operation::ALL].
    pub fn index(self) -> usize {
        match self {
            Operation::Insert => 0,
            Operation::Update => 1,
            Operation::Read => 2,
            Operation::ReadRange => 3,
            Operation::ReadMostRecent => 4,
        }
    }

    /// The name used in logs, sensors, and the summary.
    pub fn name(self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Read => "read",
            Operation::ReadRange => "read_range",
            Operation::ReadMostRecent => "read_most_recent",
        }
    }

    fn requests(self) -> &'static Counter {
        match self {
            Operation::Insert => &INSERT,
            Operation::Update => &UPDATE,
            Operation::Read => &READ,
            Operation::ReadRange => &READ_RANGE,
            Operation::ReadMostRecent => &READ_MOST_RECENT,
        }
    }

    fn failures(self) -> &'static Counter {
        match self {
            Operation::Insert => &INSERT_FAILED,
            Operation::Update => &UPDATE_FAILED,
            Operation::Read => &READ_FAILED,
            Operation::ReadRange => &READ_RANGE_FAILED,
            Operation::ReadMostRecent => &READ_MOST_RECENT_FAILED,
        }
    }

    fn latency(self) -> &'static Moments {
        match self {
            Operation::Insert => &INSERT_LATENCY,
            Operation::Update => &UPDATE_LATENCY,
            Operation::Read => &READ_LATENCY,
            Operation::ReadRange => &READ_RANGE_LATENCY,
            Operation::ReadMostRecent => &READ_MOST_RECENT_LATENCY,
        }
    }

    pub(crate) fn observe(self, elapsed: Duration) {
        self.requests().click();
        self.latency().add(elapsed.as_micros() as f64);
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

///////////////////////////////////////////// Provider /////////////////////////////////////////////

/// A backend that can run the benchmark's operations.
///
/// Operations never fail loudly.  A backend error is logged to [COLLECTOR] and becomes `false`.
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Randomise `record`, assign it a fresh identifier, and persist it.
    fn insert_record(&self, record: &mut Record, ids: &IdGenerator, guac: &mut Guacamole)
        -> bool;
    /// Set the balance of one existing record.  A sampled identifier that matches nothing is
    /// tolerated.
    fn update_record(&self, record: &mut Record, ids: &IdGenerator, guac: &mut Guacamole)
        -> bool;
    fn read_record(&self, record: &mut Record, ids: &IdGenerator, guac: &mut Guacamole) -> bool;
    /// Scan every record with an age strictly between the range bounds.
    fn read_range(&self, record: &mut Record, ids: &IdGenerator, guac: &mut Guacamole) -> bool;
    fn read_most_recent_record(
        &self,
        record: &mut Record,
        ids: &IdGenerator,
        guac: &mut Guacamole,
    ) -> bool;

    /// The largest identifier persisted.  [Error::EmptyBackend] when there is none.
    fn get_max_id(&self) -> Result<u64, Error>;

    fn register_biometrics(&self, _: &Collector) {}

    fn perform(
        &self,
        op: Operation,
        record: &mut Record,
        ids: &IdGenerator,
        guac: &mut Guacamole,
    ) -> bool {
        match op {
            Operation::Insert => self.insert_record(record, ids, guac),
            Operation::Update => self.update_record(record, ids, guac),
            Operation::Read => self.read_record(record, ids, guac),
            Operation::ReadRange => self.read_range(record, ids, guac),
            Operation::ReadMostRecent => self.read_most_recent_record(record, ids, guac),
        }
    }
}

macro_rules! forward_provider {
    ($wrapper:ident) => {
        impl<P: Provider + ?Sized> Provider for $wrapper<P> {
            fn name(&self) -> &'static str {
                P::name(self)
            }

            fn insert_record(
                &self,
                record: &mut Record,
                ids: &IdGenerator,
                guac: &mut Guacamole,
            ) -> bool {
                P::insert_record(self, record, ids, guac)
            }

            fn update_record(
                &self,
                record: &mut Record,
                ids: &IdGenerator,
                guac: &mut Guacamole,
            ) -> bool {
                P::update_record(self, record, ids, guac)
            }

            fn read_record(
                &self,
                record: &mut Record,
                ids: &IdGenerator,
                guac: &mut Guacamole,
            ) -> bool {
                P::read_record(self, record, ids, guac)
            }

            fn read_range(
                &self,
                record: &mut Record,
                ids: &IdGenerator,
                guac: &mut Guacamole,
            ) -> bool {
                P::read_range(self, record, ids, guac)
            }

            fn read_most_recent_record(
                &self,
                record: &mut Record,
                ids: &IdGenerator,
                guac: &mut Guacamole,
            ) -> bool {
                P::read_most_recent_record(self, record, ids, guac)
            }

            fn get_max_id(&self) -> Result<u64, Error> {
                P::get_max_id(self)
            }

            fn register_biometrics(&self, collector: &Collector) {
                P::register_biometrics(self, collector);
            }
        }
    };
}

forward_provider!(Arc);
forward_provider!(Box);

/// Turn the result of one operation into its boolean outcome, logging the failure.
pub(crate) fn outcome<T>(op: Operation, id: Option<u64>, result: Result<T, Error>) -> bool {
    let err = match result {
        Ok(_) => return true,
        Err(err) => err,
    };
    op.failures().click();
    match err {
        Error::Timeout => TIMEOUT.click(),
        // Sampling before the generator is seeded finds no population either.
        Error::EmptyPopulation | Error::NotInitialized => EMPTY_POPULATION.click(),
        _ => {}
    }
    if let Some(id) = id {
        clue!(COLLECTOR, ERROR, {
            operation: op.name(),
            id: id,
            error: err.to_string(),
        });
    } else {
        clue!(COLLECTOR, ERROR, {
            operation: op.name(),
            error: err.to_string(),
        });
    }
    false
}

/// Sample an existing identifier, recording the failed operation when there is none.
pub(crate) fn sample_existing(
    op: Operation,
    ids: &IdGenerator,
    guac: &mut Guacamole,
) -> Option<u64> {
    match ids.get_existing(guac) {
        Ok(id) => Some(id),
        Err(err) => {
            outcome::<()>(op, None, Err(err));
            None
        }
    }
}

pub(crate) fn update_missed(id: u64) {
    UPDATE_MISSED.click();
    clue!(COLLECTOR, INFO, {
        update_missed: id,
    });
}

////////////////////////////////////////// ConnectOptions //////////////////////////////////////////

/// Options shared by every provider constructor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectOptions {
    /// Upper bound on each backend call.
    pub timeout: Duration,
    /// Connections to keep open.
    pub pool_size: u32,
    /// Create the table or collection when missing.
    pub create_table: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            pool_size: 16,
            create_table: false,
        }
    }
}

////////////////////////////////////////////// connect /////////////////////////////////////////////

/// Construct the provider that serves `endpoint`, chosen by the URL scheme.
///
/// The returned provider has already been connected and health checked.
#[cfg_attr(
    not(any(feature = "postgres", feature = "mongo")),
    allow(unused_variables)
)]
pub fn connect(
    endpoint: &str,
    table: &str,
    options: &ConnectOptions,
) -> Result<Box<dyn Provider>, Error> {
    let url = endpoint::parse(endpoint)?;
    check_table_name(table)?;
    let provider: Box<dyn Provider> = match url.scheme() {
        "memory" => Box::new(memory::MemoryProvider::from_url(&url)?),
        #[cfg(feature = "postgres")]
        "postgres" | "postgresql" => Box::new(postgres::PostgresProvider::new(url, table, options)?),
        #[cfg(feature = "mongo")]
        "mongodb" | "mongodb+srv" => Box::new(mongo::MongoProvider::new(url, table, options)?),
        scheme => {
            return Err(Error::Endpoint {
                what: format!("unsupported scheme {scheme:?}"),
            });
        }
    };
    clue!(COLLECTOR, INFO, {
        connected: provider.name(),
        table: table,
    });
    Ok(provider)
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
