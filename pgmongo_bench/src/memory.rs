//! An in-process provider.  Measures harness overhead and backs the tests.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use biometrics::{Collector, Counter};
use guacamole::combinators::prob;
use guacamole::Guacamole;
use url::Url;

use crate::endpoint::take_query_param;
use crate::record::random_balance;
use crate::{
    outcome, sample_existing, update_missed, Error, IdGenerator, Operation, Provider, Record,
};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static INJECTED_FAILURE: Counter = Counter::new("pgmongo_bench.memory.injected_failure");

/////////////////////////////////////////// MemoryOptions //////////////////////////////////////////

#[derive(Clone, Debug, Default, PartialEq)]
/// Failure injection and latency for the in-memory provider.
pub struct MemoryOptions {
    /// Probability in `[0, 1]` that an operation fails before touching the map.
    pub fail_probability: f32,
    /// Sleep this long in every operation.
    pub latency: Duration,
}

impl MemoryOptions {
    /// Read `fail_probability` and `latency_micros` from the endpoint's query string.
    /// Create an empty provider configured from a `memory://` endpoint.
    pub fn from_url(url: &Url) -> Result<Self, Error> {
        let mut url = url.clone();
        let mut options = Self::default();
        if let Some(p) = take_query_param(&mut url, "fail_probability") {
            options.fail_probability = match p.parse::<f32>() {
                Ok(p) if (0.0..=1.0).contains(&p) => p,
                _ => {
                    return Err(Error::Endpoint {
                        what: format!("fail_probability={p} is not in [0, 1]"),
                    });
                }
            };
        }
        if let Some(micros) = take_query_param(&mut url, "latency_micros") {
            let micros = micros.parse::<u64>().map_err(|_| Error::Endpoint {
                what: format!("latency_micros={micros} is not an integer"),
            })?;
            options.latency = Duration::from_micros(micros);
        }
        if let Some(query) = url.query() {
            return Err(Error::Endpoint {
                what: format!("unknown memory provider options: {query}"),
            });
        }
        Ok(options)
    }
}

////////////////////////////////////////// MemoryProvider //////////////////////////////////////////

/// Holds serialized records in an ordered map keyed by identifier.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    options: MemoryOptions,
    records: RwLock<BTreeMap<u64, Vec<u8>>>,
}

impl MemoryProvider {
    /// Create an empty provider.
    pub fn new(options: MemoryOptions) -> Self {
        Self {
            options,
            records: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn from_url(url: &Url) -> Result<Self, Error> {
        Ok(Self::new(MemoryOptions::from_url(url)?))
    }

    /// The number of stored records.
    pub fn len(&self) -> usize {
        self.read_lock().map(|records| records.len()).unwrap_or(0)
    }

    /// True when no record is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch one record by identifier.
    pub fn get(&self, id: u64) -> Result<Record, Error> {
        let records = self.read_lock()?;
        let bytes = records.get(&id).ok_or(Error::NotFound { id })?;
        Record::from_json(bytes)
    }

    /// Fetch the record with the largest identifier.
    pub fn most_recent(&self) -> Result<Record, Error> {
        let records = self.read_lock()?;
        let (_, bytes) = records.last_key_value().ok_or(Error::EmptyBackend)?;
        Record::from_json(bytes)
    }

    /// Count the records in the read range.
    pub fn scan(&self) -> Result<u64, Error> {
        let records = self.read_lock()?;
        let mut count = 0;
        for bytes in records.values() {
            if Record::from_json(bytes)?.in_read_range() {
                count += 1;
            }
        }
        Ok(count)
    }

    fn read_lock(&self) -> Result<RwLockReadGuard<'_, BTreeMap<u64, Vec<u8>>>, Error> {
        self.records.read().map_err(|_| Error::Backend {
            what: "memory provider lock poisoned".to_string(),
        })
    }

    fn write_lock(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<u64, Vec<u8>>>, Error> {
        self.records.write().map_err(|_| Error::Backend {
            what: "memory provider lock poisoned".to_string(),
        })
    }

    fn simulate(&self, guac: &mut Guacamole) -> Result<(), Error> {
        if !self.options.latency.is_zero() {
            std::thread::sleep(self.options.latency);
        }
        if self.options.fail_probability > 0.0 && prob(self.options.fail_probability)(guac) {
            INJECTED_FAILURE.click();
            return Err(Error::Backend {
                what: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn insert(&self, record: &Record, guac: &mut Guacamole) -> Result<(), Error> {
        self.simulate(guac)?;
        let bytes = record.to_json()?;
        self.write_lock()?.insert(record.id, bytes);
        Ok(())
    }

    fn update(&self, id: u64, guac: &mut Guacamole) -> Result<(), Error> {
        self.simulate(guac)?;
        let balance = random_balance(guac);
        let mut records = self.write_lock()?;
        match records.get_mut(&id) {
            Some(bytes) => {
                let mut record = Record::from_json(bytes)?;
                record.balance = balance;
                *bytes = record.to_json()?;
            }
            None => update_missed(id),
        }
        Ok(())
    }

    fn read(&self, id: u64, guac: &mut Guacamole) -> Result<Record, Error> {
        self.simulate(guac)?;
        self.get(id)
    }
}

impl Provider for MemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn insert_record(&self, record: &mut Record, ids: &IdGenerator, guac: &mut Guacamole) -> bool {
        record.randomise(guac);
        record.id = ids.get_new();
        outcome(Operation::Insert, Some(record.id), self.insert(record, guac))
    }

    fn update_record(&self, _: &mut Record, ids: &IdGenerator, guac: &mut Guacamole) -> bool {
        let Some(id) = sample_existing(Operation::Update, ids, guac) else {
            return false;
        };
        outcome(Operation::Update, Some(id), self.update(id, guac))
    }

    fn read_record(&self, _: &mut Record, ids: &IdGenerator, guac: &mut Guacamole) -> bool {
        let Some(id) = sample_existing(Operation::Read, ids, guac) else {
            return false;
        };
        outcome(Operation::Read, Some(id), self.read(id, guac))
    }

    fn read_range(&self, _: &mut Record, _: &IdGenerator, guac: &mut Guacamole) -> bool {
        let result = self.simulate(guac).and_then(|_| self.scan());
        outcome(Operation::ReadRange, None, result)
    }

    fn read_most_recent_record(
        &self,
        _: &mut Record,
        _: &IdGenerator,
        guac: &mut Guacamole,
    ) -> bool {
        let result = self.simulate(guac).and_then(|_| self.most_recent());
        outcome(Operation::ReadMostRecent, None, result)
    }

    fn get_max_id(&self) -> Result<u64, Error> {
        let records = self.read_lock()?;
        records
            .last_key_value()
            .map(|(id, _)| *id)
            .ok_or(Error::EmptyBackend)
    }

    fn register_biometrics(&self, collector: &Collector) {
        collector.register_counter(&INJECTED_FAILURE);
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn options_from_url() {
        assert_eq!(
            MemoryOptions::default(),
            MemoryOptions::from_url(&url("memory://")).unwrap()
        );
        let options =
            MemoryOptions::from_url(&url("memory://?fail_probability=0.25&latency_micros=50"))
                .unwrap();
        assert_eq!(0.25, options.fail_probability);
        assert_eq!(Duration::from_micros(50), options.latency);
        assert!(MemoryOptions::from_url(&url("memory://?fail_probability=2")).is_err());
        assert!(MemoryOptions::from_url(&url("memory://?latency_micros=soon")).is_err());
        assert!(MemoryOptions::from_url(&url("memory://?durable=true")).is_err());
    }

    #[test]
    fn insert_then_read_back() {
        let provider = MemoryProvider::default();
        let ids = IdGenerator::new();
        ids.init(0).unwrap();
        let mut guac = Guacamole::new(0);
        let mut record = Record::template(8);
        for _ in 0..10 {
            assert!(provider.insert_record(&mut record, &ids, &mut guac));
        }
        assert_eq!(10, provider.len());
        assert_eq!(10, provider.get_max_id().unwrap());
        assert_eq!(record, provider.get(10).unwrap());
        assert_eq!(record, provider.most_recent().unwrap());
        assert!(provider.read_record(&mut record, &ids, &mut guac));
        assert!(provider.read_range(&mut record, &ids, &mut guac));
        assert!(provider.read_most_recent_record(&mut record, &ids, &mut guac));
    }

    #[test]
    fn update_changes_only_balance() {
        let provider = MemoryProvider::default();
        let ids = IdGenerator::new();
        ids.init(0).unwrap();
        let mut guac = Guacamole::new(1);
        let mut record = Record::template(0);
        assert!(provider.insert_record(&mut record, &ids, &mut guac));
        let before = provider.get(1).unwrap();
        assert!(provider.update_record(&mut record, &ids, &mut guac));
        let after = provider.get(1).unwrap();
        assert_ne!(before.balance, after.balance);
        assert_eq!(before.name, after.name);
        assert_eq!(before.age, after.age);
    }

    #[test]
    fn update_miss_is_tolerated() {
        let provider = MemoryProvider::default();
        let ids = IdGenerator::new();
        ids.init(1_000).unwrap();
        let mut guac = Guacamole::new(2);
        let mut record = Record::template(0);
        assert!(provider.update_record(&mut record, &ids, &mut guac));
        assert!(provider.is_empty());
    }

    #[test]
    fn read_miss_fails() {
        let provider = MemoryProvider::default();
        let ids = IdGenerator::new();
        ids.init(1_000).unwrap();
        let mut guac = Guacamole::new(2);
        let mut record = Record::template(0);
        assert!(!provider.read_record(&mut record, &ids, &mut guac));
    }

    #[test]
    fn empty_provider() {
        let provider = MemoryProvider::default();
        let ids = IdGenerator::new();
        ids.init(0).unwrap();
        let mut guac = Guacamole::new(3);
        let mut record = Record::template(0);
        assert!(matches!(provider.get_max_id(), Err(Error::EmptyBackend)));
        assert!(!provider.read_record(&mut record, &ids, &mut guac));
        assert!(!provider.update_record(&mut record, &ids, &mut guac));
        assert!(!provider.read_most_recent_record(&mut record, &ids, &mut guac));
        assert!(provider.read_range(&mut record, &ids, &mut guac));
    }

    #[test]
    fn scan_counts_range() {
        let provider = MemoryProvider::default();
        let ids = IdGenerator::new();
        ids.init(0).unwrap();
        let mut guac = Guacamole::new(4);
        let mut record = Record::template(0);
        let mut expected = 0;
        for _ in 0..200 {
            assert!(provider.insert_record(&mut record, &ids, &mut guac));
            if record.in_read_range() {
                expected += 1;
            }
        }
        assert_eq!(expected, provider.scan().unwrap());
    }

    #[test]
    fn insert_failure_still_consumes_an_id() {
        let provider = MemoryProvider::new(MemoryOptions {
            fail_probability: 1.0,
            latency: Duration::ZERO,
        });
        let ids = IdGenerator::new();
        ids.init(0).unwrap();
        let mut guac = Guacamole::new(5);
        let mut record = Record::template(0);
        assert!(!provider.insert_record(&mut record, &ids, &mut guac));
        assert_eq!(1, ids.high_water_mark());
        assert!(provider.is_empty());
    }
}
