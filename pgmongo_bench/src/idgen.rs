//! Identifier issue and sampling, shared by every worker.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use guacamole::combinators::range_to;
use guacamole::Guacamole;

use crate::Error;

//////////////////////////////////////////// IdGenerator ///////////////////////////////////////////

/// Issues new identifiers and samples identifiers that were issued before.
///
/// The high-water mark is the only state shared between workers.  Every read of it is fresh, so
/// sampling sees the identifiers concurrent inserts have issued.
#[derive(Debug, Default)]
pub struct IdGenerator {
    high_water_mark: AtomicU64,
    initialized: AtomicBool,
}

impl IdGenerator {
    /// Create an uninitialized generator.
    pub const fn new() -> Self {
        Self {
            high_water_mark: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
        }
    }

    /// Set the baseline.  Only the first call succeeds.
    pub fn init(&self, starting_max: u64) -> Result<(), Error> {
        if self
            .initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyInitialized);
        }
        self.high_water_mark.store(starting_max, Ordering::Release);
        Ok(())
    }

    /// True once [IdGenerator::init] has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Issue the next identifier.
    pub fn get_new(&self) -> u64 {
        self.high_water_mark.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Draw uniformly from `[1, high_water_mark]`.
    pub fn get_existing(&self, guac: &mut Guacamole) -> Result<u64, Error> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        let mark = self.high_water_mark.load(Ordering::Acquire);
        if mark == 0 {
            return Err(Error::EmptyPopulation);
        }
        Ok(1 + range_to(mark)(guac))
    }

    /// The largest identifier issued so far.
    pub fn high_water_mark(&self) -> u64 {
        self.high_water_mark.load(Ordering::Acquire)
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn concurrent_get_new_is_unique() {
        const WORKERS: usize = 8;
        const CALLS: usize = 10_000;
        let ids = Arc::new(IdGenerator::new());
        ids.init(0).unwrap();
        let mut threads = vec![];
        for _ in 0..WORKERS {
            let ids = Arc::clone(&ids);
            threads.push(std::thread::spawn(move || {
                (0..CALLS).map(|_| ids.get_new()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for thread in threads {
            for id in thread.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(WORKERS * CALLS, seen.len());
        assert_eq!((WORKERS * CALLS) as u64, ids.high_water_mark());
    }

    #[test]
    fn first_new_is_above_baseline() {
        let ids = IdGenerator::new();
        ids.init(100).unwrap();
        assert_eq!(101, ids.get_new());
        assert_eq!(102, ids.get_new());
    }

    #[test]
    fn existing_is_bounded() {
        let ids = IdGenerator::new();
        ids.init(37).unwrap();
        let mut guac = Guacamole::new(0);
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let id = ids.get_existing(&mut guac).unwrap();
            assert!((1..=37).contains(&id));
            seen.insert(id);
        }
        assert_eq!(37, seen.len());
    }

    #[test]
    fn existing_sees_new_ids() {
        let ids = IdGenerator::new();
        ids.init(1).unwrap();
        ids.get_new();
        let mut guac = Guacamole::new(3);
        let sampled = (0..1_000)
            .map(|_| ids.get_existing(&mut guac).unwrap())
            .collect::<HashSet<_>>();
        assert_eq!(HashSet::from([1, 2]), sampled);
    }

    #[test]
    fn empty_population() {
        let ids = IdGenerator::new();
        ids.init(0).unwrap();
        let mut guac = Guacamole::new(0);
        assert!(matches!(
            ids.get_existing(&mut guac),
            Err(Error::EmptyPopulation)
        ));
    }

    #[test]
    fn not_initialized() {
        let ids = IdGenerator::new();
        let mut guac = Guacamole::new(0);
        assert!(matches!(
            ids.get_existing(&mut guac),
            Err(Error::NotInitialized)
        ));
    }

    #[test]
    fn init_twice() {
        let ids = IdGenerator::new();
        ids.init(5).unwrap();
        assert!(matches!(ids.init(10), Err(Error::AlreadyInitialized)));
        assert_eq!(5, ids.high_water_mark());
    }
}
