use std::sync::Arc;

use biometrics::Collector;
use guacamole::Guacamole;

use pgmongo_bench::memory::{MemoryOptions, MemoryProvider};
use pgmongo_bench::metrics::PlainTextEmitter;
use pgmongo_bench::{
    Driver, Error, IdGenerator, Operation, Phase, Provider, Record, WorkloadOptions,
};

fn insert_only(workers: u64, operations: u64) -> WorkloadOptions {
    WorkloadOptions {
        workers,
        operations,
        ..WorkloadOptions::default()
    }
    .into_load()
}

fn seeded(records: u64) -> Arc<MemoryProvider> {
    let provider = Arc::new(MemoryProvider::default());
    let ids = IdGenerator::new();
    ids.init(0).unwrap();
    let mut guac = Guacamole::new(1234);
    let mut record = Record::template(0);
    for _ in 0..records {
        assert!(provider.insert_record(&mut record, &ids, &mut guac));
    }
    provider
}

#[test]
fn budget_is_spent_exactly() {
    let options = WorkloadOptions {
        workers: 10,
        operations: 1_000,
        allow_empty: true,
        ..WorkloadOptions::default()
    };
    let driver = Driver::new(options, MemoryProvider::default()).unwrap();
    assert_eq!(Phase::Idle, driver.phase());
    let summary = driver.run().unwrap();
    assert_eq!(Phase::Completed, driver.phase());
    assert_eq!(1_000, summary.operations());
    assert_eq!(summary.operations(), summary.successes() + summary.failures());
    assert_eq!(10, summary.workers);
}

#[test]
fn budget_smaller_than_pool() {
    let driver = Driver::new(insert_only(16, 5), MemoryProvider::default()).unwrap();
    let summary = driver.run().unwrap();
    assert_eq!(5, summary.operations());
    assert_eq!(5, summary.operation(Operation::Insert).successes());
    assert_eq!(5, driver.provider().get_max_id().unwrap());
}

#[test]
fn empty_budget() {
    let driver = Driver::new(insert_only(4, 0), MemoryProvider::default()).unwrap();
    let summary = driver.run().unwrap();
    assert_eq!(Phase::Completed, driver.phase());
    assert_eq!(0, summary.operations());
}

#[test]
fn weighted_mix_within_tolerance() {
    let options = WorkloadOptions {
        workers: 4,
        operations: 100_000,
        insert_weight: 0.2,
        update_weight: 0.1,
        read_weight: 0.7,
        range_weight: 0.0,
        most_recent_weight: 0.0,
        seed: 42,
        ..WorkloadOptions::default()
    };
    let driver = Driver::new(options, seeded(1_000)).unwrap();
    let summary = driver.run().unwrap();
    assert_eq!(100_000, summary.operations());
    let share = |op| summary.operation(op).operations() as f64 / 100_000.0;
    assert!((share(Operation::Insert) - 0.2).abs() < 0.02);
    assert!((share(Operation::Update) - 0.1).abs() < 0.02);
    assert!((share(Operation::Read) - 0.7).abs() < 0.02);
    assert_eq!(0, summary.operation(Operation::ReadRange).operations());
    assert_eq!(0, summary.operation(Operation::ReadMostRecent).operations());
    // Only a read racing an insert that has an id but is not yet stored can miss.
    assert!(summary.failures() < 100, "{}", summary.failures());
}

#[test]
fn five_hundred_sequential_inserts() {
    let provider = Arc::new(MemoryProvider::default());
    let options = WorkloadOptions {
        seed: 42,
        ..insert_only(1, 500)
    };
    let driver = Driver::new(options, Arc::clone(&provider)).unwrap();
    let summary = driver.run().unwrap();
    assert_eq!(500, summary.operation(Operation::Insert).successes());
    assert_eq!(500, provider.get_max_id().unwrap());
    assert_eq!(500, driver.ids().high_water_mark());
    let most_recent = provider.most_recent().unwrap();
    assert_eq!(500, most_recent.id);
    let ids = IdGenerator::new();
    ids.init(500).unwrap();
    let mut guac = Guacamole::new(0);
    let mut record = Record::template(0);
    assert!(provider.read_most_recent_record(&mut record, &ids, &mut guac));
}

#[test]
fn runs_are_reproducible_with_one_worker() {
    let run = || {
        let provider = Arc::new(MemoryProvider::default());
        let options = WorkloadOptions {
            padding: 16,
            seed: 7,
            ..insert_only(1, 50)
        };
        Driver::new(options, Arc::clone(&provider))
            .unwrap()
            .run()
            .unwrap();
        (1..=50)
            .map(|id| provider.get(id).unwrap())
            .collect::<Vec<_>>()
    };
    let lhs = run();
    assert_eq!(lhs, run());
    assert!(lhs.iter().all(|r| r.padding.len() == 16));
}

#[test]
fn failures_are_counted_not_fatal() {
    let provider = MemoryProvider::new(MemoryOptions {
        fail_probability: 0.25,
        ..MemoryOptions::default()
    });
    let options = WorkloadOptions {
        seed: 3,
        ..insert_only(4, 10_000)
    };
    let driver = Driver::new(options, provider).unwrap();
    let summary = driver.run().unwrap();
    assert_eq!(Phase::Completed, driver.phase());
    assert_eq!(10_000, summary.operations());
    let failure_rate = summary.failures() as f64 / 10_000.0;
    assert!((failure_rate - 0.25).abs() < 0.03, "{failure_rate}");
    assert_eq!(
        summary.successes() as usize,
        driver.provider().len()
    );
    assert_eq!(10_000, driver.ids().high_water_mark());
}

#[test]
fn empty_backend_is_fatal_without_allow_empty() {
    let options = WorkloadOptions {
        workers: 2,
        operations: 100,
        ..WorkloadOptions::default()
    };
    let driver = Driver::new(options, MemoryProvider::default()).unwrap();
    assert!(matches!(driver.run(), Err(Error::EmptyBackend)));
    assert_eq!(Phase::Failed, driver.phase());
    assert!(!driver.ids().is_initialized());
}

#[test]
fn existing_records_seed_the_generator() {
    let driver = Driver::new(insert_only(2, 100), seeded(250)).unwrap();
    driver.run().unwrap();
    assert_eq!(350, driver.provider().get_max_id().unwrap());
    assert_eq!(350, driver.provider().len());
}

#[test]
fn reads_on_empty_backend_fail_softly() {
    let options = WorkloadOptions {
        workers: 2,
        operations: 200,
        insert_weight: 0.0,
        update_weight: 1.0,
        read_weight: 1.0,
        range_weight: 0.0,
        most_recent_weight: 1.0,
        allow_empty: true,
        ..WorkloadOptions::default()
    };
    let driver = Driver::new(options, MemoryProvider::default()).unwrap();
    let summary = driver.run().unwrap();
    assert_eq!(200, summary.operations());
    assert_eq!(200, summary.failures());
}

#[test]
fn run_only_once() {
    let driver = Driver::new(insert_only(1, 1), MemoryProvider::default()).unwrap();
    driver.run().unwrap();
    assert!(matches!(driver.run(), Err(Error::AlreadyStarted)));
    assert_eq!(Phase::Completed, driver.phase());
}

#[test]
fn invalid_options() {
    assert!(matches!(
        Driver::new(insert_only(0, 10), MemoryProvider::default()),
        Err(Error::InvalidOptions { .. })
    ));
    let options = WorkloadOptions {
        insert_weight: 0.0,
        update_weight: 0.0,
        read_weight: 0.0,
        range_weight: 0.0,
        most_recent_weight: 0.0,
        ..WorkloadOptions::default()
    };
    assert!(matches!(
        Driver::new(options, MemoryProvider::default()),
        Err(Error::InvalidMix { .. })
    ));
}

#[test]
fn boxed_provider_from_endpoint() {
    let provider = pgmongo_bench::connect(
        "memory://?latency_micros=1",
        "people",
        &pgmongo_bench::ConnectOptions::default(),
    )
    .unwrap();
    let driver = Driver::new(insert_only(2, 20), provider).unwrap();
    let summary = driver.run().unwrap();
    assert_eq!(20, summary.successes());
    assert_eq!("memory", summary.provider);
}

fn last_reading(output: &str, label: &str) -> Option<u64> {
    output
        .lines()
        .filter(|line| line.split_whitespace().next() == Some(label))
        .filter_map(|line| line.split_whitespace().nth(2)?.parse().ok())
        .last()
}

#[test]
fn update_misses_reach_the_emitter() {
    // Store only the odd identifiers so that half the updates find nothing.
    let provider = Arc::new(MemoryProvider::default());
    let ids = IdGenerator::new();
    ids.init(0).unwrap();
    let mut guac = Guacamole::new(99);
    let mut record = Record::template(0);
    for _ in 0..100 {
        assert!(provider.insert_record(&mut record, &ids, &mut guac));
        ids.get_new();
    }
    assert_eq!(199, provider.get_max_id().unwrap());

    let options = WorkloadOptions {
        workers: 2,
        operations: 500,
        insert_weight: 0.0,
        update_weight: 1.0,
        read_weight: 0.0,
        range_weight: 0.0,
        most_recent_weight: 0.0,
        seed: 5,
        ..WorkloadOptions::default()
    };
    let collector = Collector::new();
    pgmongo_bench::register_biometrics(&collector);
    let mut emitter = PlainTextEmitter::new(Vec::new());
    let driver = Driver::new(options, Arc::clone(&provider)).unwrap();
    let summary = driver.run_with_metrics(&collector, &mut emitter).unwrap();
    assert_eq!(500, summary.operation(Operation::Update).successes());
    assert_eq!(100, provider.len());

    let output = String::from_utf8(emitter.into_inner()).unwrap();
    let missed = last_reading(&output, "pgmongo_bench.update_missed").unwrap();
    assert!(missed >= 100, "{missed}");
    let updates = last_reading(&output, "pgmongo_bench.update").unwrap();
    assert!(updates >= 500, "{updates}");
}
