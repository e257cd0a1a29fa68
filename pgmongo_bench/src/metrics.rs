//! Per-operation statistics, the run summary, and the biometrics emitter.

use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::Write;
use std::time::Duration;

use biometrics::{Counter, Emitter, Gauge, Moments, Sensor};
use sig_fig_histogram::Histogram;

use crate::Operation;

/// Significant figures kept by every latency histogram.
pub const SIG_FIGS: i32 = 3;

////////////////////////////////////////// OperationStats //////////////////////////////////////////

/// Outcomes and latencies of one operation kind.
#[derive(Clone, Debug)]
pub struct OperationStats {
    successes: u64,
    failures: u64,
    min_nanos: u64,
    max_nanos: u64,
    total_nanos: u128,
    histogram: Histogram,
}

impl OperationStats {
    /// Count one outcome and its latency.
    pub fn record(&mut self, success: bool, elapsed: Duration) {
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.min_nanos = self.min_nanos.min(nanos);
        self.max_nanos = self.max_nanos.max(nanos);
        self.total_nanos += nanos as u128;
        // NOTE(rescrv): observe only fails on negative input.
        let _ = self.histogram.observe(nanos as f64);
    }

    /// Fold another worker's statistics into these.
    pub fn merge(&mut self, other: &Self) {
        self.successes += other.successes;
        self.failures += other.failures;
        self.min_nanos = self.min_nanos.min(other.min_nanos);
        self.max_nanos = self.max_nanos.max(other.max_nanos);
        self.total_nanos += other.total_nanos;
        self.histogram = Histogram::merge(&self.histogram, &other.histogram);
    }

    /// Operations attempted.
    pub fn operations(&self) -> u64 {
        self.successes + self.failures
    }

    pub fn successes(&self) -> u64 {
        self.successes
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Fastest observed latency.
    pub fn min(&self) -> Option<Duration> {
        (self.operations() > 0).then(|| Duration::from_nanos(self.min_nanos))
    }

    /// Slowest observed latency.
    pub fn max(&self) -> Option<Duration> {
        (self.operations() > 0).then(|| Duration::from_nanos(self.max_nanos))
    }

    /// Mean latency.
    pub fn mean(&self) -> Option<Duration> {
        let n = self.operations();
        (n > 0).then(|| Duration::from_nanos((self.total_nanos / n as u128) as u64))
    }

    /// The latency below which `quantile` of the operations fall, to [SIG_FIGS] figures.
    pub fn percentile(&self, quantile: f64) -> Option<Duration> {
        let n = self.operations();
        if n == 0 {
            return None;
        }
        let target = ((quantile * n as f64).ceil() as u64).clamp(1, n);
        let mut seen = 0u64;
        for (boundary, count) in self.histogram.iter() {
            seen += count;
            if seen >= target {
                let nanos = (boundary.round() as u64).clamp(self.min_nanos, self.max_nanos);
                return Some(Duration::from_nanos(nanos));
            }
        }
        self.max()
    }
}

impl Default for OperationStats {
    fn default() -> Self {
        Self {
            successes: 0,
            failures: 0,
            min_nanos: u64::MAX,
            max_nanos: 0,
            total_nanos: 0,
            histogram: Histogram::new(SIG_FIGS),
        }
    }
}

//////////////////////////////////////////// WorkerStats ///////////////////////////////////////////

/// Everything one worker observed, indexed by [Operation].
#[derive(Clone, Debug, Default)]
pub struct WorkerStats {
    by_operation: [OperationStats; 5],
}

impl WorkerStats {
    /// Count one outcome of `op`.
    pub fn record(&mut self, op: Operation, success: bool, elapsed: Duration) {
        self.by_operation[op.index()].record(success, elapsed);
    }

    /// Fold another worker's statistics into these.
    pub fn merge(&mut self, other: &Self) {
        for (lhs, rhs) in self.by_operation.iter_mut().zip(other.by_operation.iter()) {
            lhs.merge(rhs);
        }
    }

    /// The statistics for `op`.
    pub fn get(&self, op: Operation) -> &OperationStats {
        &self.by_operation[op.index()]
    }
}

////////////////////////////////////////////// Summary /////////////////////////////////////////////

/// The aggregate of a completed run.
#[derive(Clone, Debug)]
pub struct Summary {
    pub provider: &'static str,
    pub workers: u64,
    pub elapsed: Duration,
    stats: WorkerStats,
}

impl Summary {
    /// Summarize a finished run.
    pub fn new(provider: &'static str, workers: u64, elapsed: Duration, stats: WorkerStats) -> Self {
        Self {
            provider,
            workers,
            elapsed,
            stats,
        }
    }

    /// The statistics for `op`.
    pub fn operation(&self, op: Operation) -> &OperationStats {
        self.stats.get(op)
    }

    /// Operations attempted across every kind.
    pub fn operations(&self) -> u64 {
        Operation::ALL
            .iter()
            .map(|op| self.operation(*op).operations())
            .sum()
    }

    /// Successful operations across every kind.
    pub fn successes(&self) -> u64 {
        Operation::ALL
            .iter()
            .map(|op| self.operation(*op).successes())
            .sum()
    }

    /// Failed operations across every kind.
    pub fn failures(&self) -> u64 {
        Operation::ALL
            .iter()
            .map(|op| self.operation(*op).failures())
            .sum()
    }

    /// Operations per second of wall-clock time.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.operations() as f64 / secs
        } else {
            0.0
        }
    }
}

fn micros(d: Option<Duration>) -> String {
    match d {
        Some(d) => format!("{:.1}", d.as_nanos() as f64 / 1_000.0),
        None => "-".to_string(),
    }
}

impl Display for Summary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{:<18} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
            "operation",
            "ops",
            "success",
            "failure",
            "min_us",
            "mean_us",
            "p50_us",
            "p90_us",
            "p99_us",
            "p99.9_us",
            "max_us",
        )?;
        for op in Operation::ALL {
            let stats = self.operation(op);
            writeln!(
                f,
                "{:<18} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10} {:>10}",
                op.name(),
                stats.operations(),
                stats.successes(),
                stats.failures(),
                micros(stats.min()),
                micros(stats.mean()),
                micros(stats.percentile(0.50)),
                micros(stats.percentile(0.90)),
                micros(stats.percentile(0.99)),
                micros(stats.percentile(0.999)),
                micros(stats.max()),
            )?;
        }
        writeln!(
            f,
            "{:<18} {:>10} {:>10} {:>10}",
            "total",
            self.operations(),
            self.successes(),
            self.failures(),
        )?;
        write!(
            f,
            "provider={} workers={} elapsed={:.3}s throughput={:.1}ops/s",
            self.provider,
            self.workers,
            self.elapsed.as_secs_f64(),
            self.throughput(),
        )
    }
}

///////////////////////////////////////// PlainTextEmitter /////////////////////////////////////////

/// An emitter that puts readings one-per-line as `label seconds reading...`.
///
/// Time starts from 0 at the first emit instead of the wall clock, so runs line up.
pub struct PlainTextEmitter<W: Write = File> {
    output: W,
    start_millis: Option<u64>,
}

impl<W: Write> PlainTextEmitter<W> {
    /// Create a new emitter with the output.
    pub fn new(output: W) -> Self {
        Self {
            output,
            start_millis: None,
        }
    }

    /// Give back the output.
    pub fn into_inner(self) -> W {
        self.output
    }

    fn offset(&mut self, now: u64) -> u64 {
        let start = *self.start_millis.get_or_insert(now);
        now.saturating_sub(start) / 1_000
    }
}

impl<W: Write> Emitter for PlainTextEmitter<W> {
    type Error = std::io::Error;

    fn emit_counter(&mut self, counter: &Counter, now: u64) -> Result<(), std::io::Error> {
        let offset = self.offset(now);
        writeln!(self.output, "{} {} {}", counter.label(), offset, counter.read())
    }

    fn emit_gauge(&mut self, gauge: &Gauge, now: u64) -> Result<(), std::io::Error> {
        let offset = self.offset(now);
        writeln!(self.output, "{} {} {}", gauge.label(), offset, gauge.read())
    }

    fn emit_moments(&mut self, moments: &Moments, now: u64) -> Result<(), std::io::Error> {
        let offset = self.offset(now);
        let label = moments.label();
        let moments = moments.read();
        writeln!(
            self.output,
            "{} {} {} {} {} {} {}",
            label, offset, moments.n, moments.m1, moments.m2, moments.m3, moments.m4,
        )
    }

    fn emit_histogram(
        &mut self,
        histogram: &biometrics::Histogram,
        now: u64,
    ) -> Result<(), std::io::Error> {
        let offset = self.offset(now);
        let label = histogram.label();
        for (bucket, count) in histogram.read().iter() {
            if count > 0 {
                writeln!(self.output, "{label} {offset} {bucket} {count}")?;
            }
        }
        Ok(())
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn micros(x: u64) -> Duration {
        Duration::from_micros(x)
    }

    #[test]
    fn empty_stats() {
        let stats = OperationStats::default();
        assert_eq!(0, stats.operations());
        assert_eq!(None, stats.min());
        assert_eq!(None, stats.mean());
        assert_eq!(None, stats.percentile(0.5));
    }

    #[test]
    fn percentiles_of_uniform_latencies() {
        let mut stats = OperationStats::default();
        for x in 1..=1000 {
            stats.record(x % 10 != 0, micros(x));
        }
        assert_eq!(1000, stats.operations());
        assert_eq!(900, stats.successes());
        assert_eq!(100, stats.failures());
        assert_eq!(Some(micros(1)), stats.min());
        assert_eq!(Some(micros(1000)), stats.max());
        assert_eq!(Some(Duration::from_nanos(500_500)), stats.mean());
        assert_eq!(Some(micros(500)), stats.percentile(0.5));
        assert_eq!(Some(micros(900)), stats.percentile(0.9));
        assert_eq!(Some(micros(990)), stats.percentile(0.99));
        assert_eq!(Some(micros(1000)), stats.percentile(1.0));
    }

    #[test]
    fn merge_workers() {
        let mut lhs = WorkerStats::default();
        let mut rhs = WorkerStats::default();
        lhs.record(Operation::Insert, true, micros(10));
        lhs.record(Operation::Read, false, micros(20));
        rhs.record(Operation::Insert, true, micros(30));
        rhs.record(Operation::ReadRange, true, micros(40));
        lhs.merge(&rhs);
        let insert = lhs.get(Operation::Insert);
        assert_eq!(2, insert.operations());
        assert_eq!(Some(micros(10)), insert.min());
        assert_eq!(Some(micros(30)), insert.max());
        assert_eq!(Some(micros(20)), insert.mean());
        assert_eq!(1, lhs.get(Operation::Read).failures());
        assert_eq!(1, lhs.get(Operation::ReadRange).successes());
        assert_eq!(0, lhs.get(Operation::Update).operations());
    }

    #[test]
    fn summary_totals() {
        let mut stats = WorkerStats::default();
        for _ in 0..3 {
            stats.record(Operation::Insert, true, micros(5));
        }
        stats.record(Operation::Update, false, micros(5));
        let summary = Summary::new("memory", 2, Duration::from_secs(2), stats);
        assert_eq!(4, summary.operations());
        assert_eq!(3, summary.successes());
        assert_eq!(1, summary.failures());
        assert_eq!(2.0, summary.throughput());
        let text = summary.to_string();
        assert!(text.contains("insert"));
        assert!(text.contains("read_most_recent"));
        assert!(text.contains("throughput=2.0ops/s"));
    }

    #[test]
    fn plain_text_emitter_counts_from_first_emit() {
        static EMITTED: Counter = Counter::new("pgmongo_bench.test.emitted");
        static OBSERVED: Moments = Moments::new("pgmongo_bench.test.observed");
        let collector = biometrics::Collector::new();
        collector.register_counter(&EMITTED);
        collector.register_moments(&OBSERVED);
        EMITTED.count(3);
        OBSERVED.add(2.0);
        let mut emitter = PlainTextEmitter::new(Vec::new());
        collector.emit(&mut emitter, 5_000).unwrap();
        EMITTED.click();
        collector.emit(&mut emitter, 7_500).unwrap();
        let output = String::from_utf8(emitter.into_inner()).unwrap();
        let counters = output
            .lines()
            .filter(|line| line.starts_with("pgmongo_bench.test.emitted "))
            .collect::<Vec<_>>();
        assert_eq!(
            vec![
                "pgmongo_bench.test.emitted 0 3",
                "pgmongo_bench.test.emitted 2 4"
            ],
            counters
        );
        assert!(output
            .lines()
            .any(|line| line.starts_with("pgmongo_bench.test.observed 2 1 2 ")));
    }
}
