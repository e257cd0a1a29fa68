//! A weighted mix of the five operations, run by a fixed pool of worker threads until a shared
//! operation budget is spent.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use biometrics::{Collector, Emitter};
use guacamole::combinators::any;
use guacamole::Guacamole;
use indicio::{clue, ERROR, INFO};

use crate::metrics::{Summary, WorkerStats};
use crate::{Error, IdGenerator, Operation, Provider, Record, COLLECTOR};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

////////////////////////////////////////// WorkloadOptions /////////////////////////////////////////

/// Options for one run of the driver.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "command_line", derive(arrrg_derive::CommandLine))]
pub struct WorkloadOptions {
    /// The number of worker threads to spawn.
    #[cfg_attr(feature = "command_line", arrrg(optional, "Number of worker threads."))]
    pub workers: u64,
    /// The operation budget shared by all workers.
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Total number of operations to run.")
    )]
    pub operations: u64,
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Weight to assign to insert operations.")
    )]
    pub insert_weight: f64,
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Weight to assign to update operations.")
    )]
    pub update_weight: f64,
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Weight to assign to read operations.")
    )]
    pub read_weight: f64,
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Weight to assign to range reads.")
    )]
    pub range_weight: f64,
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Weight to assign to most-recent reads.")
    )]
    pub most_recent_weight: f64,
    /// When non-zero, the expected number of updates; overrides --update-weight.
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Expected number of updates (overrides --update-weight).")
    )]
    pub update_operations: u64,
    /// Bytes of padding carried by every inserted record.
    #[cfg_attr(
        feature = "command_line",
        arrrg(optional, "Bytes of padding per record.")
    )]
    pub padding: u64,
    /// The master seed.  Worker seeds derive from it.
    #[cfg_attr(feature = "command_line", arrrg(optional, "Master random seed."))]
    pub seed: u64,
    /// Start from zero when the backend is empty instead of failing.
    #[cfg_attr(
        feature = "command_line",
        arrrg(flag, "Start from an empty backend instead of failing.")
    )]
    pub allow_empty: bool,
}

impl WorkloadOptions {
    /// Turn these options into a pure insert load that may start from an empty backend.
    pub fn into_load(self) -> Self {
        Self {
            insert_weight: 1.0,
            update_weight: 0.0,
            read_weight: 0.0,
            range_weight: 0.0,
            most_recent_weight: 0.0,
            update_operations: 0,
            allow_empty: true,
            ..self
        }
    }

    fn weights(&self) -> [f64; 5] {
        [
            self.insert_weight,
            self.update_weight,
            self.read_weight,
            self.range_weight,
            self.most_recent_weight,
        ]
    }
}

impl Default for WorkloadOptions {
    fn default() -> Self {
        Self {
            workers: 16,
            operations: 100_000,
            insert_weight: 0.2,
            update_weight: 0.1,
            read_weight: 0.6,
            range_weight: 0.05,
            most_recent_weight: 0.05,
            update_operations: 0,
            padding: 0,
            seed: 0,
            allow_empty: false,
        }
    }
}

impl PartialEq for WorkloadOptions {
    fn eq(&self, other: &WorkloadOptions) -> bool {
        self.workers == other.workers
            && self.operations == other.operations
            && self
                .weights()
                .iter()
                .zip(other.weights().iter())
                .all(|(lhs, rhs)| lhs.to_bits() == rhs.to_bits())
            && self.update_operations == other.update_operations
            && self.padding == other.padding
            && self.seed == other.seed
            && self.allow_empty == other.allow_empty
    }
}

impl Eq for WorkloadOptions {}

//////////////////////////////////////////////// Mix ///////////////////////////////////////////////

/// A normalized probability distribution over [Operation].
#[derive(Clone, Debug, PartialEq)]
pub struct Mix {
    thresholds: [f64; 5],
    last: Operation,
}

impl Mix {
    /// Weights are indexed by [Operation::index].  They must be finite, non-negative, and not
    /// all zero.
    pub fn new(weights: [f64; 5]) -> Result<Self, Error> {
        if let Some(w) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
            return Err(Error::InvalidMix {
                what: format!("weight {w} is not a finite, non-negative number"),
            });
        }
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return Err(Error::InvalidMix {
                what: "every weight is zero".to_string(),
            });
        }
        let mut thresholds = [0.0; 5];
        let mut cumulative = 0.0;
        let mut last = Operation::Insert;
        for op in Operation::ALL {
            let weight = weights[op.index()];
            cumulative += weight / total;
            thresholds[op.index()] = cumulative;
            if weight > 0.0 {
                last = op;
            }
        }
        Ok(Self { thresholds, last })
    }

    /// Build the mix the options describe.  A non-zero `update_operations` pins the update
    /// share to `update_operations / operations` and scales the other weights to fill the rest.
    pub fn from_options(options: &WorkloadOptions) -> Result<Self, Error> {
        let mut weights = options.weights();
        if options.update_operations > 0 {
            if options.update_operations > options.operations {
                return Err(Error::InvalidMix {
                    what: format!(
                        "{} updates exceed the budget of {} operations",
                        options.update_operations, options.operations
                    ),
                });
            }
            let share = options.update_operations as f64 / options.operations as f64;
            let update = Operation::Update.index();
            let others: f64 = weights
                .iter()
                .enumerate()
                .filter(|(idx, _)| *idx != update)
                .map(|(_, w)| *w)
                .sum();
            if others <= 0.0 && share < 1.0 {
                return Err(Error::InvalidMix {
                    what: "no weight left for the operations that are not updates".to_string(),
                });
            }
            for (idx, weight) in weights.iter_mut().enumerate() {
                if idx == update {
                    *weight = share;
                } else if others > 0.0 {
                    *weight = *weight / others * (1.0 - share);
                }
            }
        }
        Self::new(weights)
    }

    /// The probability of choosing `op`.
    pub fn probability(&self, op: Operation) -> f64 {
        let idx = op.index();
        if idx == 0 {
            self.thresholds[0]
        } else {
            self.thresholds[idx] - self.thresholds[idx - 1]
        }
    }

    /// Draw the next operation kind.
    pub fn choose(&self, guac: &mut Guacamole) -> Operation {
        let x: f64 = any(guac);
        for op in Operation::ALL {
            if x < self.thresholds[op.index()] {
                return op;
            }
        }
        self.last
    }
}

/////////////////////////////////////////////// Phase //////////////////////////////////////////////

/// Where a [Driver] is in its run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Idle,
    Initializing,
    Running,
    Draining,
    Completed,
    Failed,
}

impl Phase {
    const ALL: [Phase; 6] = [
        Phase::Idle,
        Phase::Initializing,
        Phase::Running,
        Phase::Draining,
        Phase::Completed,
        Phase::Failed,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Initializing => "initializing",
            Phase::Running => "running",
            Phase::Draining => "draining",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        }
    }

    fn from_u8(x: u8) -> Phase {
        Self::ALL
            .get(x as usize)
            .copied()
            .unwrap_or(Phase::Failed)
    }
}

/////////////////////////////////////////////// State //////////////////////////////////////////////

struct State {
    phase: AtomicU8,
    budget: AtomicU64,
}

impl State {
    fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn enter(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
        clue!(COLLECTOR, INFO, {
            phase: phase.name(),
        });
    }

    /// Take one unit of budget.  False once the budget is spent.
    fn take_budget(&self) -> bool {
        match self
            .budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |x| x.checked_sub(1))
        {
            Ok(1) => {
                if self
                    .phase
                    .compare_exchange(
                        Phase::Running as u8,
                        Phase::Draining as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    clue!(COLLECTOR, INFO, {
                        phase: Phase::Draining.name(),
                    });
                }
                true
            }
            Ok(_) => true,
            Err(_) => false,
        }
    }

    fn run<P: Provider>(
        &self,
        index: u64,
        options: &WorkloadOptions,
        mix: &Mix,
        provider: &P,
        ids: &IdGenerator,
    ) -> WorkerStats {
        let mut guac = Guacamole::new(worker_seed(options.seed, index, options.workers));
        let mut record = Record::template(options.padding as usize);
        let mut stats = WorkerStats::default();
        while self.take_budget() {
            let op = mix.choose(&mut guac);
            let start = Instant::now();
            let success = provider.perform(op, &mut record, ids, &mut guac);
            let elapsed = start.elapsed();
            op.observe(elapsed);
            stats.record(op, success, elapsed);
        }
        stats
    }
}

fn emit_metrics<EM: Emitter>(collector: &Collector, emitter: &mut EM)
where
    EM::Error: Debug,
{
    let now = match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(now) => u64::try_from(now.as_millis()).unwrap_or(u64::MAX),
        Err(_) => return,
    };
    if let Err(err) = collector.emit(emitter, now) {
        clue!(COLLECTOR, ERROR, {
            emit_metrics: format!("{err:?}"),
        });
    }
}

/// The seed of worker `index` of `workers`.
pub fn worker_seed(seed: u64, index: u64, workers: u64) -> u64 {
    seed.wrapping_add((u64::MAX / workers.max(1)).wrapping_mul(index))
}

////////////////////////////////////////////// Driver //////////////////////////////////////////////

/// Runs one workload against one provider.
pub struct Driver<P: Provider> {
    options: WorkloadOptions,
    mix: Mix,
    provider: Arc<P>,
    ids: Arc<IdGenerator>,
    state: Arc<State>,
}

impl<P: Provider + 'static> Driver<P> {
    /// Create a new driver from options.  Fails on an unusable mix or worker count.
    pub fn new(options: WorkloadOptions, provider: P) -> Result<Self, Error> {
        if options.workers == 0 {
            return Err(Error::InvalidOptions {
                what: "at least one worker is required".to_string(),
            });
        }
        let mix = Mix::from_options(&options)?;
        Ok(Self {
            options,
            mix,
            provider: Arc::new(provider),
            ids: Arc::new(IdGenerator::new()),
            state: Arc::new(State {
                phase: AtomicU8::new(Phase::Idle as u8),
                budget: AtomicU64::new(0),
            }),
        })
    }

    /// The current phase of the run.
    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn mix(&self) -> &Mix {
        &self.mix
    }

    /// The generator shared by the workers.
    pub fn ids(&self) -> &IdGenerator {
        &self.ids
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Initialize the identifier generator from the backend, run the workers until the budget
    /// is spent, and summarize what they saw.
    ///
    /// Only initialization errors fail the run.  Operation failures are counted in the summary.
    pub fn run(&self) -> Result<Summary, Error> {
        self.execute(|| {})
    }

    /// Like [Driver::run], but emit `collector` through `emitter` once the workers start, every
    /// second while they run, and once after they are joined.
    pub fn run_with_metrics<EM: Emitter>(
        &self,
        collector: &Collector,
        emitter: &mut EM,
    ) -> Result<Summary, Error>
    where
        EM::Error: Debug,
    {
        self.execute(|| emit_metrics(collector, emitter))
    }

    fn execute(&self, mut emit: impl FnMut()) -> Result<Summary, Error> {
        if self
            .state
            .phase
            .compare_exchange(
                Phase::Idle as u8,
                Phase::Initializing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(Error::AlreadyStarted);
        }
        clue!(COLLECTOR, INFO, {
            phase: Phase::Initializing.name(),
            provider: self.provider.name(),
        });
        if let Err(err) = self.initialize() {
            clue!(COLLECTOR, ERROR, {
                initialize: err.to_string(),
            });
            self.state.enter(Phase::Failed);
            return Err(err);
        }
        self.state
            .budget
            .store(self.options.operations, Ordering::Release);
        self.state.enter(Phase::Running);
        if self.options.operations == 0 {
            self.state.enter(Phase::Draining);
        }
        let started = Instant::now();
        let threads = match self.spawn_workers() {
            Ok(threads) => threads,
            Err(err) => {
                self.state.enter(Phase::Failed);
                return Err(err);
            }
        };
        emit();
        let mut last_report = Instant::now();
        while !threads.iter().all(JoinHandle::is_finished) {
            std::thread::sleep(POLL_INTERVAL);
            if last_report.elapsed() >= PROGRESS_INTERVAL {
                clue!(COLLECTOR, INFO, {
                    remaining: self.state.budget.load(Ordering::Relaxed),
                    high_water_mark: self.ids.high_water_mark(),
                });
                emit();
                last_report = Instant::now();
            }
        }
        let mut stats = WorkerStats::default();
        for (index, thread) in threads.into_iter().enumerate() {
            match thread.join() {
                Ok(worker) => stats.merge(&worker),
                Err(_) => {
                    clue!(COLLECTOR, ERROR, {
                        worker_panicked: index as u64,
                    });
                }
            }
        }
        let elapsed = started.elapsed();
        emit();
        self.state.enter(Phase::Completed);
        Ok(Summary::new(
            self.provider.name(),
            self.options.workers,
            elapsed,
            stats,
        ))
    }

    fn initialize(&self) -> Result<(), Error> {
        let max_id = match self.provider.get_max_id() {
            Ok(max_id) => max_id,
            Err(Error::EmptyBackend) if self.options.allow_empty => 0,
            Err(err) => return Err(err),
        };
        self.ids.init(max_id)?;
        clue!(COLLECTOR, INFO, {
            starting_max_id: max_id,
        });
        Ok(())
    }

    fn spawn_workers(&self) -> Result<Vec<JoinHandle<WorkerStats>>, Error> {
        let mut threads = Vec::with_capacity(self.options.workers as usize);
        for index in 0..self.options.workers {
            let state = Arc::clone(&self.state);
            let provider = Arc::clone(&self.provider);
            let ids = Arc::clone(&self.ids);
            let options = self.options.clone();
            let mix = self.mix.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || state.run(index, &options, &mix, &*provider, &ids));
            match spawned {
                Ok(thread) => threads.push(thread),
                Err(err) => {
                    // Stop the workers that did start before reporting.
                    self.state.budget.store(0, Ordering::Release);
                    for thread in threads {
                        let _ = thread.join();
                    }
                    return Err(err.into());
                }
            }
        }
        Ok(threads)
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
