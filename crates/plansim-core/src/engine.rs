//! Deterministic parallel execution engine.
//!
//! Executes a DAG of tasks on a bounded worker pool so that the merged
//! result is identical for any worker count and any scheduling order. Two
//! mechanisms make concurrency invisible to correctness:
//!
//! 1. Every output is tagged with its task's `deterministic_key`, and the
//!    merge step orders strictly by that key (a `BTreeMap`), never by
//!    completion order.
//! 2. Any randomness inside a task derives from a pure hash of stable
//!    identifiers ([`crate::fingerprint::stable_draw`]), never from a shared
//!    generator.
//!
//! A task failure cancels not-yet-started tasks, lets in-flight ones finish,
//! and surfaces every collected failure together. A task that exceeds its
//! time budget is reported as a stall, not silently retried.
//!
//! Memory headroom is sampled before dispatch and re-sampled periodically
//! while the DAG runs; when it drops below budget the active worker limit
//! halves and surplus workers park for the rest of the run. The limit never
//! grows back mid-run, so narrowing cannot oscillate.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

/// A unit of work in the DAG.
#[derive(Debug, Clone)]
pub struct ExecutionTask<I> {
    /// Unique task identifier, referenced by dependents.
    pub task_id: String,
    /// Stage label, for diagnostics only.
    pub stage: String,
    /// Task ids that must complete before this task may start.
    pub dependencies: Vec<String>,
    /// Stable key the merge step orders output by. Unique per DAG.
    pub deterministic_key: String,
    /// Task input.
    pub input: I,
}

/// Failure reported by a task body.
#[derive(Debug, Clone, Error)]
#[error("{detail}")]
pub struct TaskError {
    /// What went wrong inside the task.
    pub detail: String,
}

impl TaskError {
    /// Wraps a task-side failure description.
    #[must_use]
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// One collected task failure, attributed for reporting.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    /// Failing task.
    pub task_id: String,
    /// Its deterministic key, used to order the collected failures.
    pub deterministic_key: String,
    /// Failure detail.
    pub detail: String,
}

/// Errors from DAG execution.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Two tasks share an id.
    #[error("duplicate task id {task_id}")]
    DuplicateTaskId {
        /// The repeated id.
        task_id: String,
    },

    /// Two tasks share a deterministic key, which would make the merge
    /// ambiguous.
    #[error("duplicate deterministic key {key} on tasks {task_a} and {task_b}")]
    DuplicateKey {
        /// The repeated key.
        key: String,
        /// First task with the key.
        task_a: String,
        /// Second task with the key.
        task_b: String,
    },

    /// A task depends on an id not present in the DAG.
    #[error("task {task_id} depends on unknown task {dependency}")]
    UnknownDependency {
        /// The depending task.
        task_id: String,
        /// The missing dependency.
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    #[error("dependency cycle involving tasks: {involved:?}")]
    DependencyCycle {
        /// Tasks left unresolvable by a topological pass.
        involved: Vec<String>,
    },

    /// One or more tasks failed. Queued tasks were cancelled; in-flight
    /// tasks were awaited; all failures are collected here, ordered by
    /// deterministic key.
    #[error("{} task(s) failed, first: {}", failures.len(), failures.first().map_or("", |f| f.detail.as_str()))]
    TaskFailures {
        /// Every collected failure.
        failures: Vec<TaskFailure>,
    },

    /// Execution was cancelled from outside before all tasks completed.
    #[error("execution cancelled with {completed} of {total} tasks complete")]
    Cancelled {
        /// Tasks that completed before cancellation took effect.
        completed: usize,
        /// Total tasks in the DAG.
        total: usize,
    },

    /// Not enough memory headroom to run even a narrowed pool.
    #[error("resource exhaustion: {detail}")]
    ResourceExhaustion {
        /// What budget could not be met.
        detail: String,
    },
}

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on concurrent workers. Clamped to the task count.
    pub max_workers: usize,
    /// Per-task wall-clock budget; exceeding it reports a stall.
    pub task_time_budget: Duration,
    /// Minimum `MemAvailable` headroom in KiB before narrowing the pool.
    /// `None` disables the memory check.
    pub min_available_memory_kib: Option<u64>,
    /// How often workers re-sample memory headroom while the DAG runs.
    /// Zero samples on every dispatch.
    pub pressure_check_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            task_time_budget: Duration::from_secs(60),
            min_available_memory_kib: None,
            pressure_check_interval: Duration::from_millis(250),
        }
    }
}

/// Result of a completed DAG run.
#[derive(Debug)]
pub struct MergedResult<O> {
    /// Outputs ordered by deterministic key.
    pub outputs: BTreeMap<String, O>,
    /// Task ids that exceeded the time budget, in deterministic-key order.
    pub stalls: Vec<String>,
    /// Worker limit in effect at completion, after any narrowing.
    pub workers_used: usize,
}

/// The execution engine.
#[derive(Debug, Clone, Default)]
pub struct ExecutionEngine {
    config: EngineConfig,
}

/// Per-task bookkeeping shared between workers.
struct Shared<O> {
    ready: VecDeque<usize>,
    pending_deps: Vec<usize>,
    results: Vec<Option<Result<O, TaskFailure>>>,
    in_flight: usize,
    completed: usize,
    cancelled: bool,
    stalled: Vec<usize>,
    /// Workers with a rank at or above this limit park instead of taking
    /// new tasks. Only ever decreases within a run.
    active_limit: usize,
    last_pressure_check: Instant,
}

impl ExecutionEngine {
    /// Builds an engine with the given configuration.
    #[must_use]
    pub const fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Executes the DAG, merging outputs by deterministic key.
    ///
    /// # Errors
    ///
    /// Returns a structural error before any task runs (duplicate ids or
    /// keys, unknown dependencies, cycles), `TaskFailures` with every
    /// collected failure when task bodies fail, `Cancelled` when the cancel
    /// flag is raised mid-run, or `ResourceExhaustion` when memory headroom
    /// is insufficient even after narrowing.
    pub fn execute<I, O, F>(
        &self,
        tasks: Vec<ExecutionTask<I>>,
        run: F,
    ) -> Result<MergedResult<O>, EngineError>
    where
        I: Send + Sync,
        O: Send,
        F: Fn(&ExecutionTask<I>) -> Result<O, TaskError> + Sync,
    {
        let cancel = AtomicBool::new(false);
        self.execute_with_cancel(tasks, run, &cancel)
    }

    /// [`execute`](Self::execute) with an external cancellation flag.
    ///
    /// Raising the flag halts dispatch of queued tasks immediately; in-flight
    /// tasks run to completion.
    ///
    /// # Errors
    ///
    /// As [`execute`](Self::execute).
    pub fn execute_with_cancel<I, O, F>(
        &self,
        tasks: Vec<ExecutionTask<I>>,
        run: F,
        cancel: &AtomicBool,
    ) -> Result<MergedResult<O>, EngineError>
    where
        I: Send + Sync,
        O: Send,
        F: Fn(&ExecutionTask<I>) -> Result<O, TaskError> + Sync,
    {
        let index = validate_dag(&tasks)?;
        let total = tasks.len();
        if total == 0 {
            return Ok(MergedResult {
                outputs: BTreeMap::new(),
                stalls: Vec::new(),
                workers_used: 0,
            });
        }

        let workers = self.effective_workers(total)?;
        let dependents = build_dependents(&tasks, &index);

        let mut pending_deps = Vec::with_capacity(total);
        let mut ready = VecDeque::new();
        for (i, task) in tasks.iter().enumerate() {
            pending_deps.push(task.dependencies.len());
            if task.dependencies.is_empty() {
                ready.push_back(i);
            }
        }

        let shared = Mutex::new(Shared::<O> {
            ready,
            pending_deps,
            results: (0..total).map(|_| None).collect(),
            in_flight: 0,
            completed: 0,
            cancelled: false,
            stalled: Vec::new(),
            active_limit: workers,
            last_pressure_check: Instant::now(),
        });
        let work_available = Condvar::new();

        let ctx = WorkerContext {
            tasks: &tasks,
            dependents: &dependents,
            shared: &shared,
            work_available: &work_available,
            run: &run,
            cancel,
            config: &self.config,
        };
        std::thread::scope(|scope| {
            for rank in 0..workers {
                let ctx = &ctx;
                scope.spawn(move || worker_loop(ctx, rank));
            }
        });

        let shared = into_inner(shared);
        merge(tasks, shared, total)
    }

    /// Worker count after clamping and any memory-pressure narrowing.
    fn effective_workers(&self, task_count: usize) -> Result<usize, EngineError> {
        let mut workers = self.config.max_workers.clamp(1, task_count.max(1));
        let Some(min_kib) = self.config.min_available_memory_kib else {
            return Ok(workers);
        };
        let Some(available) = available_memory_kib() else {
            return Ok(workers);
        };
        if available < min_kib {
            let narrowed = (workers / 2).max(1);
            warn!(
                available_kib = available,
                budget_kib = min_kib,
                from = workers,
                to = narrowed,
                "memory pressure: narrowing worker pool"
            );
            workers = narrowed;
            // One retry at narrowed concurrency; below half the budget even
            // a single worker is not safe to start.
            if available < min_kib / 2 && workers == 1 {
                return Err(EngineError::ResourceExhaustion {
                    detail: format!(
                        "available memory {available} KiB is below half the {min_kib} KiB budget"
                    ),
                });
            }
        }
        Ok(workers)
    }
}

/// Shared references every worker needs.
struct WorkerContext<'a, I, O, F> {
    tasks: &'a [ExecutionTask<I>],
    dependents: &'a [Vec<usize>],
    shared: &'a Mutex<Shared<O>>,
    work_available: &'a Condvar,
    run: &'a F,
    cancel: &'a AtomicBool,
    config: &'a EngineConfig,
}

/// Pulls and runs tasks until the DAG is complete or cancelled. A worker
/// whose rank falls outside the active limit parks until completion.
fn worker_loop<I, O, F>(ctx: &WorkerContext<'_, I, O, F>, rank: usize)
where
    F: Fn(&ExecutionTask<I>) -> Result<O, TaskError>,
{
    let budget = ctx.config.task_time_budget;
    loop {
        let task_index = {
            let mut guard = lock(ctx.shared);
            loop {
                if ctx.cancel.load(Ordering::Relaxed) && !guard.cancelled {
                    guard.cancelled = true;
                    guard.ready.clear();
                    ctx.work_available.notify_all();
                }
                if let Some(min_kib) = ctx.config.min_available_memory_kib {
                    maybe_narrow(&mut guard, min_kib, ctx.config.pressure_check_interval);
                }
                if rank < guard.active_limit {
                    if let Some(i) = guard.ready.pop_front() {
                        guard.in_flight += 1;
                        break Some(i);
                    }
                }
                let terminal = guard.completed == ctx.tasks.len()
                    || (guard.cancelled && guard.in_flight == 0);
                if terminal {
                    break None;
                }
                guard = wait(ctx.work_available, guard);
            }
        };

        let Some(i) = task_index else {
            ctx.work_available.notify_all();
            return;
        };

        let task = &ctx.tasks[i];
        let started = Instant::now();
        let outcome = (ctx.run)(task);
        let elapsed = started.elapsed();

        let mut guard = lock(ctx.shared);
        guard.in_flight -= 1;
        guard.completed += 1;
        if elapsed > budget {
            warn!(
                task_id = %task.task_id,
                stage = %task.stage,
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = budget.as_millis() as u64,
                "task exceeded time budget (stall)"
            );
            guard.stalled.push(i);
        }
        match outcome {
            Ok(output) => {
                guard.results[i] = Some(Ok(output));
                if !guard.cancelled {
                    for &d in &ctx.dependents[i] {
                        guard.pending_deps[d] -= 1;
                        if guard.pending_deps[d] == 0 {
                            guard.ready.push_back(d);
                        }
                    }
                }
            },
            Err(err) => {
                debug!(task_id = %task.task_id, error = %err, "task failed; cancelling queued tasks");
                guard.results[i] = Some(Err(TaskFailure {
                    task_id: task.task_id.clone(),
                    deterministic_key: task.deterministic_key.clone(),
                    detail: err.detail,
                }));
                guard.cancelled = true;
                guard.ready.clear();
            },
        }
        ctx.work_available.notify_all();
    }
}

/// Re-samples memory headroom and halves the active worker limit when it
/// falls below budget. Rate-limited by `interval`; the limit floors at one
/// worker and never grows back within a run.
fn maybe_narrow<O>(guard: &mut Shared<O>, min_kib: u64, interval: Duration) {
    if guard.active_limit <= 1 || guard.last_pressure_check.elapsed() < interval {
        return;
    }
    guard.last_pressure_check = Instant::now();
    let Some(available) = available_memory_kib() else {
        return;
    };
    if available < min_kib {
        let narrowed = (guard.active_limit / 2).max(1);
        warn!(
            available_kib = available,
            budget_kib = min_kib,
            from = guard.active_limit,
            to = narrowed,
            "memory pressure mid-run: parking surplus workers"
        );
        guard.active_limit = narrowed;
    }
}

/// Final merge: collects failures or builds the key-ordered output map.
fn merge<I, O>(
    tasks: Vec<ExecutionTask<I>>,
    shared: Shared<O>,
    total: usize,
) -> Result<MergedResult<O>, EngineError> {
    let mut failures = Vec::new();
    let mut outputs = BTreeMap::new();
    let mut completed = 0usize;
    let workers_used = shared.active_limit;

    let mut stall_pairs: Vec<(&str, &str)> = shared
        .stalled
        .iter()
        .map(|&i| (tasks[i].deterministic_key.as_str(), tasks[i].task_id.as_str()))
        .collect();
    stall_pairs.sort_unstable();
    let stalls: Vec<String> = stall_pairs.into_iter().map(|(_, id)| id.to_owned()).collect();

    for (task, result) in tasks.into_iter().zip(shared.results) {
        match result {
            Some(Ok(output)) => {
                completed += 1;
                outputs.insert(task.deterministic_key, output);
            },
            Some(Err(failure)) => {
                completed += 1;
                failures.push(failure);
            },
            None => {},
        }
    }

    if !failures.is_empty() {
        failures.sort_by(|a, b| a.deterministic_key.cmp(&b.deterministic_key));
        return Err(EngineError::TaskFailures { failures });
    }
    if completed < total {
        return Err(EngineError::Cancelled { completed, total });
    }
    Ok(MergedResult {
        outputs,
        stalls,
        workers_used,
    })
}

/// Structural validation: unique ids and keys, known dependencies, no
/// cycles. Returns the id-to-index map.
fn validate_dag<I>(tasks: &[ExecutionTask<I>]) -> Result<BTreeMap<&str, usize>, EngineError> {
    let mut index = BTreeMap::new();
    let mut keys: BTreeMap<&str, &str> = BTreeMap::new();
    for (i, task) in tasks.iter().enumerate() {
        if index.insert(task.task_id.as_str(), i).is_some() {
            return Err(EngineError::DuplicateTaskId {
                task_id: task.task_id.clone(),
            });
        }
        if let Some(other) = keys.insert(task.deterministic_key.as_str(), task.task_id.as_str()) {
            return Err(EngineError::DuplicateKey {
                key: task.deterministic_key.clone(),
                task_a: other.to_owned(),
                task_b: task.task_id.clone(),
            });
        }
    }
    for task in tasks {
        for dep in &task.dependencies {
            if !index.contains_key(dep.as_str()) {
                return Err(EngineError::UnknownDependency {
                    task_id: task.task_id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    // Kahn's algorithm; anything left with unresolved dependencies is part
    // of (or downstream of) a cycle.
    let mut pending: Vec<usize> = tasks.iter().map(|t| t.dependencies.len()).collect();
    let dependents = build_dependents(tasks, &index);
    let mut queue: VecDeque<usize> = pending
        .iter()
        .enumerate()
        .filter(|(_, &p)| p == 0)
        .map(|(i, _)| i)
        .collect();
    let mut resolved = 0usize;
    while let Some(i) = queue.pop_front() {
        resolved += 1;
        for &d in &dependents[i] {
            pending[d] -= 1;
            if pending[d] == 0 {
                queue.push_back(d);
            }
        }
    }
    if resolved != tasks.len() {
        let involved: Vec<String> = pending
            .iter()
            .enumerate()
            .filter(|(_, &p)| p > 0)
            .map(|(i, _)| tasks[i].task_id.clone())
            .collect();
        return Err(EngineError::DependencyCycle { involved });
    }
    Ok(index)
}

/// Reverse adjacency: for each task, the indices depending on it.
fn build_dependents<I>(
    tasks: &[ExecutionTask<I>],
    index: &BTreeMap<&str, usize>,
) -> Vec<Vec<usize>> {
    let mut dependents = vec![Vec::new(); tasks.len()];
    for (i, task) in tasks.iter().enumerate() {
        for dep in &task.dependencies {
            if let Some(&d) = index.get(dep.as_str()) {
                dependents[d].push(i);
            }
        }
    }
    dependents
}

/// `MemAvailable` from /proc/meminfo, when readable.
fn available_memory_kib() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    meminfo
        .lines()
        .find(|l| l.starts_with("MemAvailable:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

// Mutex poisoning means a worker panicked, which is itself a bug; recovering
// the inner state keeps the remaining workers' results observable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// Bounded wait so an externally-raised cancel flag is observed even when
// every worker is parked.
fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    condvar
        .wait_timeout(guard, Duration::from_millis(50))
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .0
}

fn into_inner<T>(mutex: Mutex<T>) -> T {
    mutex
        .into_inner()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::stable_draw;

    fn task(id: &str, deps: &[&str], key: &str) -> ExecutionTask<u64> {
        ExecutionTask {
            task_id: id.to_owned(),
            stage: "test".to_owned(),
            dependencies: deps.iter().map(|d| (*d).to_owned()).collect(),
            deterministic_key: key.to_owned(),
            input: 0,
        }
    }

    fn engine(workers: usize) -> ExecutionEngine {
        ExecutionEngine::new(EngineConfig {
            max_workers: workers,
            ..EngineConfig::default()
        })
    }

    #[test]
    fn merged_output_is_worker_count_independent() {
        let make_tasks = || -> Vec<ExecutionTask<u64>> {
            (0..64)
                .map(|i| {
                    let mut t = task(&format!("t{i}"), &[], &format!("k{i:03}"));
                    t.input = i;
                    t
                })
                .collect()
        };
        let body = |t: &ExecutionTask<u64>| -> Result<u64, TaskError> {
            // Stable-hash randomness: identical for any scheduling.
            Ok(stable_draw(7, &t.task_id, 2025, "test") ^ t.input)
        };

        let serial = engine(1).execute(make_tasks(), body).unwrap();
        let parallel = engine(8).execute(make_tasks(), body).unwrap();

        assert_eq!(serial.outputs, parallel.outputs);
        assert_eq!(serial.workers_used, 1);
        assert_eq!(parallel.workers_used, 8);
    }

    #[test]
    fn dependencies_run_before_dependents() {
        use std::sync::Mutex as StdMutex;
        let order = StdMutex::new(Vec::new());

        let tasks = vec![
            task("c", &["a", "b"], "k-c"),
            task("a", &[], "k-a"),
            task("b", &["a"], "k-b"),
        ];
        engine(4)
            .execute(tasks, |t: &ExecutionTask<u64>| {
                order.lock().unwrap().push(t.task_id.clone());
                Ok(0u64)
            })
            .unwrap();

        let order = order.into_inner().unwrap();
        let pos = |id: &str| order.iter().position(|o| o == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn failure_cancels_queued_and_collects_all_errors() {
        // Two independent failing roots, plus a dependent that must never run.
        let tasks = vec![
            task("bad-1", &[], "k-1"),
            task("bad-2", &[], "k-2"),
            task("child", &["bad-1", "bad-2"], "k-3"),
        ];

        let err = engine(2)
            .execute(tasks, |t: &ExecutionTask<u64>| {
                if t.task_id.starts_with("bad") {
                    Err(TaskError::new(format!("{} exploded", t.task_id)))
                } else {
                    Ok(0u64)
                }
            })
            .unwrap_err();

        match err {
            EngineError::TaskFailures { failures } => {
                assert!(!failures.is_empty());
                // Failures come back in deterministic-key order.
                let keys: Vec<_> = failures.iter().map(|f| f.deterministic_key.clone()).collect();
                let mut sorted = keys.clone();
                sorted.sort();
                assert_eq!(keys, sorted);
            },
            other => panic!("expected TaskFailures, got {other:?}"),
        }
    }

    #[test]
    fn cycle_is_rejected_before_running() {
        let tasks = vec![task("a", &["b"], "k-a"), task("b", &["a"], "k-b")];
        let err = engine(2)
            .execute(tasks, |_t: &ExecutionTask<u64>| Ok(0u64))
            .unwrap_err();
        assert!(matches!(err, EngineError::DependencyCycle { .. }));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let tasks = vec![task("a", &["ghost"], "k-a")];
        let err = engine(1)
            .execute(tasks, |_t: &ExecutionTask<u64>| Ok(0u64))
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownDependency { .. }));
    }

    #[test]
    fn duplicate_deterministic_key_is_rejected() {
        let tasks = vec![task("a", &[], "same"), task("b", &[], "same")];
        let err = engine(1)
            .execute(tasks, |_t: &ExecutionTask<u64>| Ok(0u64))
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateKey { .. }));
    }

    #[test]
    fn external_cancel_leaves_partial_progress_reported() {
        let cancel = AtomicBool::new(true); // cancelled before dispatch
        let tasks: Vec<ExecutionTask<u64>> =
            (0..8).map(|i| task(&format!("t{i}"), &[], &format!("k{i}"))).collect();

        let err = engine(2)
            .execute_with_cancel(tasks, |_t| Ok(0u64), &cancel)
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled { completed: 0, total: 8 }));
    }

    #[test]
    fn empty_dag_is_trivially_complete() {
        let result = engine(4)
            .execute(Vec::<ExecutionTask<u64>>::new(), |_t| Ok(0u64))
            .unwrap();
        assert!(result.outputs.is_empty());
        assert_eq!(result.workers_used, 0);
    }

    #[test]
    fn stall_is_reported_not_retried() {
        let slow_engine = ExecutionEngine::new(EngineConfig {
            max_workers: 1,
            task_time_budget: Duration::from_millis(1),
            ..EngineConfig::default()
        });
        let tasks = vec![task("slow", &[], "k-slow")];

        let result = slow_engine
            .execute(tasks, |_t: &ExecutionTask<u64>| {
                std::thread::sleep(Duration::from_millis(20));
                Ok(1u64)
            })
            .unwrap();

        assert_eq!(result.stalls, vec!["slow".to_owned()]);
        assert_eq!(result.outputs.len(), 1);
    }

    #[test]
    fn stalls_come_back_in_deterministic_key_order() {
        let slow_engine = ExecutionEngine::new(EngineConfig {
            max_workers: 1,
            task_time_budget: Duration::from_millis(1),
            ..EngineConfig::default()
        });
        // Key order is the reverse of id order; stalls must follow the keys.
        let tasks = vec![task("alpha", &[], "k-2"), task("beta", &[], "k-1")];

        let result = slow_engine
            .execute(tasks, |_t: &ExecutionTask<u64>| {
                std::thread::sleep(Duration::from_millis(20));
                Ok(1u64)
            })
            .unwrap();

        assert_eq!(result.stalls, vec!["beta".to_owned(), "alpha".to_owned()]);
    }

    #[test]
    fn memory_pressure_mid_run_parks_surplus_workers() {
        // An unmeetable budget forces a halving on every pressure sample;
        // with a zero interval the pool narrows to one worker almost
        // immediately, and the run still completes every task.
        let pressured = ExecutionEngine::new(EngineConfig {
            max_workers: 8,
            task_time_budget: Duration::from_secs(60),
            min_available_memory_kib: Some(u64::MAX),
            pressure_check_interval: Duration::ZERO,
        });
        let tasks: Vec<ExecutionTask<u64>> = (0..16)
            .map(|i| task(&format!("t{i}"), &[], &format!("k{i:02}")))
            .collect();

        let result = pressured
            .execute(tasks, |_t: &ExecutionTask<u64>| {
                std::thread::sleep(Duration::from_millis(2));
                Ok(1u64)
            })
            .unwrap();

        assert_eq!(result.outputs.len(), 16);
        assert_eq!(result.workers_used, 1);
    }
}
