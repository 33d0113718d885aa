//! Load-aware dispatch of runs onto a fixed pool of workers.
//!
//! The dispatcher walks the queued runs in plan order. Before handing each
//! one to the pool it asks the [`LoadGate`]; while the gate refuses, it
//! backs off and asks again. Workers pull from a bounded channel, run the
//! supervisor, extract benchmarks and fold the record into the shared
//! [`StatsAggregator`].
//!
//! Raising the cancellation flag stops dispatch. Runs that were never
//! started are dropped without a record; runs in progress are terminated
//! and recorded as failed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use simtest_core::obs::{emit_run_bypassed, emit_schedule_finished};
use simtest_core::{extract_benchmarks, GlobalBenchRule, StatsAggregator};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info};

use crate::load::{LoadGate, LoadSensor, SysinfoLoadSensor};
use crate::metrics::SchedulerMetrics;
use crate::observer::RunObserver;
use crate::options::RunnerOptions;
use crate::plan::{Run, RunPlan};
use crate::supervisor::{cancelled, ProcessSupervisor};

/// Delay between two load checks while the gate refuses dispatch.
pub const DEFAULT_LOAD_BACKOFF: Duration = Duration::from_millis(100);

/// What happened to the plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleOutcome {
    /// Runs handed to the supervisor.
    pub executed: u64,
    /// Runs recorded as skipped or excluded without executing.
    pub bypassed: u64,
    /// Runs dropped unrecorded because the session was interrupted.
    pub abandoned: u64,
    pub interrupted: bool,
}

/// Runs a [`RunPlan`] to completion.
pub struct Scheduler {
    workers: usize,
    gate: Arc<LoadGate>,
    supervisor: Arc<ProcessSupervisor>,
    bench_rule: Option<Arc<GlobalBenchRule>>,
    backoff: Duration,
    metrics: Arc<SchedulerMetrics>,
}

impl Scheduler {
    pub fn new(options: &RunnerOptions) -> Self {
        Self {
            workers: options.worker_count(),
            gate: Arc::new(LoadGate::new(options.load_average, Arc::new(SysinfoLoadSensor))),
            supervisor: Arc::new(ProcessSupervisor::new(options.max_output_len)),
            bench_rule: None,
            backoff: DEFAULT_LOAD_BACKOFF,
            metrics: Arc::new(SchedulerMetrics::new()),
        }
    }

    /// Replace the load sensor (keeps the configured ceiling).
    pub fn with_sensor(mut self, sensor: Arc<dyn LoadSensor>) -> Self {
        self.gate = Arc::new(LoadGate::new(self.gate.ceiling(), sensor));
        self
    }

    /// Replace the supervisor used by every worker.
    pub fn with_supervisor(mut self, supervisor: ProcessSupervisor) -> Self {
        self.supervisor = Arc::new(supervisor);
        self
    }

    /// Output-wide benchmark rule applied to every executed run.
    pub fn with_bench_rule(mut self, rule: Option<GlobalBenchRule>) -> Self {
        self.bench_rule = rule.map(Arc::new);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Number of worker tasks started by [`Scheduler::run`].
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Counters of the last session.
    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    /// Record bypassed runs, then execute queued runs until the plan is
    /// exhausted or `cancel` is raised.
    pub async fn run(
        &self,
        plan: RunPlan,
        stats: Arc<StatsAggregator>,
        observer: Arc<dyn RunObserver>,
        cancel: watch::Receiver<bool>,
    ) -> ScheduleOutcome {
        let RunPlan { queued, bypassed } = plan;
        let mut outcome = ScheduleOutcome::default();

        for record in bypassed {
            if let Some(message) = &record.message {
                emit_run_bypassed(&record.run_id, &record.test_name, record.status, message);
            }
            observer.on_bypass(&record);
            stats.record(record);
            self.metrics.inc_bypassed();
            outcome.bypassed += 1;
        }

        info!(
            runs = queued.len(),
            workers = self.workers,
            load_ceiling = self.gate.ceiling(),
            "starting scheduler"
        );

        let (tx, rx) = mpsc::channel::<Run>(self.workers.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(self.workers);
        for worker_id in 0..self.workers.max(1) {
            let rx = Arc::clone(&rx);
            let in_flight = Arc::clone(&in_flight);
            let stats = Arc::clone(&stats);
            let observer = Arc::clone(&observer);
            let supervisor = Arc::clone(&self.supervisor);
            let bench_rule = self.bench_rule.clone();
            let metrics = Arc::clone(&self.metrics);
            let cancel = cancel.clone();

            workers.push(tokio::spawn(async move {
                let mut executed = 0u64;
                let mut abandoned = 0u64;
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(run) = next else {
                        break;
                    };
                    if *cancel.borrow() {
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        abandoned += 1;
                        continue;
                    }

                    debug!(worker = worker_id, run_id = %run.id, "worker picked run");
                    observer.on_start(&run);
                    let mut record = supervisor.execute(&run, observer.as_ref(), cancel.clone()).await;
                    if record.status.was_executed() {
                        record.benchmarks = extract_benchmarks(
                            &run.test,
                            &run.target.name,
                            &record.output,
                            bench_rule.as_deref(),
                        );
                    }
                    if record.timed_out {
                        metrics.inc_timed_out();
                    }
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    observer.on_complete(&run, &record);
                    stats.record(record);
                    metrics.inc_completed();
                    executed += 1;
                }
                (executed, abandoned)
            }));
        }

        let mut dispatch_cancel = cancel.clone();
        let mut pending = queued.into_iter();
        'dispatch: for run in pending.by_ref() {
            loop {
                if *dispatch_cancel.borrow() {
                    outcome.abandoned += 1;
                    break 'dispatch;
                }
                if self.gate.admits(in_flight.load(Ordering::SeqCst)) {
                    break;
                }
                self.metrics.inc_throttled();
                tokio::select! {
                    _ = tokio::time::sleep(self.backoff) => {}
                    _ = cancelled(&mut dispatch_cancel) => {}
                }
            }

            in_flight.fetch_add(1, Ordering::SeqCst);
            self.metrics.inc_dispatched();
            tokio::select! {
                sent = tx.send(run) => {
                    if sent.is_err() {
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        outcome.abandoned += 1;
                        break 'dispatch;
                    }
                }
                _ = cancelled(&mut dispatch_cancel) => {
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    outcome.abandoned += 1;
                    break 'dispatch;
                }
            }
        }
        outcome.abandoned += pending.count() as u64;
        drop(tx);

        for result in futures::future::join_all(workers).await {
            match result {
                Ok((executed, abandoned)) => {
                    outcome.executed += executed;
                    outcome.abandoned += abandoned;
                }
                Err(e) => tracing::error!(error = %e, "worker task failed"),
            }
        }

        outcome.interrupted = *cancel.borrow();
        emit_schedule_finished(outcome.executed, outcome.bypassed, outcome.interrupted);
        self.metrics.flush();
        outcome
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.workers)
            .field("gate", &self.gate)
            .field("backoff", &self.backoff)
            .finish()
    }
}
