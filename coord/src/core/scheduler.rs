use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, unbounded};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use common::error::{StoreError, StoreResult};

use crate::core::catalog::FileCatalog;
use crate::core::node::{NodeId, Priority};

/// Wall-clock time of each executed operation, keyed by `(step, file name)`.
pub type StepTimings = DashMap<(String, String), Duration>;

/// One unit of engine work. Executed against the scheduler's catalog.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Create {
        name: String,
        size: u64,
        priority: Priority,
        node: Option<NodeId>,
    },
    Delete {
        name: String,
    },
    Retrieve {
        name: String,
        dest: PathBuf,
    },
    Move {
        name: String,
        target: NodeId,
    },
}

impl Operation {
    pub fn step(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::Delete { .. } => "delete",
            Operation::Retrieve { .. } => "retrieve",
            Operation::Move { .. } => "move",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Operation::Create { name, .. }
            | Operation::Delete { name }
            | Operation::Retrieve { name, .. }
            | Operation::Move { name, .. } => name,
        }
    }

    pub fn apply(&self, catalog: &FileCatalog) -> StoreResult<()> {
        match self {
            Operation::Create {
                name,
                size,
                priority,
                node,
            } => catalog.create(name, *size, *priority, *node).map(|_| ()),
            Operation::Delete { name } => catalog.delete(name).map(|_| ()),
            Operation::Retrieve { name, dest } => catalog.retrieve(name, dest),
            Operation::Move { name, target } => catalog.move_file(name, *target).map(|_| ()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitMode {
    /// Return once everything is queued.
    Detached,
    /// Return once every worker has drained the queue and exited.
    Blocking,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OpFailure {
    pub step: String,
    pub name: String,
    pub error: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<OpFailure>,
}

impl BatchReport {
    fn record(&mut self, op: &Operation, res: StoreResult<()>) {
        match res {
            Ok(()) => self.succeeded += 1,
            Err(e) => {
                self.failed += 1;
                self.errors.push(OpFailure {
                    step: op.step().to_string(),
                    name: op.name().to_string(),
                    error: e.to_string(),
                });
            }
        }
    }
}

/// A submitted batch. Dropping it leaves the workers running.
pub struct BatchHandle {
    workers: Vec<JoinHandle<()>>,
    report: Arc<Mutex<BatchReport>>,
}

impl BatchHandle {
    pub fn is_finished(&self) -> bool {
        self.workers.iter().all(|w| w.is_finished())
    }

    /// Waits for the workers and returns the outcome of the batch.
    pub fn join(self) -> BatchReport {
        for w in self.workers {
            if w.join().is_err() {
                warn!("scheduler worker panicked");
            }
        }
        self.report.lock().clone()
    }
}

/// Worker pool for catalog operations. Each batch gets its own pool that
/// shuts down once the queue is drained.
pub struct TaskScheduler {
    catalog: Arc<FileCatalog>,
    workers: usize,
    timings: Option<Arc<StepTimings>>,
}

impl TaskScheduler {
    /// `workers` defaults to the machine's available parallelism.
    pub fn new(catalog: Arc<FileCatalog>, workers: Option<usize>) -> Self {
        let workers = workers
            .filter(|w| *w > 0)
            .unwrap_or_else(|| thread::available_parallelism().map_or(4, |n| n.get()));
        Self {
            catalog,
            workers,
            timings: None,
        }
    }

    /// Records the duration of every operation into `timings`.
    pub fn with_timings(mut self, timings: Arc<StepTimings>) -> Self {
        self.timings = Some(timings);
        self
    }

    pub fn timings(&self) -> Option<&Arc<StepTimings>> {
        self.timings.as_ref()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn catalog(&self) -> &Arc<FileCatalog> {
        &self.catalog
    }

    #[tracing::instrument(name = "scheduler.submit", skip(self, ops), fields(ops = ops.len()))]
    pub fn submit(&self, ops: Vec<Operation>, mode: SubmitMode) -> StoreResult<BatchHandle> {
        let report = Arc::new(Mutex::new(BatchReport {
            total: ops.len(),
            ..Default::default()
        }));
        let n_workers = self.workers.min(ops.len().max(1));

        // everything, sentinels included, is queued before any worker starts
        let (tx, rx) = unbounded::<Option<Operation>>();
        for op in ops.into_iter().map(Some).chain((0..n_workers).map(|_| None)) {
            tx.send(op)
                .map_err(|_| StoreError::Any(anyhow::anyhow!("worker queue closed")))?;
        }
        drop(tx);

        let mut workers = Vec::with_capacity(n_workers);
        for i in 0..n_workers {
            let worker = Worker {
                catalog: self.catalog.clone(),
                queue: rx.clone(),
                report: report.clone(),
                timings: self.timings.clone(),
            };
            match thread::Builder::new()
                .name(format!("psl-worker-{i}"))
                .spawn(move || worker.run())
            {
                Ok(handle) => workers.push(handle),
                Err(e) => warn!(worker = i, error = %e, "failed to spawn worker"),
            }
        }

        if workers.is_empty() {
            warn!("no worker could be spawned, draining batch inline");
            Worker {
                catalog: self.catalog.clone(),
                queue: rx,
                report: report.clone(),
                timings: self.timings.clone(),
            }
            .drain();
        }

        let handle = BatchHandle { workers, report };
        Ok(match mode {
            SubmitMode::Detached => handle,
            SubmitMode::Blocking => {
                let report = handle.report.clone();
                handle.join();
                BatchHandle {
                    workers: Vec::new(),
                    report,
                }
            }
        })
    }
}

struct Worker {
    catalog: Arc<FileCatalog>,
    queue: Receiver<Option<Operation>>,
    report: Arc<Mutex<BatchReport>>,
    timings: Option<Arc<StepTimings>>,
}

impl Worker {
    /// Runs operations until this worker's sentinel comes up.
    fn run(self) {
        while let Ok(Some(op)) = self.queue.recv() {
            self.execute(&op);
        }
    }

    /// Runs everything left in the queue, sentinels skipped.
    fn drain(self) {
        for op in self.queue.try_iter().flatten() {
            self.execute(&op);
        }
    }

    fn execute(&self, op: &Operation) {
        let start = Instant::now();
        let res = op.apply(&self.catalog);
        let elapsed = start.elapsed();

        match &res {
            Ok(()) => debug!(step = op.step(), name = op.name(), ?elapsed, "operation done"),
            Err(e) => warn!(step = op.step(), name = op.name(), error = %e, "operation failed"),
        }
        if let Some(timings) = &self.timings {
            timings.insert((op.step().to_string(), op.name().to_string()), elapsed);
        }
        self.report.lock().record(op, res);
    }
}
