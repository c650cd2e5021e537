//! Worker pools: partition the pack's cells across workers and step them in
//! lock-step.
//!
//! Every backend implements [`WorkerPool`]. The orchestrator only talks to
//! the trait, so switching backends never changes the pack physics.

pub mod actor;
pub mod local;
pub mod process;
pub mod threaded;

use std::ops::Range;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::{CellOutputs, OutputBuffer};
use crate::cell::{CellInputs, CellWorker, FiredEvent, ModelSpec};
use crate::error::{PackError, Result};

pub use actor::ActorPool;
pub use local::LocalPool;
pub use process::ProcessPool;
pub use threaded::ThreadedPool;

/// Contiguous assignment of cell indices to workers.
///
/// The first `cell_count % parts` groups hold one extra cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMap {
    cell_count: usize,
    groups: Vec<Range<usize>>,
}

impl PartitionMap {
    pub fn split(cell_count: usize, parts: usize) -> Result<Self> {
        if cell_count == 0 {
            return Err(PackError::Config("pack has no cells".into()));
        }
        if parts == 0 || parts > cell_count {
            return Err(PackError::Config(format!(
                "cannot split {cell_count} cells across {parts} workers"
            )));
        }
        let base = cell_count / parts;
        let extra = cell_count % parts;
        let mut start = 0;
        let groups = (0..parts)
            .map(|i| {
                let len = base + usize::from(i < extra);
                let group = start..start + len;
                start += len;
                group
            })
            .collect();
        Ok(Self { cell_count, groups })
    }

    pub fn groups(&self) -> &[Range<usize>] {
        &self.groups
    }

    pub fn worker_count(&self) -> usize {
        self.groups.len()
    }

    pub fn cell_count(&self) -> usize {
        self.cell_count
    }

    /// Cut a per-cell slice into per-worker pieces.
    pub fn split_slice<'a, T>(&self, values: &'a [T]) -> Vec<&'a [T]> {
        self.groups.iter().map(|g| &values[g.clone()]).collect()
    }

    pub fn worker_of(&self, cell: usize) -> Option<usize> {
        self.groups.iter().position(|g| g.contains(&cell))
    }
}

/// Partition map plus the per-cell side data split along it.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub map: PartitionMap,
    /// Heat transfer coefficient per worker, per owned cell.
    pub htc: Vec<Vec<f64>>,
}

impl Partition {
    pub fn new(cell_count: usize, parts: usize, htc: &[f64]) -> Result<Self> {
        if htc.len() != cell_count {
            return Err(PackError::Config(format!(
                "{} heat transfer coefficients given for {cell_count} cells",
                htc.len()
            )));
        }
        let map = PartitionMap::split(cell_count, parts)?;
        let htc = map.split_slice(htc).into_iter().map(<[f64]>::to_vec).collect();
        Ok(Self { map, htc })
    }

    /// Per-worker inputs from the pack-wide cell currents.
    pub fn build_inputs(&self, currents: &[f64]) -> Result<Vec<Vec<CellInputs>>> {
        if currents.len() != self.map.cell_count() {
            return Err(PackError::Config(format!(
                "{} cell currents given for {} cells",
                currents.len(),
                self.map.cell_count()
            )));
        }
        Ok(self
            .map
            .groups()
            .iter()
            .zip(&self.htc)
            .map(|(group, htc)| {
                currents[group.clone()]
                    .iter()
                    .zip(htc)
                    .map(|(&current, &htc)| CellInputs::new(current, htc))
                    .collect()
            })
            .collect())
    }
}

/// What every worker is built from.
#[derive(Debug, Clone)]
pub struct PoolSetup {
    pub model: ModelSpec,
    /// Pack-wide applied current per cell from the initial circuit solve.
    pub initial_current: Vec<f64>,
}

/// Execution backend for the cell workers.
pub trait WorkerPool: Send {
    fn name(&self) -> &'static str;

    /// Split `cell_count` cells and their heat transfer coefficients across
    /// `worker_count` workers. Backends that vectorise internally may use a
    /// single group.
    fn partition(
        &mut self,
        cell_count: usize,
        worker_count: usize,
        htc: &[f64],
    ) -> Result<&Partition>;

    /// Partition in force, if [`WorkerPool::partition`] has run.
    fn partition_state(&self) -> Option<&Partition>;

    /// Build one worker per partition group. Blocks until every worker is
    /// ready; any workers from a previous call are torn down first.
    fn spawn_workers(&mut self, setup: &PoolSetup) -> Result<()>;

    /// Step every worker once. Returns whether any worker saw an event.
    fn step_all(&mut self, inputs: &[Vec<CellInputs>]) -> Result<bool>;

    /// Events fired by the last [`WorkerPool::step_all`], with pack-wide
    /// cell indices.
    fn fired_events(&self) -> &[FiredEvent];

    /// Copy every worker's latest outputs into row `step` of `buffer`.
    fn collect_outputs(&mut self, buffer: &mut OutputBuffer, step: usize) -> Result<()>;

    /// Release every worker. Never fails; problems are logged.
    fn teardown(&mut self);

    /// Per-worker inputs from pack-wide cell currents.
    fn build_inputs(&self, currents: &[f64]) -> Result<Vec<Vec<CellInputs>>> {
        self.partition_state()
            .ok_or_else(|| {
                PackError::Config(format!("{} pool has not been partitioned", self.name()))
            })?
            .build_inputs(currents)
    }
}

/// Initial inputs per worker: initial current and htc per owned cell.
pub(crate) fn initial_inputs(
    partition: &Partition,
    setup: &PoolSetup,
) -> Result<Vec<Vec<CellInputs>>> {
    partition.build_inputs(&setup.initial_current)
}

pub(crate) fn check_input_shape(partition: &Partition, inputs: &[Vec<CellInputs>]) -> Result<()> {
    if inputs.len() != partition.map.worker_count() {
        return Err(PackError::Config(format!(
            "{} input groups for {} workers",
            inputs.len(),
            partition.map.worker_count()
        )));
    }
    Ok(())
}

/// What a worker sends back after one step, for backends that move it
/// across a thread or process boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StepReport {
    pub fired: bool,
    /// Worker-local cell indices.
    pub events: Vec<FiredEvent>,
    pub outputs: CellOutputs,
}

impl StepReport {
    pub fn new(worker: &CellWorker, fired: bool) -> Self {
        Self {
            fired,
            events: if fired { worker.fired_events() } else { Vec::new() },
            outputs: worker.output().clone(),
        }
    }
}

/// Shift worker-local event cell indices by the worker's first cell.
pub fn pack_events(offset: usize, events: &[FiredEvent]) -> Vec<FiredEvent> {
    events
        .iter()
        .map(|event| FiredEvent {
            name: event.name.clone(),
            cells: event.cells.iter().map(|c| c + offset).collect(),
        })
        .collect()
}

/// Log events from one worker. Cell indices must already be pack-wide.
pub(crate) fn log_fired_events(worker: usize, events: &[FiredEvent]) {
    for event in events {
        tracing::warn!(worker, event = %event.name, cells = ?event.cells, "cell event triggered");
    }
}

/// Backend choice, as named in run configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Local,
    Threaded,
    Actor,
    Process,
}

impl Backend {
    /// Whether the backend can abandon a worker that overruns its step.
    pub fn supports_step_timeout(self) -> bool {
        matches!(self, Backend::Actor | Backend::Process)
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Backend::Local => "local",
            Backend::Threaded => "threaded",
            Backend::Actor => "actor",
            Backend::Process => "process",
        };
        f.write_str(name)
    }
}

/// Build an empty pool for `backend`. `step_timeout` applies to the actor
/// and process backends; the others ignore it with a warning.
///
/// The process backend re-runs the current executable as its workers.
pub fn build_pool(backend: Backend, step_timeout: Option<Duration>) -> Box<dyn WorkerPool> {
    if step_timeout.is_some() && !backend.supports_step_timeout() {
        tracing::warn!(%backend, "step timeout is ignored by this backend");
    }
    match backend {
        Backend::Local => Box::new(LocalPool::new()),
        Backend::Threaded => Box::new(ThreadedPool::new()),
        Backend::Actor => Box::new(ActorPool::new(step_timeout)),
        Backend::Process => Box::new(ProcessPool::new(step_timeout)),
    }
}
