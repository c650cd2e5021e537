//! In-process backend with a single worker owning every cell.
//!
//! With more than one requested worker the cells are mapped across a rayon
//! thread pool owned by this instance; with one they are stepped serially.

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::buffer::OutputBuffer;
use crate::cell::{CellInputs, CellWorker, FiredEvent, StepMode};
use crate::error::{PackError, Result};
use crate::pool::{
    check_input_shape, initial_inputs, log_fired_events, pack_events, Partition, PoolSetup,
    WorkerPool,
};

#[derive(Default)]
pub struct LocalPool {
    partition: Option<Partition>,
    threads: usize,
    runtime: Option<ThreadPool>,
    worker: Option<CellWorker>,
    events: Vec<FiredEvent>,
}

impl LocalPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn worker_mut(&mut self) -> Result<&mut CellWorker> {
        self.worker.as_mut().ok_or_else(|| {
            PackError::Config("local pool has no worker; call spawn_workers first".into())
        })
    }
}

impl WorkerPool for LocalPool {
    fn name(&self) -> &'static str {
        "local"
    }

    fn partition(
        &mut self,
        cell_count: usize,
        worker_count: usize,
        htc: &[f64],
    ) -> Result<&Partition> {
        if worker_count == 0 || worker_count > cell_count {
            return Err(PackError::Config(format!(
                "cannot split {cell_count} cells across {worker_count} workers"
            )));
        }
        self.threads = worker_count;
        Ok(&*self.partition.insert(Partition::new(cell_count, 1, htc)?))
    }

    fn partition_state(&self) -> Option<&Partition> {
        self.partition.as_ref()
    }

    fn spawn_workers(&mut self, setup: &PoolSetup) -> Result<()> {
        let _span =
            tracing::info_span!("spawn_workers", backend = "local", threads = self.threads)
                .entered();
        self.teardown();
        let partition = self
            .partition
            .as_ref()
            .ok_or_else(|| PackError::Config("local pool has not been partitioned".into()))?;
        let inputs = initial_inputs(partition, setup)?;

        let mode = if self.threads > 1 {
            let runtime = ThreadPoolBuilder::new()
                .num_threads(self.threads)
                .thread_name(|i| format!("cell-map-{i}"))
                .build()
                .map_err(|e| PackError::Config(format!("failed to start thread pool: {e}")))?;
            self.runtime = Some(runtime);
            StepMode::Mapped
        } else {
            StepMode::Serial
        };

        let worker =
            CellWorker::setup(&setup.model, &inputs[0], mode).map_err(|e| e.in_worker(0))?;
        tracing::debug!(cells = worker.cell_count(), ?mode, "local worker ready");
        self.worker = Some(worker);
        Ok(())
    }

    fn step_all(&mut self, inputs: &[Vec<CellInputs>]) -> Result<bool> {
        if let Some(partition) = &self.partition {
            check_input_shape(partition, inputs)?;
        }
        self.events.clear();
        let worker = self.worker.as_mut().ok_or_else(|| {
            PackError::Config("local pool has no worker; call spawn_workers first".into())
        })?;
        let result = match &self.runtime {
            Some(pool) => pool.install(|| worker.step(&inputs[0])),
            None => worker.step(&inputs[0]),
        };

        let fired = result.map_err(|e| e.in_worker(0))?;
        if fired {
            self.events = pack_events(0, &worker.fired_events());
            log_fired_events(0, &self.events);
        }
        Ok(fired)
    }

    fn fired_events(&self) -> &[FiredEvent] {
        &self.events
    }

    fn collect_outputs(&mut self, buffer: &mut OutputBuffer, step: usize) -> Result<()> {
        let worker = self.worker_mut()?;
        let cells = 0..worker.cell_count();
        buffer.write_cells(step, cells, worker.output())
    }

    fn teardown(&mut self) {
        if let Some(worker) = self.worker.take() {
            tracing::debug!(cells = worker.cell_count(), "local worker released");
        }
        self.runtime = None;
        self.events.clear();
    }
}
