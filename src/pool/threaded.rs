//! In-process backend with one worker per partition group, all stepped
//! concurrently on a rayon pool sized to the worker count.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::buffer::OutputBuffer;
use crate::cell::{CellInputs, CellWorker, FiredEvent, StepMode};
use crate::error::{PackError, Result};
use crate::pool::{
    check_input_shape, initial_inputs, log_fired_events, pack_events, Partition, PoolSetup,
    WorkerPool,
};

#[derive(Default)]
pub struct ThreadedPool {
    partition: Option<Partition>,
    runtime: Option<ThreadPool>,
    workers: Vec<CellWorker>,
    events: Vec<FiredEvent>,
}

impl ThreadedPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl WorkerPool for ThreadedPool {
    fn name(&self) -> &'static str {
        "threaded"
    }

    fn partition(
        &mut self,
        cell_count: usize,
        worker_count: usize,
        htc: &[f64],
    ) -> Result<&Partition> {
        Ok(&*self.partition.insert(Partition::new(cell_count, worker_count, htc)?))
    }

    fn partition_state(&self) -> Option<&Partition> {
        self.partition.as_ref()
    }

    fn spawn_workers(&mut self, setup: &PoolSetup) -> Result<()> {
        self.teardown();
        let partition = self
            .partition
            .as_ref()
            .ok_or_else(|| PackError::Config("threaded pool has not been partitioned".into()))?;
        let n_workers = partition.map.worker_count();
        let _span =
            tracing::info_span!("spawn_workers", backend = "threaded", workers = n_workers)
                .entered();
        let inputs = initial_inputs(partition, setup)?;

        let runtime = ThreadPoolBuilder::new()
            .num_threads(n_workers)
            .thread_name(|i| format!("cell-worker-{i}"))
            .build()
            .map_err(|e| PackError::Config(format!("failed to start thread pool: {e}")))?;

        let workers = runtime.install(|| {
            inputs
                .par_iter()
                .enumerate()
                .map(|(i, initial)| {
                    CellWorker::setup(&setup.model, initial, StepMode::Serial)
                        .map_err(|e| e.in_worker(i))
                })
                .collect::<Result<Vec<_>>>()
        })?;

        tracing::debug!(workers = workers.len(), "threaded workers ready");
        self.workers = workers;
        self.runtime = Some(runtime);
        Ok(())
    }

    fn step_all(&mut self, inputs: &[Vec<CellInputs>]) -> Result<bool> {
        let partition = self
            .partition
            .as_ref()
            .ok_or_else(|| PackError::Config("threaded pool has not been partitioned".into()))?;
        check_input_shape(partition, inputs)?;
        self.events.clear();
        let runtime = self.runtime.as_ref().ok_or_else(|| {
            PackError::Config("threaded pool has no workers; call spawn_workers first".into())
        })?;

        let workers = &mut self.workers;
        let fired = runtime.install(|| {
            workers
                .par_iter_mut()
                .zip(inputs.par_iter())
                .enumerate()
                .map(|(i, (worker, inputs))| worker.step(inputs).map_err(|e| e.in_worker(i)))
                .collect::<Result<Vec<bool>>>()
        })?;

        for (i, (&worker_fired, group)) in fired.iter().zip(partition.map.groups()).enumerate() {
            if worker_fired {
                let events = pack_events(group.start, &self.workers[i].fired_events());
                log_fired_events(i, &events);
                self.events.extend(events);
            }
        }
        Ok(fired.into_iter().any(|f| f))
    }

    fn fired_events(&self) -> &[FiredEvent] {
        &self.events
    }

    fn collect_outputs(&mut self, buffer: &mut OutputBuffer, step: usize) -> Result<()> {
        let partition = self
            .partition
            .as_ref()
            .ok_or_else(|| PackError::Config("threaded pool has not been partitioned".into()))?;
        if self.workers.len() != partition.map.worker_count() {
            return Err(PackError::Config(
                "threaded pool has no workers; call spawn_workers first".into(),
            ));
        }
        for (worker, group) in self.workers.iter().zip(partition.map.groups()) {
            buffer.write_cells(step, group.clone(), worker.output())?;
        }
        Ok(())
    }

    fn teardown(&mut self) {
        if !self.workers.is_empty() {
            tracing::debug!(workers = self.workers.len(), "threaded workers released");
        }
        self.workers.clear();
        self.runtime = None;
        self.events.clear();
    }
}
