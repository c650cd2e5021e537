//! Actor backend: every worker lives on its own dedicated thread and is
//! driven through channels.
//!
//! Each actor builds its worker on its own thread, so a model that is
//! expensive to construct never blocks the others. The pool owns the
//! threads; `teardown` asks each actor to stop and joins it. An actor that
//! missed the step timeout is assumed hung and is detached instead of
//! joined.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::buffer::{CellOutputs, OutputBuffer};
use crate::cell::{CellInputs, CellWorker, FiredEvent, ModelSpec, StepMode};
use crate::error::{PackError, Result};
use crate::pool::{
    check_input_shape, initial_inputs, log_fired_events, pack_events, Partition, PoolSetup,
    StepReport, WorkerPool,
};

enum Command {
    Step(Vec<CellInputs>),
    Shutdown,
}

enum Reply {
    Ready(Result<CellOutputs>),
    Stepped(Result<StepReport>),
}

struct Actor {
    commands: Sender<Command>,
    replies: Receiver<Reply>,
    handle: Option<JoinHandle<()>>,
    outputs: Option<CellOutputs>,
    hung: bool,
}

fn run_actor(
    spec: ModelSpec,
    initial: Vec<CellInputs>,
    commands: Receiver<Command>,
    replies: Sender<Reply>,
) {
    let mut worker = match CellWorker::setup(&spec, &initial, StepMode::Serial) {
        Ok(worker) => {
            if replies.send(Reply::Ready(Ok(worker.output().clone()))).is_err() {
                return;
            }
            worker
        }
        Err(e) => {
            let _ = replies.send(Reply::Ready(Err(e)));
            return;
        }
    };

    while let Ok(command) = commands.recv() {
        match command {
            Command::Step(inputs) => {
                let report = worker.step(&inputs).map(|fired| StepReport::new(&worker, fired));
                if replies.send(Reply::Stepped(report)).is_err() {
                    return;
                }
            }
            Command::Shutdown => return,
        }
    }
}

pub struct ActorPool {
    partition: Option<Partition>,
    step_timeout: Option<Duration>,
    actors: Vec<Actor>,
    events: Vec<FiredEvent>,
}

impl ActorPool {
    /// `step_timeout` bounds how long `step_all` waits for any one actor.
    pub fn new(step_timeout: Option<Duration>) -> Self {
        Self {
            partition: None,
            step_timeout,
            actors: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }

    /// Wait for actor `index`'s next reply, honouring the step timeout.
    fn receive(&mut self, index: usize, deadline: Option<Instant>) -> Result<Reply> {
        let timeout = self.step_timeout.unwrap_or_default();
        let actor = &mut self.actors[index];
        let Some(deadline) = deadline else {
            return actor
                .replies
                .recv()
                .map_err(|_| PackError::WorkerDisconnected(index));
        };
        match actor.replies.recv_deadline(deadline) {
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => {
                actor.hung = true;
                Err(PackError::WorkerTimeout { index, timeout })
            }
            Err(RecvTimeoutError::Disconnected) => Err(PackError::WorkerDisconnected(index)),
        }
    }
}

impl WorkerPool for ActorPool {
    fn name(&self) -> &'static str {
        "actor"
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
            .ok_or_else(|| PackError::Config("actor pool has not been partitioned".into()))?;
        let workers = partition.map.worker_count();
        let _span = tracing::info_span!("spawn_workers", backend = "actor", workers).entered();
        let inputs = initial_inputs(partition, setup)?;

        for (i, initial) in inputs.into_iter().enumerate() {
            let (command_tx, command_rx) = unbounded();
            let (reply_tx, reply_rx) = unbounded();
            let spec = setup.model.clone();
            let handle = std::thread::Builder::new()
                .name(format!("cell-actor-{i}"))
                .spawn(move || run_actor(spec, initial, command_rx, reply_tx))?;
            self.actors.push(Actor {
                commands: command_tx,
                replies: reply_rx,
                handle: Some(handle),
                outputs: None,
                hung: false,
            });
        }

        // Construction is not covered by the step timeout.
        for i in 0..self.actors.len() {
            match self.receive(i, None)? {
                Reply::Ready(Ok(outputs)) => self.actors[i].outputs = Some(outputs),
                Reply::Ready(Err(e)) => return Err(e.in_worker(i)),
                Reply::Stepped(_) => {
                    return Err(PackError::Config(format!(
                        "actor {i} replied out of order during setup"
                    )))
                }
            }
        }
        tracing::debug!(actors = self.actors.len(), "actors ready");
        Ok(())
    }

    fn step_all(&mut self, inputs: &[Vec<CellInputs>]) -> Result<bool> {
        let partition = self
            .partition
            .as_ref()
            .ok_or_else(|| PackError::Config("actor pool has not been partitioned".into()))?;
        check_input_shape(partition, inputs)?;
        if self.actors.len() != inputs.len() {
            return Err(PackError::Config(
                "actor pool has no workers; call spawn_workers first".into(),
            ));
        }
        let offsets: Vec<usize> = partition.map.groups().iter().map(|g| g.start).collect();
        self.events.clear();

        for (i, (actor, group)) in self.actors.iter().zip(inputs).enumerate() {
            actor
                .commands
                .send(Command::Step(group.clone()))
                .map_err(|_| PackError::WorkerDisconnected(i))?;
        }

        // Every actor is drained before an error is reported, so no reply is
        // left queued for the next step.
        let deadline = self.step_timeout.map(|t| Instant::now() + t);
        let mut any_fired = false;
        let mut first_error = None;
        for i in 0..self.actors.len() {
            let report = match self.receive(i, deadline) {
                Ok(Reply::Stepped(report)) => report.map_err(|e| e.in_worker(i)),
                Ok(Reply::Ready(_)) => {
                    Err(PackError::Config(format!("actor {i} replied out of order")))
                }
                Err(e) => Err(e),
            };
            match report {
                Ok(report) => {
                    if report.fired {
                        let events = pack_events(offsets[i], &report.events);
                        log_fired_events(i, &events);
                        self.events.extend(events);
                    }
                    any_fired |= report.fired;
                    self.actors[i].outputs = Some(report.outputs);
                }
                Err(e) => {
                    tracing::error!(actor = i, error = %e, "actor step failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(any_fired),
        }
    }

    fn fired_events(&self) -> &[FiredEvent] {
        &self.events
    }

    fn collect_outputs(&mut self, buffer: &mut OutputBuffer, step: usize) -> Result<()> {
        let partition = self
            .partition
            .as_ref()
            .ok_or_else(|| PackError::Config("actor pool has not been partitioned".into()))?;
        if self.actors.len() != partition.map.worker_count() {
            return Err(PackError::Config(
                "actor pool has no workers; call spawn_workers first".into(),
            ));
        }
        for (i, (actor, group)) in self.actors.iter().zip(partition.map.groups()).enumerate() {
            let outputs = actor.outputs.as_ref().ok_or(PackError::WorkerDisconnected(i))?;
            buffer.write_cells(step, group.clone(), outputs)?;
        }
        Ok(())
    }

    fn teardown(&mut self) {
        if self.actors.is_empty() {
            return;
        }
        let actors = self.actors.len();
        let _span = tracing::info_span!("teardown", backend = "actor", actors).entered();
        for actor in &self.actors {
            // A closed channel means the actor already exited.
            let _ = actor.commands.send(Command::Shutdown);
        }
        self.events.clear();
        for (i, mut actor) in self.actors.drain(..).enumerate() {
            let Some(handle) = actor.handle.take() else { continue };
            if actor.hung {
                tracing::warn!(actor = i, "actor missed its step deadline; detaching thread");
                drop(handle);
                continue;
            }
            if handle.join().is_err() {
                tracing::error!(actor = i, "actor thread panicked");
            }
        }
    }
}

impl Drop for ActorPool {
    fn drop(&mut self) {
        self.teardown();
    }
}
