//! Process backend: every worker runs in its own child process.
//!
//! Children are the packsim executable started as `packsim worker`. The pool
//! drives each one over its stdin/stdout with bincode-encoded requests and
//! responses; stderr is inherited so worker logs land next to the
//! orchestrator's. A crashing child only fails its own worker, and a child
//! that misses the step timeout is killed at teardown.
//!
//! Only the built-in lumped cell model runs here. A custom
//! `CellModelFactory` lives in the orchestrator's memory and cannot be sent.

use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::buffer::{CellOutputs, OutputBuffer};
use crate::cell::{CellInputs, CellWorker, FiredEvent, ModelSpec, StepMode};
use crate::error::{PackError, Result};
use crate::parameters::ParameterValues;
use crate::pool::{
    check_input_shape, initial_inputs, log_fired_events, pack_events, Partition, PoolSetup,
    StepReport, WorkerPool,
};

/// Subcommand that turns the executable into a worker.
pub const WORKER_COMMAND: &str = "worker";

/// How long teardown waits for a child to exit after asking it to.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// What a worker process builds its cells from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WorkerSetup {
    parameters: ParameterValues,
    dt: f64,
    variable_names: Vec<String>,
    initial_soc: f64,
    initial: Vec<CellInputs>,
}

impl WorkerSetup {
    fn from_model(model: &ModelSpec, initial: Vec<CellInputs>) -> Result<Self> {
        if model.factory.is_some() {
            return Err(PackError::Config(
                "process backend runs only the built-in cell model; \
                 custom model factories cannot be sent to a worker process"
                    .into(),
            ));
        }
        Ok(Self {
            parameters: (*model.parameters).clone(),
            dt: model.dt,
            variable_names: model.variable_names.to_vec(),
            initial_soc: model.initial_soc,
            initial,
        })
    }

    fn build(&self) -> Result<CellWorker> {
        let spec = ModelSpec {
            factory: None,
            parameters: Arc::new(self.parameters.clone()),
            dt: self.dt,
            variable_names: self.variable_names.clone().into(),
            initial_soc: self.initial_soc,
        };
        CellWorker::setup(&spec, &self.initial, StepMode::Serial)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum Request {
    Setup(WorkerSetup),
    Step(Vec<CellInputs>),
    Shutdown,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum Response {
    Ready(std::result::Result<CellOutputs, RemoteError>),
    Stepped(std::result::Result<StepReport, RemoteError>),
}

/// A worker error in a form that survives the trip between processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum RemoteError {
    Config(String),
    Integration(String),
    Other(String),
}

impl From<PackError> for RemoteError {
    fn from(e: PackError) -> Self {
        match e {
            PackError::Config(msg) => RemoteError::Config(msg),
            PackError::Integration(msg) => RemoteError::Integration(msg),
            other => RemoteError::Other(other.to_string()),
        }
    }
}

impl From<RemoteError> for PackError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Config(msg) => PackError::Config(msg),
            RemoteError::Integration(msg) => PackError::Integration(msg),
            RemoteError::Other(msg) => PackError::Remote(msg),
        }
    }
}

fn write_message<W: Write, T: Serialize>(mut writer: W, message: &T) -> Result<()> {
    bincode::serialize_into(&mut writer, message)?;
    writer.flush()?;
    Ok(())
}

/// Next message, or `None` once the stream has ended.
fn read_message<R: Read, T: DeserializeOwned>(reader: R) -> Result<Option<T>> {
    match bincode::deserialize_from(reader) {
        Ok(message) => Ok(Some(message)),
        Err(e) => {
            let eof = matches!(
                &*e,
                bincode::ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof
            );
            if eof {
                Ok(None)
            } else {
                Err(e.into())
            }
        }
    }
}

/// Serve one worker: answer requests from `input` on `output` until told to
/// shut down or until `input` closes.
pub fn serve<R: Read, W: Write>(mut input: R, mut output: W) -> Result<()> {
    let mut worker: Option<CellWorker> = None;
    while let Some(request) = read_message::<_, Request>(&mut input)? {
        let response = match request {
            Request::Setup(setup) => {
                let ready = setup.build().map(|built| {
                    let outputs = built.output().clone();
                    worker = Some(built);
                    outputs
                });
                tracing::debug!(cells = setup.initial.len(), ok = ready.is_ok(), "worker set up");
                Response::Ready(ready.map_err(RemoteError::from))
            }
            Request::Step(inputs) => {
                let report = match worker.as_mut() {
                    Some(worker) => worker
                        .step(&inputs)
                        .map(|fired| StepReport::new(&*worker, fired)),
                    None => Err(PackError::Config("worker stepped before setup".into())),
                };
                Response::Stepped(report.map_err(RemoteError::from))
            }
            Request::Shutdown => break,
        };
        write_message(&mut output, &response)?;
    }
    Ok(())
}

struct WorkerProcess {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    replies: Receiver<Result<Response>>,
    reader: Option<JoinHandle<()>>,
    outputs: Option<CellOutputs>,
    hung: bool,
}

/// Forward decoded responses from a child's stdout until it closes.
fn read_replies(stdout: ChildStdout, replies: Sender<Result<Response>>) {
    let mut reader = BufReader::new(stdout);
    loop {
        match read_message::<_, Response>(&mut reader) {
            Ok(Some(response)) => {
                if replies.send(Ok(response)).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                let _ = replies.send(Err(e));
                return;
            }
        }
    }
}

fn spawn_worker(program: &Path, index: usize) -> Result<WorkerProcess> {
    let mut child = Command::new(program)
        .arg(WORKER_COMMAND)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| {
            PackError::Config(format!("cannot start worker process {}: {e}", program.display()))
        })?;

    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(PackError::WorkerDisconnected(index));
    };
    let (reply_tx, reply_rx) = unbounded();
    let reader = std::thread::Builder::new()
        .name(format!("cell-process-{index}"))
        .spawn(move || read_replies(stdout, reply_tx));
    let reader = match reader {
        Ok(handle) => handle,
        Err(e) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e.into());
        }
    };

    Ok(WorkerProcess {
        child,
        stdin: Some(BufWriter::new(stdin)),
        replies: reply_rx,
        reader: Some(reader),
        outputs: None,
        hung: false,
    })
}

/// Wait for `child` to exit, killing it once `grace` has passed.
fn wait_with_grace(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    let deadline = Instant::now() + grace;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            tracing::warn!(pid = child.id(), "worker process did not exit; killing it");
            let _ = child.kill();
            return child.wait();
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub struct ProcessPool {
    partition: Option<Partition>,
    step_timeout: Option<Duration>,
    program: Option<PathBuf>,
    workers: Vec<WorkerProcess>,
    events: Vec<FiredEvent>,
}

impl ProcessPool {
    /// `step_timeout` bounds how long `step_all` waits for any one process.
    pub fn new(step_timeout: Option<Duration>) -> Self {
        Self {
            partition: None,
            step_timeout,
            program: None,
            workers: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Executable started as `<program> worker`. Defaults to the current
    /// executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn process_count(&self) -> usize {
        self.workers.len()
    }

    fn send(&mut self, index: usize, request: &Request) -> Result<()> {
        let stdin = self.workers[index]
            .stdin
            .as_mut()
            .ok_or(PackError::WorkerDisconnected(index))?;
        write_message(stdin, request).map_err(|e| {
            tracing::debug!(process = index, error = %e, "request not delivered");
            PackError::WorkerDisconnected(index)
        })
    }

    /// Wait for process `index`'s next response, honouring the step timeout.
    fn receive(&mut self, index: usize, deadline: Option<Instant>) -> Result<Response> {
        let timeout = self.step_timeout.unwrap_or_default();
        let worker = &mut self.workers[index];
        let Some(deadline) = deadline else {
            return worker
                .replies
                .recv()
                .map_err(|_| PackError::WorkerDisconnected(index))?;
        };
        match worker.replies.recv_deadline(deadline) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => {
                worker.hung = true;
                Err(PackError::WorkerTimeout { index, timeout })
            }
            Err(RecvTimeoutError::Disconnected) => Err(PackError::WorkerDisconnected(index)),
        }
    }
}

impl WorkerPool for ProcessPool {
    fn name(&self) -> &'static str {
        "process"
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
            .ok_or_else(|| PackError::Config("process pool has not been partitioned".into()))?;
        let workers = partition.map.worker_count();
        let _span = tracing::info_span!("spawn_workers", backend = "process", workers).entered();
        let setups = initial_inputs(partition, setup)?
            .into_iter()
            .map(|initial| WorkerSetup::from_model(&setup.model, initial))
            .collect::<Result<Vec<_>>>()?;
        let program = match &self.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };

        for (i, worker_setup) in setups.into_iter().enumerate() {
            self.workers.push(spawn_worker(&program, i)?);
            self.send(i, &Request::Setup(worker_setup))?;
        }

        // Construction is not covered by the step timeout.
        for i in 0..self.workers.len() {
            match self.receive(i, None)? {
                Response::Ready(Ok(outputs)) => self.workers[i].outputs = Some(outputs),
                Response::Ready(Err(e)) => return Err(PackError::from(e).in_worker(i)),
                Response::Stepped(_) => {
                    return Err(PackError::Config(format!(
                        "worker process {i} replied out of order during setup"
                    )))
                }
            }
        }
        tracing::debug!(
            processes = self.workers.len(),
            program = %program.display(),
            "worker processes ready"
        );
        Ok(())
    }

    fn step_all(&mut self, inputs: &[Vec<CellInputs>]) -> Result<bool> {
        let partition = self
            .partition
            .as_ref()
            .ok_or_else(|| PackError::Config("process pool has not been partitioned".into()))?;
        check_input_shape(partition, inputs)?;
        if self.workers.len() != inputs.len() {
            return Err(PackError::Config(
                "process pool has no workers; call spawn_workers first".into(),
            ));
        }
        let offsets: Vec<usize> = partition.map.groups().iter().map(|g| g.start).collect();
        self.events.clear();

        for (i, group) in inputs.iter().enumerate() {
            self.send(i, &Request::Step(group.clone()))?;
        }

        // Drain every process so no response is left queued for the next step.
        let deadline = self.step_timeout.map(|t| Instant::now() + t);
        let mut any_fired = false;
        let mut first_error = None;
        for i in 0..self.workers.len() {
            let report = match self.receive(i, deadline) {
                Ok(Response::Stepped(report)) => {
                    report.map_err(|e| PackError::from(e).in_worker(i))
                }
                Ok(Response::Ready(_)) => Err(PackError::Config(format!(
                    "worker process {i} replied out of order"
                ))),
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
                    self.workers[i].outputs = Some(report.outputs);
                }
                Err(e) => {
                    tracing::error!(process = i, error = %e, "worker process step failed");
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
            .ok_or_else(|| PackError::Config("process pool has not been partitioned".into()))?;
        if self.workers.len() != partition.map.worker_count() {
            return Err(PackError::Config(
                "process pool has no workers; call spawn_workers first".into(),
            ));
        }
        for (i, (worker, group)) in self.workers.iter().zip(partition.map.groups()).enumerate() {
            let outputs = worker.outputs.as_ref().ok_or(PackError::WorkerDisconnected(i))?;
            buffer.write_cells(step, group.clone(), outputs)?;
        }
        Ok(())
    }

    fn teardown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        let processes = self.workers.len();
        let _span = tracing::info_span!("teardown", backend = "process", processes).entered();
        self.events.clear();
        for worker in &mut self.workers {
            if let Some(mut stdin) = worker.stdin.take() {
                // A closed pipe means the child already exited.
                let _ = write_message(&mut stdin, &Request::Shutdown);
            }
        }
        for (i, mut worker) in self.workers.drain(..).enumerate() {
            if worker.hung {
                tracing::warn!(process = i, "worker process missed its step deadline; killing it");
                let _ = worker.child.kill();
            }
            match wait_with_grace(&mut worker.child, EXIT_GRACE) {
                Ok(status) if !status.success() && !worker.hung => {
                    tracing::warn!(process = i, %status, "worker process exited with failure");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(process = i, error = %e, "cannot reap worker process"),
            }
            if let Some(reader) = worker.reader.take() {
                if reader.join().is_err() {
                    tracing::error!(process = i, "reply reader thread panicked");
                }
            }
        }
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        self.teardown();
    }
}
