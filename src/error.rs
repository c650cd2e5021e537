use std::time::Duration;

use thiserror::Error;

use crate::solver::PackSolution;

#[derive(Debug, Error)]
pub enum PackError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Netlist error: {0}")]
    Netlist(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Circuit error: {0}")]
    Circuit(String),

    #[error("Integration failure: {0}")]
    Integration(String),

    #[error("Worker {index} failed: {source}")]
    Worker {
        index: usize,
        #[source]
        source: Box<PackError>,
    },

    #[error("Worker {index} did not finish its step within {timeout:?}")]
    WorkerTimeout { index: usize, timeout: Duration },

    #[error("Worker {0} disconnected")]
    WorkerDisconnected(usize),

    /// Error raised inside a worker process, carried back as text.
    #[error("Remote worker error: {0}")]
    Remote(String),

    #[error("Worker message error: {0}")]
    Codec(#[from] bincode::Error),

    /// Failure after stepping began. Carries everything recorded before the
    /// failing step.
    #[error("Solve failed at step {step}: {source}")]
    SolveFailed {
        step: usize,
        #[source]
        source: Box<PackError>,
        partial: Box<PackSolution>,
    },

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PackError {
    /// Attribute an error to the worker that raised it.
    pub fn in_worker(self, index: usize) -> Self {
        match self {
            PackError::Worker { .. }
            | PackError::WorkerTimeout { .. }
            | PackError::WorkerDisconnected(_) => self,
            other => PackError::Worker {
                index,
                source: Box::new(other),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, PackError>;
