//! TOML run configuration.
//!
//! ```toml
//! [solver]
//! backend = "threaded"        # local | threaded | actor | process
//! workers = 4
//! initial_soc = 0.5
//! output_variables = ["State of charge"]
//! htc = 10.0                  # or one value per cell
//! step_timeout_secs = 30.0    # actor and process backends only
//!
//! [parameters]
//! "Lower voltage cut-off [V]" = 3.0
//!
//! [experiment]
//! period = 10.0
//! steps = ["Discharge at 20 A for 30 minutes", "Rest for 10 minutes"]
//!
//! [circuit]
//! parallel = 4
//! series = 2
//! ```
//!
//! `[experiment]` takes either `steps` or `profile = "cycle.csv"`, a
//! time/current drive cycle resampled onto `period`.
//!
//! `[circuit]` is either a pack topology as above or `netlist = "pack.cir"`,
//! resolved relative to the config file. So is a profile path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::cell::default_parameters;
use crate::error::{PackError, Result};
use crate::netlist::{self, Netlist};
use crate::parameters::ParameterValues;
use crate::pool::{build_pool, Backend, WorkerPool};
use crate::protocol::ExperimentConfig;
use crate::solver::{PackProblem, PackSolver, DEFAULT_HTC, DEFAULT_INITIAL_SOC};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    #[serde(default)]
    pub solver: SolverConfig,
    /// Overrides on top of the default lumped cell parameters.
    #[serde(default)]
    pub parameters: ParameterValues,
    pub experiment: ExperimentConfig,
    pub circuit: CircuitConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolverConfig {
    pub backend: Backend,
    pub workers: usize,
    pub initial_soc: f64,
    pub output_variables: Vec<String>,
    pub htc: Htc,
    pub step_timeout_secs: Option<f64>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Local,
            workers: 1,
            initial_soc: DEFAULT_INITIAL_SOC,
            output_variables: Vec::new(),
            htc: Htc::Uniform(DEFAULT_HTC),
            step_timeout_secs: None,
        }
    }
}

/// Heat transfer coefficient for every cell, or one per cell.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Htc {
    Uniform(f64),
    PerCell(Vec<f64>),
}

impl Htc {
    pub fn values(&self) -> Vec<f64> {
        match self {
            Htc::Uniform(h) => vec![*h],
            Htc::PerCell(h) => h.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum CircuitConfig {
    File { netlist: PathBuf },
    Pack(PackTopology),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackTopology {
    pub parallel: usize,
    pub series: usize,
    #[serde(default = "PackTopology::default_busbar_resistance")]
    pub busbar_resistance: f64,
    #[serde(default = "PackTopology::default_connection_resistance")]
    pub connection_resistance: f64,
    #[serde(default = "PackTopology::default_internal_resistance")]
    pub internal_resistance: f64,
    #[serde(default = "PackTopology::default_ocv")]
    pub ocv: f64,
    #[serde(default = "PackTopology::default_current")]
    pub current: f64,
}

impl PackTopology {
    fn default_busbar_resistance() -> f64 {
        1e-4
    }
    fn default_connection_resistance() -> f64 {
        1e-2
    }
    fn default_internal_resistance() -> f64 {
        5e-2
    }
    fn default_ocv() -> f64 {
        4.0
    }
    fn default_current() -> f64 {
        1.0
    }

    pub fn build(&self) -> Result<Netlist> {
        netlist::setup_circuit(
            self.parallel,
            self.series,
            self.busbar_resistance,
            self.connection_resistance,
            self.internal_resistance,
            self.ocv,
            self.current,
        )
    }
}

impl RunConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: RunConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.solver.workers == 0 {
            return Err(PackError::Config("solver.workers must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.solver.initial_soc) {
            return Err(PackError::Config(format!(
                "solver.initial_soc {} outside [0, 1]",
                self.solver.initial_soc
            )));
        }
        if let Some(secs) = self.solver.step_timeout_secs {
            if !(secs.is_finite() && secs > 0.0) {
                return Err(PackError::Config(format!(
                    "solver.step_timeout_secs must be positive, got {secs}"
                )));
            }
            if !self.solver.backend.supports_step_timeout() {
                return Err(PackError::Config(format!(
                    "solver.step_timeout_secs is not supported by the {} backend",
                    self.solver.backend
                )));
            }
        }
        Ok(())
    }

    /// Default lumped parameters with the configured overrides applied.
    pub fn parameters(&self) -> ParameterValues {
        let mut values = default_parameters();
        values.update(&self.parameters);
        values
    }

    /// Pack netlist. A netlist file path is resolved against `base_dir`.
    pub fn netlist(&self, base_dir: &Path) -> Result<Netlist> {
        match &self.circuit {
            CircuitConfig::File { netlist: path } => {
                let path = base_dir.join(path);
                let text = std::fs::read_to_string(&path).map_err(|e| {
                    PackError::Config(format!("cannot read netlist {}: {e}", path.display()))
                })?;
                netlist::parse(&text)
            }
            CircuitConfig::Pack(topology) => topology.build(),
        }
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.solver.step_timeout_secs.map(Duration::from_secs_f64)
    }

    /// Assemble the problem for `netlist`. A profile path is resolved
    /// against `base_dir`.
    pub fn problem(&self, netlist: Netlist, base_dir: &Path) -> Result<PackProblem> {
        let protocol = self.experiment.protocol(base_dir)?;
        Ok(PackProblem::new(netlist, self.parameters(), protocol)
            .with_htc(self.solver.htc.values())
            .with_output_variables(self.solver.output_variables.iter().cloned())
            .with_initial_soc(self.solver.initial_soc))
    }

    pub fn build_pool(&self) -> Box<dyn WorkerPool> {
        build_pool(self.solver.backend, self.step_timeout())
    }

    pub fn build_solver(&self) -> PackSolver {
        PackSolver::new(self.build_pool(), self.solver.workers)
    }
}
