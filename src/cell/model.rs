//! Contract between a worker and the cell models it steps.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::parameters::ParameterValues;

pub const TERMINAL_VOLTAGE: &str = "Terminal voltage [V]";
pub const MEASURED_OCV: &str = "Measured battery open circuit voltage [V]";

/// Boundary inputs applied to one cell for one timestep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellInputs {
    /// Applied current (A), positive on discharge.
    pub current: f64,
    /// Total heat transfer coefficient (W.m-2.K-1).
    pub htc: f64,
}

impl CellInputs {
    pub fn new(current: f64, htc: f64) -> Self {
        Self { current, htc }
    }
}

/// One cell simulation with an opaque internal state.
///
/// Output variables are resolved to indices once at setup so stepping never
/// does name lookups.
pub trait CellModel: Send {
    /// Advance the state by `dt` seconds under `inputs`. May take as long as
    /// the integration needs; failures must be reported, never papered over.
    fn step(&mut self, inputs: &CellInputs, dt: f64) -> Result<()>;

    fn variable_index(&self, name: &str) -> Option<usize>;

    /// Value of a variable at the current state and last applied inputs.
    fn evaluate(&self, index: usize) -> f64;

    /// Names of the event indicators, in the order [`CellModel::events`]
    /// reports them.
    fn event_names(&self) -> Vec<String>;

    /// Current value of every event indicator. An indicator changing sign
    /// between two steps means the event fired.
    fn events(&self) -> Vec<f64>;
}

/// Builds cell models from a parameter set.
pub trait CellModelFactory: Send + Sync {
    fn build(
        &self,
        parameters: &ParameterValues,
        initial_soc: f64,
        initial_inputs: &CellInputs,
    ) -> Result<Box<dyn CellModel>>;
}

impl<F> CellModelFactory for F
where
    F: Fn(&ParameterValues, f64, &CellInputs) -> Result<Box<dyn CellModel>> + Send + Sync,
{
    fn build(
        &self,
        parameters: &ParameterValues,
        initial_soc: f64,
        initial_inputs: &CellInputs,
    ) -> Result<Box<dyn CellModel>> {
        self(parameters, initial_soc, initial_inputs)
    }
}

/// Requested output variables, always led by terminal voltage and measured
/// OCV (the orchestrator derives internal resistance from them). Duplicates
/// are dropped, order otherwise kept.
pub fn output_variable_names<S: AsRef<str>>(requested: &[S]) -> Vec<String> {
    let mut names = vec![TERMINAL_VOLTAGE.to_string(), MEASURED_OCV.to_string()];
    for name in requested {
        let name = name.as_ref();
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_variables_lead_with_voltage_pair() {
        let names =
            output_variable_names(&["State of charge", TERMINAL_VOLTAGE, "State of charge"]);
        assert_eq!(
            names,
            vec![TERMINAL_VOLTAGE, MEASURED_OCV, "State of charge"]
        );
    }

    #[test]
    fn test_output_variables_empty_request() {
        let names = output_variable_names::<&str>(&[]);
        assert_eq!(names.len(), 2);
    }
}
