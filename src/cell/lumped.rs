//! Lumped electro-thermal cell model, the default model behind every worker.
//!
//! State: state of charge, one RC polarisation voltage, lumped temperature.
//!
//! ```text
//! V     = OCV(soc) - v_rc - I * R0(T)
//! dv_rc = (I * R1 - v_rc) / tau              integrated exactly
//! dsoc  = -I / (3600 * Q)
//! m*cp dT = I^2 * R0 + I * v_rc - h * A * (T - T_amb)   implicit in T
//! ```
//!
//! The step is split into sub-steps no longer than
//! `Maximum internal timestep [s]`.

use crate::cell::model::{CellInputs, CellModel, CellModelFactory, MEASURED_OCV, TERMINAL_VOLTAGE};
use crate::error::{PackError, Result};
use crate::parameters::{ParameterValues, LOWER_CUTOFF, UPPER_CUTOFF};

pub const CAPACITY: &str = "Nominal cell capacity [A.h]";
pub const OHMIC_RESISTANCE: &str = "Ohmic resistance [Ohm]";
pub const RESISTANCE_TEMPERATURE_COEFFICIENT: &str =
    "Ohmic resistance temperature coefficient [K-1]";
pub const POLARISATION_RESISTANCE: &str = "Polarisation resistance [Ohm]";
pub const POLARISATION_TIME_CONSTANT: &str = "Polarisation time constant [s]";
pub const HEAT_CAPACITY: &str = "Cell heat capacity [J.K-1]";
pub const COOLING_AREA: &str = "Cell cooling surface area [m2]";
pub const AMBIENT_TEMPERATURE: &str = "Ambient temperature [K]";
pub const INITIAL_TEMPERATURE: &str = "Initial temperature [K]";
pub const MAX_INTERNAL_TIMESTEP: &str = "Maximum internal timestep [s]";

const REFERENCE_TEMPERATURE: f64 = 298.15;
/// How far past empty/full the state of charge may drift before the step is
/// treated as failed.
const SOC_TOLERANCE: f64 = 0.05;

const VARIABLES: [&str; 8] = [
    TERMINAL_VOLTAGE,
    MEASURED_OCV,
    "Battery open circuit voltage [V]",
    "State of charge",
    "Current [A]",
    "Volume-averaged cell temperature [K]",
    "Ohmic resistance [Ohm]",
    "Polarisation overpotential [V]",
];

const EVENTS: [&str; 3] = ["Minimum voltage [V]", "Maximum voltage [V]", "Minimum state of charge"];

/// Parameter set for a generic 5 Ah NMC cylindrical cell.
pub fn default_parameters() -> ParameterValues {
    [
        (CAPACITY, 5.0),
        (LOWER_CUTOFF, 2.5),
        (UPPER_CUTOFF, 4.2),
        (OHMIC_RESISTANCE, 0.02),
        (RESISTANCE_TEMPERATURE_COEFFICIENT, 0.01),
        (POLARISATION_RESISTANCE, 0.01),
        (POLARISATION_TIME_CONSTANT, 30.0),
        (HEAT_CAPACITY, 75.0),
        (COOLING_AREA, 0.0053),
        (AMBIENT_TEMPERATURE, 298.15),
        (INITIAL_TEMPERATURE, 298.15),
        (MAX_INTERNAL_TIMESTEP, 1.0),
    ]
    .into_iter()
    .collect()
}

/// Open-circuit voltage curve over state of charge.
pub fn open_circuit_voltage(soc: f64) -> f64 {
    3.4 + 0.7 * soc - 0.35 * (-12.0 * soc).exp() + 0.08 * (-12.0 * (1.0 - soc)).exp()
}

#[derive(Debug, Clone, PartialEq)]
struct LumpedParameters {
    capacity: f64,
    lower_cutoff: f64,
    upper_cutoff: f64,
    r0: f64,
    r0_alpha: f64,
    r1: f64,
    tau: f64,
    heat_capacity: f64,
    area: f64,
    t_ambient: f64,
    max_dt: f64,
}

impl LumpedParameters {
    fn from_values(p: &ParameterValues) -> Result<Self> {
        let params = Self {
            capacity: p.get(CAPACITY)?,
            lower_cutoff: p.get(LOWER_CUTOFF)?,
            upper_cutoff: p.get(UPPER_CUTOFF)?,
            r0: p.get(OHMIC_RESISTANCE)?,
            r0_alpha: p.get_or(RESISTANCE_TEMPERATURE_COEFFICIENT, 0.0),
            r1: p.get(POLARISATION_RESISTANCE)?,
            tau: p.get(POLARISATION_TIME_CONSTANT)?,
            heat_capacity: p.get(HEAT_CAPACITY)?,
            area: p.get(COOLING_AREA)?,
            t_ambient: p.get(AMBIENT_TEMPERATURE)?,
            max_dt: p.get_or(MAX_INTERNAL_TIMESTEP, 1.0),
        };
        for (name, value) in [
            (CAPACITY, params.capacity),
            (OHMIC_RESISTANCE, params.r0),
            (POLARISATION_TIME_CONSTANT, params.tau),
            (HEAT_CAPACITY, params.heat_capacity),
            (MAX_INTERNAL_TIMESTEP, params.max_dt),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(PackError::Config(format!(
                    "cell model cannot be built: '{name}' must be positive, got {value}"
                )));
            }
        }
        if params.r1 < 0.0 || params.area < 0.0 {
            return Err(PackError::Config(
                "cell model cannot be built: \
                 negative polarisation resistance or cooling area"
                    .into(),
            ));
        }
        Ok(params)
    }
}

#[derive(Debug, Clone)]
pub struct LumpedCell {
    params: LumpedParameters,
    soc: f64,
    v_rc: f64,
    temperature: f64,
    inputs: CellInputs,
}

impl LumpedCell {
    pub fn new(
        parameters: &ParameterValues,
        initial_soc: f64,
        inputs: &CellInputs,
    ) -> Result<Self> {
        let params = LumpedParameters::from_values(parameters)?;
        if !(0.0..=1.0).contains(&initial_soc) {
            return Err(PackError::Config(format!(
                "initial state of charge {initial_soc} outside [0, 1]"
            )));
        }
        let temperature = parameters.get_or(INITIAL_TEMPERATURE, params.t_ambient);
        Ok(Self {
            params,
            soc: initial_soc,
            v_rc: 0.0,
            temperature,
            inputs: *inputs,
        })
    }

    pub fn soc(&self) -> f64 {
        self.soc
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    fn ohmic_resistance(&self) -> f64 {
        let p = &self.params;
        let factor = 1.0 + p.r0_alpha * (REFERENCE_TEMPERATURE - self.temperature);
        p.r0 * factor.max(0.1)
    }

    fn measured_ocv(&self) -> f64 {
        open_circuit_voltage(self.soc) - self.v_rc
    }

    fn terminal_voltage(&self) -> f64 {
        self.measured_ocv() - self.inputs.current * self.ohmic_resistance()
    }

    fn substep(&mut self, current: f64, htc: f64, h: f64) {
        let p = &self.params;
        let r0 = self.ohmic_resistance();

        let decay = (-h / p.tau).exp();
        self.v_rc = self.v_rc * decay + current * p.r1 * (1.0 - decay);
        self.soc -= current * h / (3600.0 * p.capacity);

        let heat = current * current * r0 + current * self.v_rc;
        let ha = htc * p.area;
        self.temperature = (self.temperature + h / p.heat_capacity * (heat + ha * p.t_ambient))
            / (1.0 + h * ha / p.heat_capacity);
    }
}

impl CellModel for LumpedCell {
    fn step(&mut self, inputs: &CellInputs, dt: f64) -> Result<()> {
        if !(inputs.current.is_finite() && inputs.htc.is_finite() && inputs.htc >= 0.0) {
            return Err(PackError::Integration(format!(
                "invalid inputs: current {} A, htc {}",
                inputs.current, inputs.htc
            )));
        }
        self.inputs = *inputs;

        let n = (dt / self.params.max_dt).ceil().max(1.0) as usize;
        let h = dt / n as f64;
        for _ in 0..n {
            self.substep(inputs.current, inputs.htc, h);
        }

        if !(self.soc.is_finite() && self.v_rc.is_finite() && self.temperature.is_finite()) {
            return Err(PackError::Integration("cell state became non-finite".into()));
        }
        if self.soc < -SOC_TOLERANCE || self.soc > 1.0 + SOC_TOLERANCE {
            return Err(PackError::Integration(format!(
                "state of charge {:.4} left the admissible range",
                self.soc
            )));
        }
        if self.temperature <= 0.0 {
            return Err(PackError::Integration(format!(
                "temperature {:.2} K is not physical",
                self.temperature
            )));
        }
        Ok(())
    }

    fn variable_index(&self, name: &str) -> Option<usize> {
        VARIABLES.iter().position(|v| *v == name)
    }

    fn evaluate(&self, index: usize) -> f64 {
        match index {
            0 => self.terminal_voltage(),
            1 => self.measured_ocv(),
            2 => open_circuit_voltage(self.soc),
            3 => self.soc,
            4 => self.inputs.current,
            5 => self.temperature,
            6 => self.ohmic_resistance(),
            7 => self.v_rc,
            _ => f64::NAN,
        }
    }

    fn event_names(&self) -> Vec<String> {
        EVENTS.iter().map(|e| e.to_string()).collect()
    }

    fn events(&self) -> Vec<f64> {
        let v = self.terminal_voltage();
        vec![
            v - self.params.lower_cutoff,
            self.params.upper_cutoff - v,
            self.soc,
        ]
    }
}

/// Factory used when the caller does not supply one.
#[derive(Debug, Clone, Copy, Default)]
pub struct LumpedCellFactory;

impl CellModelFactory for LumpedCellFactory {
    fn build(
        &self,
        parameters: &ParameterValues,
        initial_soc: f64,
        initial_inputs: &CellInputs,
    ) -> Result<Box<dyn CellModel>> {
        Ok(Box::new(LumpedCell::new(parameters, initial_soc, initial_inputs)?))
    }
}
