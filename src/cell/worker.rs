//! Cell-model worker: owns a slice of the pack's cells and steps them.

use std::sync::Arc;

use rayon::prelude::*;

use crate::buffer::CellOutputs;
use crate::cell::events::{EventDetector, FiredEvent};
use crate::cell::lumped::LumpedCellFactory;
use crate::cell::model::{CellInputs, CellModel, CellModelFactory};
use crate::error::{PackError, Result};
use crate::parameters::ParameterValues;

/// How a worker integrates its cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// One cell after another on the calling thread.
    Serial,
    /// All cells mapped across the current rayon pool.
    Mapped,
}

/// Everything a worker needs to build its cells, shared by all workers of a
/// pool.
#[derive(Clone)]
pub struct ModelSpec {
    /// `None` builds the default lumped model.
    pub factory: Option<Arc<dyn CellModelFactory>>,
    pub parameters: Arc<ParameterValues>,
    /// Timestep (s).
    pub dt: f64,
    pub variable_names: Arc<[String]>,
    pub initial_soc: f64,
}

impl std::fmt::Debug for ModelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSpec")
            .field("custom_factory", &self.factory.is_some())
            .field("dt", &self.dt)
            .field("variable_names", &self.variable_names)
            .field("initial_soc", &self.initial_soc)
            .finish()
    }
}

pub struct CellWorker {
    models: Vec<Box<dyn CellModel>>,
    /// Model variable index for each requested output, in request order.
    variable_ids: Vec<usize>,
    event_names: Vec<String>,
    detector: EventDetector,
    outputs: CellOutputs,
    dt: f64,
    mode: StepMode,
}

impl CellWorker {
    /// Build `initial.len()` cells at `initial_soc`, each primed with its
    /// initial inputs.
    pub fn setup(spec: &ModelSpec, initial: &[CellInputs], mode: StepMode) -> Result<Self> {
        if !(spec.dt.is_finite() && spec.dt > 0.0) {
            return Err(PackError::Config(format!("timestep must be positive, got {}", spec.dt)));
        }
        if initial.is_empty() {
            return Err(PackError::Config("worker has no cells".into()));
        }
        let default_factory = LumpedCellFactory;
        let factory: &dyn CellModelFactory = match &spec.factory {
            Some(f) => f.as_ref(),
            None => &default_factory,
        };

        let models = initial
            .iter()
            .map(|inputs| factory.build(&spec.parameters, spec.initial_soc, inputs))
            .collect::<Result<Vec<_>>>()?;

        let first = &models[0];
        let variable_ids = spec
            .variable_names
            .iter()
            .map(|name| {
                first.variable_index(name).ok_or_else(|| {
                    PackError::Config(format!("cell model has no output variable '{name}'"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let event_names = first.event_names();

        let mut worker = Self {
            detector: EventDetector::new(event_names.len(), models.len()),
            outputs: CellOutputs::zeros(variable_ids.len(), models.len()),
            models,
            variable_ids,
            event_names,
            dt: spec.dt,
            mode,
        };
        worker.refresh_outputs();
        Ok(worker)
    }

    pub fn cell_count(&self) -> usize {
        self.models.len()
    }

    /// Advance every cell by one timestep. Returns whether any event
    /// indicator crossed zero since the previous step.
    pub fn step(&mut self, inputs: &[CellInputs]) -> Result<bool> {
        if inputs.len() != self.models.len() {
            return Err(PackError::Config(format!(
                "worker owns {} cells but received {} inputs",
                self.models.len(),
                inputs.len()
            )));
        }
        let dt = self.dt;
        let tag = |cell: usize, e: PackError| match e {
            PackError::Integration(msg) => PackError::Integration(format!("cell {cell}: {msg}")),
            other => other,
        };
        match self.mode {
            StepMode::Serial => {
                for (cell, (model, input)) in self.models.iter_mut().zip(inputs).enumerate() {
                    model.step(input, dt).map_err(|e| tag(cell, e))?;
                }
            }
            StepMode::Mapped => {
                self.models
                    .par_iter_mut()
                    .zip(inputs.par_iter())
                    .enumerate()
                    .try_for_each(|(cell, (model, input))| {
                        model.step(input, dt).map_err(|e| tag(cell, e))
                    })?;
            }
        }

        let events = self.refresh_outputs();
        Ok(self.detector.check(&events))
    }

    /// Latest outputs, `[variable][cell]`.
    pub fn output(&self) -> &CellOutputs {
        &self.outputs
    }

    pub fn event_names(&self) -> &[String] {
        &self.event_names
    }

    /// Events that fired on the last step, with worker-local cell indices.
    pub fn fired_events(&self) -> Vec<FiredEvent> {
        self.detector.fired_events(&self.event_names)
    }

    /// Re-evaluate outputs and return the event indicators, `[event][cell]`.
    fn refresh_outputs(&mut self) -> Vec<f64> {
        let n_cells = self.models.len();
        let mut events = vec![0.0; self.event_names.len() * n_cells];
        for (cell, model) in self.models.iter().enumerate() {
            for (var, &id) in self.variable_ids.iter().enumerate() {
                self.outputs.variable_mut(var)[cell] = model.evaluate(id);
            }
            for (e, value) in model.events().into_iter().enumerate().take(self.event_names.len()) {
                events[e * n_cells + cell] = value;
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::lumped::default_parameters;
    use crate::cell::model::output_variable_names;

    fn spec(variables: &[&str]) -> ModelSpec {
        ModelSpec {
            factory: None,
            parameters: Arc::new(default_parameters()),
            dt: 10.0,
            variable_names: output_variable_names(variables).into(),
            initial_soc: 0.5,
        }
    }

    #[test]
    fn test_setup_and_output_shape() {
        let initial = vec![CellInputs::new(1.0, 10.0); 3];
        let worker =
            CellWorker::setup(&spec(&["State of charge"]), &initial, StepMode::Serial).unwrap();
        assert_eq!(worker.cell_count(), 3);
        assert_eq!(worker.output().n_vars(), 3);
        assert_eq!(worker.output().n_cells(), 3);
        assert!((worker.output().get(2, 1) - 0.5).abs() < 1e-15);
    }

    #[test]
    fn test_unknown_variable_fails_setup() {
        let initial = vec![CellInputs::new(1.0, 10.0)];
        let err = CellWorker::setup(&spec(&["Lithium plating [mol]"]), &initial, StepMode::Serial)
            .err()
            .unwrap();
        assert!(format!("{err}").contains("Lithium plating"));
    }

    #[test]
    fn test_serial_and_mapped_agree() {
        let initial = vec![CellInputs::new(0.0, 10.0); 4];
        let inputs: Vec<CellInputs> = (0..4).map(|i| CellInputs::new(i as f64, 10.0)).collect();
        let mut serial = CellWorker::setup(&spec(&[]), &initial, StepMode::Serial).unwrap();
        let mut mapped = CellWorker::setup(&spec(&[]), &initial, StepMode::Mapped).unwrap();
        for _ in 0..3 {
            serial.step(&inputs).unwrap();
            mapped.step(&inputs).unwrap();
        }
        assert_eq!(serial.output(), mapped.output());
    }

    #[test]
    fn test_step_input_count_checked() {
        let initial = vec![CellInputs::new(0.0, 10.0); 2];
        let mut worker = CellWorker::setup(&spec(&[]), &initial, StepMode::Serial).unwrap();
        assert!(worker.step(&[CellInputs::new(1.0, 10.0)]).is_err());
    }

    #[test]
    fn test_integration_failure_propagates_with_cell() {
        let initial = vec![CellInputs::new(0.0, 10.0); 2];
        let mut worker = CellWorker::setup(&spec(&[]), &initial, StepMode::Serial).unwrap();
        let inputs = [CellInputs::new(1.0, 10.0), CellInputs::new(f64::NAN, 10.0)];
        let err = worker.step(&inputs).unwrap_err();
        assert!(format!("{err}").contains("cell 1"), "{err}");
    }

    #[test]
    fn test_event_fires_when_voltage_crosses_cutoff() {
        let params = default_parameters().with(crate::parameters::LOWER_CUTOFF, 3.6);
        let spec = ModelSpec {
            parameters: Arc::new(params),
            ..spec(&[])
        };
        let initial = vec![CellInputs::new(0.0, 10.0); 2];
        let mut worker = CellWorker::setup(&spec, &initial, StepMode::Serial).unwrap();
        // First step arms the detector.
        assert!(!worker.step(&initial).unwrap());
        // 40 A on cell 1 drops its voltage well below 3.6 V.
        let fired = worker
            .step(&[CellInputs::new(0.0, 10.0), CellInputs::new(40.0, 10.0)])
            .unwrap();
        assert!(fired);
        let events = worker.fired_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "Minimum voltage [V]");
        assert_eq!(events[0].cells, vec![1]);
    }
}
