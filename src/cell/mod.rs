//! Per-cell simulation: the model contract, the default lumped model, event
//! detection and the worker that steps a group of cells.

pub mod events;
pub mod lumped;
pub mod model;
pub mod worker;

pub use events::{EventDetector, FiredEvent};
pub use lumped::{default_parameters, LumpedCell, LumpedCellFactory};
pub use model::{output_variable_names, CellInputs, CellModel, CellModelFactory};
pub use worker::{CellWorker, ModelSpec, StepMode};
