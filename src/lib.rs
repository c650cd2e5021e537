pub mod buffer;
pub mod cell;
pub mod circuit;
pub mod config;
pub mod error;
pub mod netlist;
pub mod output;
pub mod parameters;
pub mod pool;
pub mod protocol;
pub mod solver;
pub mod sparse;
pub mod stats;
