//! Performance statistics for `--stats` output.

use std::time::Duration;

/// Phase timings and counters collected by every pack solve.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SolveStats {
    /// Netlist checks, initial circuit solve and worker construction.
    pub setup: Duration,
    /// Whole step loop.
    pub stepping: Duration,
    // Step-loop sub-phases
    pub worker_step: Duration,
    pub collect: Duration,
    pub circuit_solve: Duration,
    pub teardown: Duration,
    pub steps_completed: usize,
    /// Steps on which at least one cell event fired.
    pub events_triggered: usize,
    pub workers: usize,
    pub cells: usize,
}

impl SolveStats {
    pub fn time_per_step(&self) -> Duration {
        if self.steps_completed == 0 {
            Duration::ZERO
        } else {
            self.stepping / self.steps_completed as u32
        }
    }

    /// Print the stats table to stderr.
    pub fn display(&self) {
        eprintln!();
        eprintln!("=== packsim Performance Stats ===");
        eprintln!("  Cells / workers:        {} / {}", self.cells, self.workers);
        eprintln!("  Setup:                  {:>8.3}s", self.setup.as_secs_f64());
        eprintln!("  Stepping:               {:>8.3}s", self.stepping.as_secs_f64());
        eprintln!("    Worker step:          {:>8.3}s", self.worker_step.as_secs_f64());
        eprintln!("    Collect outputs:      {:>8.3}s", self.collect.as_secs_f64());
        eprintln!("    Circuit solve:        {:>8.3}s", self.circuit_solve.as_secs_f64());
        eprintln!("  Teardown:               {:>8.3}s", self.teardown.as_secs_f64());
        eprintln!("  Steps:                  {}", self.steps_completed);
        if self.events_triggered > 0 {
            eprintln!("  Steps with events:      {}", self.events_triggered);
        }
        eprintln!("  ─────────────────────────────────");
        eprintln!("  Time per step:          {:>8.6}s", self.time_per_step().as_secs_f64());
    }
}
