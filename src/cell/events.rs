//! Zero-crossing detection on cell event indicators.
//!
//! Indicators are laid out `[event][cell]`, flattened row-major. An event
//! fires for a cell when `sign(previous) * sign(current) < 0`; landing on
//! exactly zero does not count as a crossing.

use serde::{Deserialize, Serialize};

/// An event that fired this step and the cells it fired for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiredEvent {
    pub name: String,
    pub cells: Vec<usize>,
}

/// Sliding window of depth one over event-indicator vectors.
#[derive(Debug, Clone)]
pub struct EventDetector {
    n_events: usize,
    n_cells: usize,
    armed: bool,
    previous: Vec<f64>,
    change: Vec<bool>,
}

fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

impl EventDetector {
    pub fn new(n_events: usize, n_cells: usize) -> Self {
        Self {
            n_events,
            n_cells,
            armed: false,
            previous: vec![0.0; n_events * n_cells],
            change: vec![false; n_events * n_cells],
        }
    }

    /// Whether a baseline vector has been recorded.
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Record `current` and report whether any event crossed zero since the
    /// previous call. The first call only records the baseline.
    pub fn check(&mut self, current: &[f64]) -> bool {
        debug_assert_eq!(current.len(), self.n_events * self.n_cells);
        if !self.armed {
            self.previous.copy_from_slice(current);
            self.change.iter_mut().for_each(|c| *c = false);
            self.armed = true;
            return false;
        }

        let mut any = false;
        for ((changed, prev), &cur) in self.change.iter_mut().zip(&mut self.previous).zip(current) {
            *changed = sign(*prev) * sign(cur) < 0.0;
            any |= *changed;
            *prev = cur;
        }
        any
    }

    /// Change matrix from the last call, `[event][cell]` row-major.
    pub fn event_change(&self) -> &[bool] {
        &self.change
    }

    pub fn fired(&self, event: usize, cell: usize) -> bool {
        self.change[event * self.n_cells + cell]
    }

    /// Events that fired on the last call, with the cells they fired for.
    pub fn fired_events(&self, names: &[String]) -> Vec<FiredEvent> {
        (0..self.n_events)
            .filter_map(|e| {
                let row = &self.change[e * self.n_cells..(e + 1) * self.n_cells];
                let cells: Vec<usize> = row
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| **c)
                    .map(|(i, _)| i)
                    .collect();
                (!cells.is_empty()).then(|| FiredEvent {
                    name: names.get(e).cloned().unwrap_or_else(|| format!("event {e}")),
                    cells,
                })
            })
            .collect()
    }
}
