//! Named cell/pack parameter set.
//!
//! Keys follow the `Name [unit]` convention, e.g. `Lower voltage cut-off [V]`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{PackError, Result};

pub const LOWER_CUTOFF: &str = "Lower voltage cut-off [V]";
pub const UPPER_CUTOFF: &str = "Upper voltage cut-off [V]";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterValues {
    values: BTreeMap<String, f64>,
}

impl ParameterValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a parameter that must be present.
    pub fn get(&self, name: &str) -> Result<f64> {
        self.values
            .get(name)
            .copied()
            .ok_or_else(|| PackError::Config(format!("missing parameter '{name}'")))
    }

    pub fn get_or(&self, name: &str, default: f64) -> f64 {
        self.values.get(name).copied().unwrap_or(default)
    }

    pub fn set(&mut self, name: impl Into<String>, value: f64) -> &mut Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.set(name, value);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Overlay `other` on top of `self`.
    pub fn update(&mut self, other: &ParameterValues) {
        for (k, v) in &other.values {
            self.values.insert(k.clone(), *v);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Pack voltage cut-offs as (lower, upper).
    pub fn voltage_cutoffs(&self) -> Result<(f64, f64)> {
        let lower = self.get(LOWER_CUTOFF)?;
        let upper = self.get(UPPER_CUTOFF)?;
        if !(lower < upper) {
            return Err(PackError::Config(format!(
                "lower voltage cut-off {lower} V is not below upper cut-off {upper} V"
            )));
        }
        Ok((lower, upper))
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for ParameterValues {
    fn from_iter<T: IntoIterator<Item = (K, f64)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}
