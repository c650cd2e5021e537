//! Experiment descriptions and the per-timestep current protocol.
//!
//! # Supported step syntax
//!
//! ```text
//! Discharge at 5 A for 30 minutes
//! Charge at 500 mA for 1 hour
//! Rest for 10 s
//! ```
//!
//! Only constant-current control is supported: the pack is driven by the
//! netlist current source, so voltage or power holds are rejected.
//!
//! A measured drive cycle can be used instead of step strings: a
//! `time,current` CSV is resampled onto the timestep grid with
//! [`Protocol::from_current_profile`].

use nom::branch::alt;
use nom::bytes::complete::tag_no_case;
use nom::character::complete::{space0, space1};
use nom::combinator::{map, value};
use nom::number::complete::double;
use nom::IResult;
use nom::Parser;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{PackError, Result};

/// Longest protocol accepted. Result buffers hold a row per timestep for
/// every cell and output variable.
pub const MAX_PROTOCOL_STEPS: usize = 10_000_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExperimentStep {
    /// Constant current out of the pack (A).
    Discharge { current: f64, duration: f64 },
    /// Constant current into the pack (A).
    Charge { current: f64, duration: f64 },
    Rest { duration: f64 },
}

impl ExperimentStep {
    /// Signed pack current: discharge positive.
    pub fn current(&self) -> f64 {
        match *self {
            ExperimentStep::Discharge { current, .. } => current,
            ExperimentStep::Charge { current, .. } => -current,
            ExperimentStep::Rest { .. } => 0.0,
        }
    }

    pub fn duration(&self) -> f64 {
        match *self {
            ExperimentStep::Discharge { duration, .. }
            | ExperimentStep::Charge { duration, .. }
            | ExperimentStep::Rest { duration } => duration,
        }
    }
}

/// Experiment as written in the run configuration: either step strings or
/// a current profile file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    /// Timestep length (s).
    pub period: f64,
    #[serde(default)]
    pub steps: Vec<String>,
    /// `time,current` CSV, relative to the config file.
    #[serde(default)]
    pub profile: Option<PathBuf>,
}

impl ExperimentConfig {
    /// Expand into a protocol. A profile path is resolved against
    /// `base_dir`.
    pub fn protocol(&self, base_dir: &Path) -> Result<Protocol> {
        match &self.profile {
            Some(_) if !self.steps.is_empty() => Err(PackError::Config(
                "experiment takes either steps or a profile, not both".into(),
            )),
            Some(path) => {
                let path = base_dir.join(path);
                let file = std::fs::File::open(&path).map_err(|e| {
                    let path = path.display();
                    PackError::Config(format!("cannot read current profile {path}: {e}"))
                })?;
                let (times, currents) = read_current_profile(file)?;
                Protocol::from_current_profile(&times, &currents, self.period)
            }
            None => generate_protocol(&Experiment::from_config(self)?),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Experiment {
    pub period: f64,
    pub steps: Vec<ExperimentStep>,
}

impl Experiment {
    pub fn new(period: f64, steps: Vec<ExperimentStep>) -> Result<Self> {
        if !(period.is_finite() && period > 0.0) {
            return Err(PackError::Config(format!(
                "experiment period must be positive, got {period}"
            )));
        }
        Ok(Self { period, steps })
    }

    /// Parse every step string of a configured experiment.
    pub fn from_config(config: &ExperimentConfig) -> Result<Self> {
        let steps = config
            .steps
            .iter()
            .map(|s| parse_step(s))
            .collect::<Result<Vec<_>>>()?;
        Self::new(config.period, steps)
    }
}

/// Fixed current schedule, one setpoint per timestep.
#[derive(Debug, Clone, PartialEq)]
pub struct Protocol {
    pub period: f64,
    pub currents: Vec<f64>,
}

impl Protocol {
    pub fn len(&self) -> usize {
        self.currents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.currents.is_empty()
    }

    /// Constant current for `steps` timesteps.
    pub fn constant(current: f64, steps: usize, period: f64) -> Self {
        Self {
            period,
            currents: vec![current; steps],
        }
    }

    /// Resample a measured current profile every `period` seconds.
    ///
    /// Setpoint `k` is the linearly interpolated current at
    /// `times[0] + k * period`. Only whole periods inside the profile are
    /// kept, so nothing is extrapolated.
    pub fn from_current_profile(times: &[f64], currents: &[f64], period: f64) -> Result<Self> {
        if !(period.is_finite() && period > 0.0) {
            return Err(PackError::Config(format!(
                "experiment period must be positive, got {period}"
            )));
        }
        if times.len() != currents.len() {
            return Err(PackError::Protocol(format!(
                "current profile has {} times but {} currents",
                times.len(),
                currents.len()
            )));
        }
        if times.len() < 2 {
            return Err(PackError::Protocol(
                "current profile needs at least two points".into(),
            ));
        }
        if times.iter().chain(currents).any(|v| !v.is_finite()) {
            return Err(PackError::Protocol("current profile has non-finite values".into()));
        }
        if let Some(i) = times.windows(2).position(|w| w[1] <= w[0]) {
            return Err(PackError::Protocol(format!(
                "current profile times must increase strictly (row {})",
                i + 2
            )));
        }

        let start = times[0];
        let span = times[times.len() - 1] - start;
        let n = (span / period + 1e-9).floor();
        if n < 1.0 {
            return Err(PackError::Protocol(format!(
                "current profile spans {span} s, shorter than one {period} s period"
            )));
        }
        if n > MAX_PROTOCOL_STEPS as f64 {
            return Err(PackError::Protocol(format!(
                "current profile needs more than {MAX_PROTOCOL_STEPS} timesteps"
            )));
        }

        let mut sampled = Vec::with_capacity(n as usize);
        let mut seg = 0;
        for k in 0..n as usize {
            let t = start + k as f64 * period;
            while seg + 2 < times.len() && times[seg + 1] <= t {
                seg += 1;
            }
            let w = ((t - times[seg]) / (times[seg + 1] - times[seg])).clamp(0.0, 1.0);
            sampled.push(currents[seg] + w * (currents[seg + 1] - currents[seg]));
        }
        Ok(Self {
            period,
            currents: sampled,
        })
    }
}

/// Read a `time,current` CSV (header row required) into its two columns.
pub fn read_current_profile<R: Read>(reader: R) -> Result<(Vec<f64>, Vec<f64>)> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut times = Vec::new();
    let mut currents = Vec::new();
    for (row, record) in reader.deserialize::<(f64, f64)>().enumerate() {
        let (t, i) = record
            .map_err(|e| PackError::Protocol(format!("current profile row {}: {e}", row + 1)))?;
        times.push(t);
        currents.push(i);
    }
    Ok((times, currents))
}

/// Setpoints contributed by one step: `round(duration / period)`.
fn step_count(step: &ExperimentStep, period: f64) -> Result<usize> {
    let n = (step.duration() / period).round();
    if !n.is_finite() || n < 0.0 {
        return Err(PackError::Protocol(format!("invalid step duration in {step:?}")));
    }
    if n > MAX_PROTOCOL_STEPS as f64 {
        return Err(PackError::Protocol(format!(
            "{step:?} needs more than {MAX_PROTOCOL_STEPS} timesteps"
        )));
    }
    Ok(n as usize)
}

/// Expand an experiment into one current setpoint per timestep.
pub fn generate_protocol(experiment: &Experiment) -> Result<Protocol> {
    let counts = experiment
        .steps
        .iter()
        .map(|step| step_count(step, experiment.period))
        .collect::<Result<Vec<_>>>()?;
    let total = counts
        .iter()
        .try_fold(0usize, |acc, &n| acc.checked_add(n).filter(|&t| t <= MAX_PROTOCOL_STEPS))
        .ok_or_else(|| {
            PackError::Protocol(format!(
                "experiment needs more than {MAX_PROTOCOL_STEPS} timesteps"
            ))
        })?;
    if total == 0 {
        return Err(PackError::Config("experiment produces no timesteps".into()));
    }

    let mut currents = Vec::with_capacity(total);
    for (step, &n) in experiment.steps.iter().zip(&counts) {
        currents.extend(std::iter::repeat(step.current()).take(n));
    }
    Ok(Protocol {
        period: experiment.period,
        currents,
    })
}

/// Parse one experiment step string.
pub fn parse_step(input: &str) -> Result<ExperimentStep> {
    let text = input.trim();
    let result = alt((current_step, rest_step)).parse(text);
    match result {
        Ok((rest, step)) if rest.trim().is_empty() => {
            if step.duration() <= 0.0 || step.current().is_nan() {
                return Err(PackError::Protocol(format!(
                    "step must have a positive duration: '{text}'"
                )));
            }
            Ok(step)
        }
        Ok((rest, _)) => Err(PackError::Protocol(format!(
            "unexpected trailing input '{}' in step '{text}'",
            rest.trim()
        ))),
        Err(_) => {
            let lower = text.to_ascii_lowercase();
            if lower.starts_with("hold") || lower.contains(" v ") || lower.contains(" w ") {
                Err(PackError::Protocol(format!(
                    "only constant-current steps are supported: '{text}'"
                )))
            } else {
                Err(PackError::Protocol(format!("cannot parse experiment step '{text}'")))
            }
        }
    }
}

fn current_step(input: &str) -> IResult<&str, ExperimentStep> {
    let (rest, (is_charge, _, _, _, current, _, _)) = (
        alt((
            value(false, tag_no_case("discharge")),
            value(true, tag_no_case("charge")),
        )),
        space1,
        tag_no_case("at"),
        space1,
        current_value,
        space1,
        tag_no_case("for"),
    )
        .parse(input)?;
    let (rest, (_, duration)) = (space1, duration_value).parse(rest)?;
    let step = if is_charge {
        ExperimentStep::Charge { current, duration }
    } else {
        ExperimentStep::Discharge { current, duration }
    };
    Ok((rest, step))
}

fn rest_step(input: &str) -> IResult<&str, ExperimentStep> {
    let (rest, (_, _, _, _, duration)) = (
        tag_no_case("rest"),
        space1,
        tag_no_case("for"),
        space1,
        duration_value,
    )
        .parse(input)?;
    Ok((rest, ExperimentStep::Rest { duration }))
}

/// `5 A`, `500 mA`, `2.5A`
fn current_value(input: &str) -> IResult<&str, f64> {
    let (rest, (num, _, scale)) = (
        double,
        space0,
        alt((value(1e-3, tag_no_case("mA")), value(1.0, tag_no_case("A")))),
    )
        .parse(input)?;
    Ok((rest, num * scale))
}

/// `30 minutes`, `1 hour`, `10 s`; result in seconds.
fn duration_value(input: &str) -> IResult<&str, f64> {
    let (rest, (num, _, scale)) = (double, space0, time_unit).parse(input)?;
    Ok((rest, num * scale))
}

fn time_unit(input: &str) -> IResult<&str, f64> {
    // Longer spellings first.
    alt((
        map(alt((tag_no_case("seconds"), tag_no_case("second"))), |_: &str| 1.0),
        map(alt((tag_no_case("minutes"), tag_no_case("minute"))), |_: &str| 60.0),
        map(alt((tag_no_case("hours"), tag_no_case("hour"))), |_: &str| 3600.0),
        map(alt((tag_no_case("secs"), tag_no_case("sec"))), |_: &str| 1.0),
        map(alt((tag_no_case("mins"), tag_no_case("min"))), |_: &str| 60.0),
        map(tag_no_case("s"), |_: &str| 1.0),
        map(tag_no_case("h"), |_: &str| 3600.0),
    ))
    .parse(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_discharge() {
        let step = parse_step("Discharge at 5 A for 30 minutes").unwrap();
        assert_eq!(
            step,
            ExperimentStep::Discharge {
                current: 5.0,
                duration: 1800.0
            }
        );
        assert_eq!(step.current(), 5.0);
    }

    #[test]
    fn test_parse_charge_milliamps() {
        let step = parse_step("charge at 500 mA for 1 hour").unwrap();
        assert!((step.current() + 0.5).abs() < 1e-12);
        assert_eq!(step.duration(), 3600.0);
    }

    #[test]
    fn test_parse_rest_short_units() {
        assert_eq!(
            parse_step("Rest for 10 s").unwrap(),
            ExperimentStep::Rest { duration: 10.0 }
        );
        assert_eq!(parse_step("Rest for 2 min").unwrap().duration(), 120.0);
        assert_eq!(parse_step("Rest for 1h").unwrap().duration(), 3600.0);
    }

    #[test]
    fn test_voltage_hold_rejected() {
        let err = parse_step("Hold at 4.2 V for 10 minutes").unwrap_err();
        assert!(format!("{err}").contains("constant-current"), "{err}");
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(parse_step("Discharge quickly").is_err());
        assert!(parse_step("Rest for 10 s please").is_err());
        assert!(parse_step("Rest for 0 s").is_err());
    }

    #[test]
    fn test_generate_protocol() {
        let experiment = Experiment::new(
            10.0,
            vec![
                ExperimentStep::Discharge {
                    current: 2.0,
                    duration: 30.0,
                },
                ExperimentStep::Rest { duration: 20.0 },
                ExperimentStep::Charge {
                    current: 1.0,
                    duration: 10.0,
                },
            ],
        )
        .unwrap();
        let protocol = generate_protocol(&experiment).unwrap();
        assert_eq!(protocol.currents, vec![2.0, 2.0, 2.0, 0.0, 0.0, -1.0]);
        assert_eq!(protocol.period, 10.0);
    }

    #[test]
    fn test_empty_protocol_is_config_error() {
        let experiment = Experiment::new(10.0, vec![]).unwrap();
        assert!(matches!(generate_protocol(&experiment), Err(PackError::Config(_))));
    }

    #[test]
    fn test_non_positive_period_rejected() {
        assert!(Experiment::new(0.0, vec![]).is_err());
    }

    #[test]
    fn test_huge_duration_is_protocol_error() {
        let step = parse_step("Rest for 1e300 s").unwrap();
        let experiment = Experiment::new(1.0, vec![step]).unwrap();
        assert!(matches!(generate_protocol(&experiment), Err(PackError::Protocol(_))));
    }

    #[test]
    fn test_total_length_is_bounded() {
        // Each step alone fits, together they do not.
        let step = ExperimentStep::Rest {
            duration: (MAX_PROTOCOL_STEPS / 2 + 1) as f64,
        };
        let experiment = Experiment::new(1.0, vec![step, step]).unwrap();
        let err = generate_protocol(&experiment).unwrap_err();
        assert!(format!("{err}").contains("timesteps"), "{err}");
    }

    #[test]
    fn test_profile_interpolated_onto_period_grid() {
        let protocol =
            Protocol::from_current_profile(&[0.0, 10.0, 20.0], &[0.0, 10.0, -10.0], 5.0).unwrap();
        assert_eq!(protocol.period, 5.0);
        assert_eq!(protocol.currents, vec![0.0, 5.0, 10.0, 0.0]);

        // Offset start and uneven sample spacing.
        let times = [100.0, 101.0, 104.0, 107.5];
        let currents = [2.0, 4.0, 4.0, 1.0];
        let protocol = Protocol::from_current_profile(&times, &currents, 2.5).unwrap();
        let expected = [2.0, 4.0, 4.0 - 3.0 / 3.5];
        assert_eq!(protocol.len(), expected.len());
        for (got, want) in protocol.currents.iter().zip(expected) {
            assert!((got - want).abs() < 1e-12, "{got} != {want}");
        }

        // The partial last period is dropped.
        let protocol = Protocol::from_current_profile(&times, &currents, 2.0).unwrap();
        assert_eq!(protocol.len(), 3);
    }

    #[test]
    fn test_profile_rejects_bad_input() {
        assert!(Protocol::from_current_profile(&[0.0], &[1.0], 1.0).is_err());
        assert!(Protocol::from_current_profile(&[0.0, 1.0], &[1.0], 1.0).is_err());
        assert!(Protocol::from_current_profile(&[0.0, 2.0, 1.0], &[1.0; 3], 0.5).is_err());
        assert!(Protocol::from_current_profile(&[0.0, 0.0, 1.0], &[1.0; 3], 0.5).is_err());
        assert!(Protocol::from_current_profile(&[0.0, 1.0], &[1.0, f64::NAN], 0.5).is_err());
        // Shorter than one period.
        assert!(Protocol::from_current_profile(&[0.0, 1.0], &[1.0, 1.0], 5.0).is_err());
        assert!(matches!(
            Protocol::from_current_profile(&[0.0, 1.0], &[1.0, 1.0], 0.0),
            Err(PackError::Config(_))
        ));
    }

    #[test]
    fn test_read_current_profile_csv() {
        let text = "time [s], current [A]\n0, 1.5\n10,2.5\n20,-1\n";
        let (times, currents) = read_current_profile(text.as_bytes()).unwrap();
        assert_eq!(times, vec![0.0, 10.0, 20.0]);
        assert_eq!(currents, vec![1.5, 2.5, -1.0]);

        let err = read_current_profile("t,i\n0,1\n5,abc\n".as_bytes()).unwrap_err();
        assert!(format!("{err}").contains("row 2"), "{err}");
    }

    #[test]
    fn test_experiment_config_steps_or_profile() {
        let both = ExperimentConfig {
            period: 1.0,
            steps: vec!["Rest for 5 s".into()],
            profile: Some("cycle.csv".into()),
        };
        assert!(matches!(both.protocol(Path::new(".")), Err(PackError::Config(_))));

        let steps = ExperimentConfig {
            profile: None,
            ..both
        };
        assert_eq!(steps.protocol(Path::new(".")).unwrap().len(), 5);

        let missing = ExperimentConfig {
            period: 1.0,
            steps: Vec::new(),
            profile: Some("no-such-cycle.csv".into()),
        };
        assert!(missing.protocol(Path::new("/nonexistent")).is_err());
    }
}
