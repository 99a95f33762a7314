//! Staircase approximation of timed setpoint changes.
//!
//! A setpoint command with a time-to-reach argument is replaced, in place, by
//! `n` immediate setpoint steps spaced one interval apart. The expansion is
//! open-loop: nothing is read back while the staircase runs.

use super::args::format_arguments;
use super::{ArgValue, Sequence, Step};
use crate::instrument::{CapabilityRegistry, InstrumentKind};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Most staircase levels one ramp may expand to.
pub const MAX_RAMP_LEVELS: usize = 10_000;

/// Which argument names the ramped channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChannelSource {
    /// Always the same channel.
    Fixed(&'static str),
    /// Taken from the argument at this index.
    Argument(usize),
}

/// How one setpoint command ramps.
#[derive(Debug, Clone, PartialEq)]
pub struct RampRule {
    /// Instrument kind the rule applies to.
    pub kind: InstrumentKind,
    /// Setpoint command that ramps.
    pub command: &'static str,
    /// Where the channel name comes from.
    pub channel: ChannelSource,
    /// Argument holding the target value.
    pub value_index: usize,
    /// Argument holding the time to reach the target.
    pub duration_index: usize,
    /// Seconds per unit of the duration argument.
    pub duration_unit: f64,
    /// Seconds between staircase steps.
    pub interval: f64,
}

/// Every setpoint command that accepts a time-to-reach argument.
pub static RAMP_RULES: [RampRule; 3] = [
    RampRule {
        kind: InstrumentKind::ClimChamber,
        command: "write_setpoint",
        channel: ChannelSource::Argument(0),
        value_index: 1,
        duration_index: 2,
        duration_unit: 60.0,
        interval: 60.0,
    },
    RampRule {
        kind: InstrumentKind::DcSource,
        command: "set_voltage",
        channel: ChannelSource::Fixed("voltage"),
        value_index: 0,
        duration_index: 1,
        duration_unit: 1.0,
        interval: 0.5,
    },
    RampRule {
        kind: InstrumentKind::DcSource,
        command: "set_current",
        channel: ChannelSource::Fixed("current"),
        value_index: 0,
        duration_index: 1,
        duration_unit: 1.0,
        interval: 0.5,
    },
];

/// Ramp rule for `command` on an instrument of `kind`.
pub fn rule_for(kind: InstrumentKind, command: &str) -> Option<&'static RampRule> {
    RAMP_RULES
        .iter()
        .find(|r| r.kind == kind && r.command == command)
}

/// Chamber channel names come with an optional ` current` suffix.
fn normalize_channel(name: &str) -> String {
    let name = name.trim().to_lowercase();
    name.strip_suffix(" current")
        .map(str::to_string)
        .unwrap_or(name)
}

impl RampRule {
    fn channel_of(&self, args: &[ArgValue]) -> Option<String> {
        match self.channel {
            ChannelSource::Fixed(name) => Some(name.to_string()),
            ChannelSource::Argument(i) => args.get(i).map(|a| normalize_channel(&a.to_string())),
        }
    }
}

/// Channel and value index a setpoint command writes, if it is one.
pub fn setpoint_channel(
    kind: InstrumentKind,
    command: &str,
    args: &[ArgValue],
) -> Option<(String, usize)> {
    let rule = rule_for(kind, command)?;
    Some((rule.channel_of(args)?, rule.value_index))
}

/// One staircase level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampStep {
    /// Setpoint written at this level.
    pub value: f64,
    /// Wait after writing it, in seconds.
    pub relative_time: f64,
}

/// Split a change from `start` to `target` over `duration` seconds.
///
/// Produces `n = max(1, round(duration / interval))` levels, capped at
/// [`MAX_RAMP_LEVELS`]. Every level but the last waits one interval; the last
/// carries the remainder and lands exactly on `target`. A duration no longer
/// than one interval collapses to a single immediate level.
pub fn expand_ramp(start: f64, target: f64, duration: f64, interval: f64) -> Vec<RampStep> {
    if duration <= interval || interval <= 0.0 {
        return vec![RampStep {
            value: target,
            relative_time: duration.max(0.0),
        }];
    }

    let n = ((duration / interval).round() as usize).clamp(1, MAX_RAMP_LEVELS);
    (1..=n)
        .map(|i| {
            let value = if i == n {
                target
            } else {
                start + (target - start) * (i as f64) / (n as f64)
            };
            let relative_time = if i == n {
                duration - (n as f64 - 1.0) * interval
            } else {
                interval
            };
            RampStep {
                value,
                relative_time,
            }
        })
        .collect()
}

/// Start values read from the bound instruments before a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeedTable {
    values: HashMap<(String, String), f64>,
}

impl SeedTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the current value of `channel` on `instrument`.
    pub fn insert(&mut self, instrument: &str, channel: &str, value: f64) {
        self.values
            .insert((instrument.to_lowercase(), channel.to_lowercase()), value);
    }

    /// Recorded value, if any.
    pub fn get(&self, instrument: &str, channel: &str) -> Option<f64> {
        self.values
            .get(&(instrument.to_lowercase(), channel.to_lowercase()))
            .copied()
    }

    /// Number of recorded values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// `(instrument, channel)` pairs whose ramps need a seed from hardware.
///
/// Only ramps with no earlier setpoint for the same channel are listed.
pub fn seed_requests(seq: &Sequence, registry: &CapabilityRegistry) -> Vec<(String, String)> {
    let mut commanded: Vec<(String, String)> = Vec::new();
    let mut requests = Vec::new();

    for step in seq {
        let Some((rule, args)) = ramp_target(step, registry) else {
            continue;
        };
        let Some(channel) = rule.channel_of(&args) else {
            continue;
        };
        let key = (step.instrument_id.clone(), channel);
        if duration_of(rule, &args).is_some()
            && !commanded.contains(&key)
            && !requests.contains(&key)
        {
            requests.push(key.clone());
        }
        if !commanded.contains(&key) {
            commanded.push(key);
        }
    }
    requests
}

/// Staircase levels a ramped setpoint step would need, before capping.
///
/// `None` when the step is not a ramp.
pub fn planned_levels(step: &Step, registry: &CapabilityRegistry) -> Option<f64> {
    let (rule, args) = ramp_target(step, registry)?;
    let duration = duration_of(rule, &args)?;
    Some((duration / rule.interval).round().max(1.0))
}

fn ramp_target(step: &Step, registry: &CapabilityRegistry) -> Option<(&'static RampRule, Vec<ArgValue>)> {
    let kind = registry.entry(&step.instrument_id).ok()?.kind;
    let rule = rule_for(kind, &step.command)?;
    Some((rule, step.arguments()?))
}

/// Ramp duration in seconds, if the duration argument is present and positive.
fn duration_of(rule: &RampRule, args: &[ArgValue]) -> Option<f64> {
    args.get(rule.duration_index)
        .and_then(ArgValue::as_f64)
        .map(|d| d * rule.duration_unit)
        .filter(|d| *d > 0.0)
}

/// Replace every ramped setpoint in `seq` by its staircase.
pub fn expand_ramps(seq: &Sequence, registry: &CapabilityRegistry, seeds: &SeedTable) -> Sequence {
    let mut last: HashMap<(String, String), f64> = HashMap::new();
    let mut steps = Vec::with_capacity(seq.len());

    for step in seq {
        let Some((rule, args)) = ramp_target(step, registry) else {
            steps.push(step.clone());
            continue;
        };
        let (Some(channel), Some(target)) = (
            rule.channel_of(&args),
            args.get(rule.value_index).and_then(ArgValue::as_f64),
        ) else {
            steps.push(step.clone());
            continue;
        };
        let key = (step.instrument_id.clone(), channel);

        match duration_of(rule, &args) {
            None => steps.push(step.clone()),
            Some(duration) => {
                let start = last
                    .get(&key)
                    .copied()
                    .or_else(|| seeds.get(&key.0, &key.1));
                let levels = match start {
                    Some(start) => expand_ramp(start, target, duration, rule.interval),
                    None => {
                        warn!(
                            "No start value for {} {} at {}; setting {} immediately",
                            key.0, key.1, step.origin, target
                        );
                        Vec::new()
                    }
                };
                steps.extend(staircase(step, rule, &args, &levels, duration));
            }
        }
        last.insert(key, target);
    }

    debug!("Ramp expansion: {} -> {} steps", seq.len(), steps.len());
    Sequence::new(seq.name.clone(), steps)
}

/// Build the replacement steps for one ramp.
///
/// An empty or single-level staircase becomes one immediate set that keeps
/// the original wait; otherwise the last level absorbs any wait beyond the
/// ramp duration.
fn staircase(
    step: &Step,
    rule: &RampRule,
    args: &[ArgValue],
    levels: &[RampStep],
    duration: f64,
) -> Vec<Step> {
    let with_value = |value: f64, relative_time: f64| {
        let mut immediate: Vec<ArgValue> = args[..rule.duration_index.min(args.len())].to_vec();
        if let Some(slot) = immediate.get_mut(rule.value_index) {
            *slot = ArgValue::Float(value);
        }
        Step {
            relative_time,
            argument_text: Some(format_arguments(&immediate)),
            ..step.clone()
        }
    };

    if levels.len() <= 1 {
        let target = levels
            .last()
            .map(|l| l.value)
            .or_else(|| args.get(rule.value_index).and_then(ArgValue::as_f64))
            .unwrap_or_default();
        return vec![with_value(target, step.relative_time)];
    }

    let extra = (step.relative_time - duration).max(0.0);
    let last = levels.len() - 1;
    levels
        .iter()
        .enumerate()
        .map(|(i, level)| {
            let wait = if i == last {
                level.relative_time + extra
            } else {
                level.relative_time
            };
            with_value(level.value, wait)
        })
        .collect()
}
