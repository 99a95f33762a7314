//! Command, arity and argument-kind checks against the capability registry.

use super::ramp::{planned_levels, MAX_RAMP_LEVELS};
use super::{ArgValue, Sequence, Step};
use crate::error::{ValidationError, Violation, ViolationKind};
use crate::instrument::{ArgKind, CapabilityRegistry};

/// Check every dispatchable step against the registry.
///
/// Each pass covers the whole sequence and reports all of its violations at
/// once; later passes only run when earlier ones are clean.
pub fn validate_commands(
    seq: &Sequence,
    registry: &CapabilityRegistry,
) -> Result<(), ValidationError> {
    let dispatchable: Vec<&Step> = seq
        .iter()
        .filter(|s| !s.is_sleep() && !s.is_sequence_ref())
        .collect();

    batch(ViolationKind::Command, &dispatchable, |step| {
        let permitted = registry
            .entry(&step.instrument_id)
            .map(|entry| entry.permits(&step.command))
            .unwrap_or(false);
        (!permitted).then(|| format!("{} has no command '{}'", step.instrument_id, step.command))
    })?;

    batch(ViolationKind::Arity, &dispatchable, |step| {
        let arity = registry.arity(&step.instrument_id, &step.command).ok()?;
        let count = step.arguments().map_or(0, |args| args.len());
        (!arity.accepts(count)).then(|| {
            format!(
                "{} {} takes {} arguments, got {}",
                step.instrument_id, step.command, arity, count
            )
        })
    })?;

    batch(ViolationKind::ArgumentKind, &dispatchable, |step| {
        let params = registry.params(&step.instrument_id, &step.command).ok()?;
        let args = step.arguments()?;
        params
            .iter()
            .zip(args.iter())
            .find(|(param, arg)| !kind_matches(param.kind, arg))
            .map(|(param, arg)| {
                format!(
                    "{} {}: '{}' is not a valid {}",
                    step.instrument_id, step.command, arg, param.name
                )
            })
            .or_else(|| oversized_ramp(step, registry))
    })
}

fn oversized_ramp(step: &Step, registry: &CapabilityRegistry) -> Option<String> {
    let levels = planned_levels(step, registry)?;
    (levels > MAX_RAMP_LEVELS as f64).then(|| {
        format!(
            "{} {}: ramp needs {} steps, at most {} allowed",
            step.instrument_id, step.command, levels, MAX_RAMP_LEVELS
        )
    })
}

fn kind_matches(kind: ArgKind, arg: &ArgValue) -> bool {
    match kind {
        ArgKind::Number => arg.as_f64().is_some_and(f64::is_finite),
        ArgKind::Switch => arg.as_switch().is_some(),
        ArgKind::Text | ArgKind::Any => true,
    }
}

fn batch<F>(kind: ViolationKind, steps: &[&Step], check: F) -> Result<(), ValidationError>
where
    F: Fn(&Step) -> Option<String>,
{
    let violations: Vec<Violation> = steps
        .iter()
        .filter_map(|step| {
            check(*step).map(|detail| Violation {
                at: step.origin.clone(),
                detail,
            })
        })
        .collect();

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new(kind, violations))
    }
}
