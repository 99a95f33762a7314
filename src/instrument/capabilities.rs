//! Declarative command tables for every instrument kind.
//!
//! Each command lists its parameters; the permitted argument range
//! `(min_args, max_args)` is derived from how many of them are required. The
//! charger is the exception: it runs arbitrary remote scripts, and only the
//! well-known ones carry a fixed argument count.

use super::InstrumentKind;
use crate::error::{BenchError, BenchResult};
use std::collections::BTreeMap;
use std::fmt;

/// What a parameter accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Integer or float.
    Number,
    /// Boolean, `0`/`1`, or `on`/`off`.
    Switch,
    /// Any token, typically a name or path.
    Text,
    /// Not checked.
    Any,
}

/// One declared parameter of a command.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    /// Parameter name.
    pub name: &'static str,
    /// Accepted kind.
    pub kind: ArgKind,
    /// Whether the call must supply it.
    pub required: bool,
}

const fn req(name: &'static str, kind: ArgKind) -> Param {
    Param {
        name,
        kind,
        required: true,
    }
}

const fn opt(name: &'static str, kind: ArgKind) -> Param {
    Param {
        name,
        kind,
        required: false,
    }
}

/// Inclusive argument-count range; `max == None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    /// Fewest arguments accepted.
    pub min: usize,
    /// Most arguments accepted.
    pub max: Option<usize>,
}

impl Arity {
    /// Any number of arguments.
    pub const UNCONSTRAINED: Arity = Arity { min: 0, max: None };

    /// True if `count` arguments fit.
    pub fn accepts(&self, count: usize) -> bool {
        count >= self.min && self.max.map_or(true, |max| count <= max)
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) if max == self.min => write!(f, "{}", max),
            Some(max) => write!(f, "{}..={}", self.min, max),
            None => write!(f, "{}..", self.min),
        }
    }
}

/// A permitted command and its parameters, in call order.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    /// Command name.
    pub name: &'static str,
    /// Parameters in call order.
    pub params: Vec<Param>,
}

impl CommandSpec {
    fn new(name: &'static str, params: Vec<Param>) -> Self {
        Self { name, params }
    }

    /// Required count up to total count.
    pub fn arity(&self) -> Arity {
        Arity {
            min: self.params.iter().filter(|p| p.required).count(),
            max: Some(self.params.len()),
        }
    }
}

/// Everything one instrument kind permits.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityEntry {
    /// Accepted kind.
    pub kind: InstrumentKind,
    /// Declared commands.
    pub commands: Vec<CommandSpec>,
    /// Commands outside `commands` are accepted with unconstrained arity.
    pub open: bool,
}

impl CapabilityEntry {
    /// The declared table for an instrument kind.
    pub fn for_kind(kind: InstrumentKind) -> Self {
        use ArgKind::*;

        let (commands, open) = match kind {
            InstrumentKind::DcSource => (
                vec![
                    CommandSpec::new("set_output", vec![req("state", Switch)]),
                    CommandSpec::new("set_function", vec![opt("mode", Text)]),
                    CommandSpec::new(
                        "set_current",
                        vec![req("value", Number), opt("time_to_set", Number)],
                    ),
                    CommandSpec::new(
                        "set_voltage",
                        vec![req("value", Number), opt("time_to_set", Number)],
                    ),
                    CommandSpec::new(
                        "set_v_limit",
                        vec![req("v_neg", Number), req("v_pos", Number)],
                    ),
                    CommandSpec::new(
                        "set_c_limit",
                        vec![req("i_neg", Number), req("i_pos", Number)],
                    ),
                ],
                false,
            ),
            InstrumentKind::AcSource => (
                vec![
                    CommandSpec::new("set_output", vec![req("state", Switch)]),
                    CommandSpec::new("set_frequency", vec![req("value", Number)]),
                    CommandSpec::new("set_voltage", vec![req("value", Number), opt("mode", Text)]),
                    CommandSpec::new("europe_grid", vec![]),
                    CommandSpec::new("usa_grid", vec![]),
                ],
                false,
            ),
            InstrumentKind::PowerSupply => (
                vec![
                    CommandSpec::new("set_output", vec![req("state", Switch)]),
                    CommandSpec::new("set_current", vec![opt("value", Number)]),
                    CommandSpec::new("set_voltage", vec![opt("value", Number)]),
                ],
                false,
            ),
            InstrumentKind::ClimChamber => (
                vec![
                    CommandSpec::new("start_temp", vec![]),
                    CommandSpec::new("stop_temp", vec![]),
                    CommandSpec::new("start_hum", vec![]),
                    CommandSpec::new("stop_hum", vec![]),
                    CommandSpec::new("start_temp_hum", vec![]),
                    CommandSpec::new("stop_temp_hum", vec![]),
                    CommandSpec::new(
                        "write_setpoint",
                        vec![
                            req("channel", Text),
                            req("value", Number),
                            opt("time_to_set", Number),
                        ],
                    ),
                ],
                false,
            ),
            InstrumentKind::Oscilloscope => (
                vec![CommandSpec::new("save_screen", vec![opt("filepath", Text)])],
                false,
            ),
            InstrumentKind::Charger => (
                vec![
                    CommandSpec::new(
                        "set_voltage_and_power.sh",
                        vec![req("voltage", Number), req("power", Number)],
                    ),
                    CommandSpec::new("start_charge_session.sh", vec![]),
                    CommandSpec::new("stop_charge_session.sh", vec![]),
                    CommandSpec::new("set_power.sh", vec![req("power", Number)]),
                    CommandSpec::new("set_reactive.sh", vec![req("reactive", Number)]),
                ],
                true,
            ),
        };

        Self {
            kind,
            commands,
            open,
        }
    }

    /// Declared command called `name`.
    pub fn command(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.iter().find(|c| c.name == name)
    }

    /// True if `name` may be sent to this instrument.
    pub fn permits(&self, name: &str) -> bool {
        self.open || self.command(name).is_some()
    }
}

/// Instrument id → capability entry.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    entries: BTreeMap<String, CapabilityEntry>,
}

impl CapabilityRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every known kind under its conventional id.
    pub fn standard() -> Self {
        InstrumentKind::ALL
            .iter()
            .fold(Self::new(), |registry, kind| {
                registry.with_entry(kind.default_id(), CapabilityEntry::for_kind(*kind))
            })
    }

    /// Builder form of [`CapabilityRegistry::register`].
    pub fn with_entry(mut self, id: &str, entry: CapabilityEntry) -> Self {
        self.register(id, entry);
        self
    }

    /// Add or replace the entry for `id`.
    pub fn register(&mut self, id: &str, entry: CapabilityEntry) {
        self.entries.insert(id.to_lowercase(), entry);
    }

    /// True if `id` is present.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(&id.to_lowercase())
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Entry for `id`, or an unknown-instrument error.
    pub fn entry(&self, id: &str) -> BenchResult<&CapabilityEntry> {
        self.entries
            .get(&id.to_lowercase())
            .ok_or_else(|| BenchError::UnknownInstrument(id.to_string()))
    }

    /// Permitted command names in declaration order.
    pub fn commands(&self, id: &str) -> BenchResult<Vec<&'static str>> {
        Ok(self.entry(id)?.commands.iter().map(|c| c.name).collect())
    }

    /// Declared parameters; empty for undeclared commands on open entries.
    pub fn params(&self, id: &str, command: &str) -> BenchResult<&[Param]> {
        let entry = self.entry(id)?;
        match entry.command(command) {
            Some(spec) => Ok(&spec.params),
            None if entry.open => Ok(&[]),
            None => Err(BenchError::UnknownCommand {
                instrument: id.to_string(),
                command: command.to_string(),
            }),
        }
    }

    /// Accepted argument counts for `command` on `id`.
    pub fn arity(&self, id: &str, command: &str) -> BenchResult<Arity> {
        let entry = self.entry(id)?;
        match entry.command(command) {
            Some(spec) => Ok(spec.arity()),
            None if entry.open => Ok(Arity::UNCONSTRAINED),
            None => Err(BenchError::UnknownCommand {
                instrument: id.to_string(),
                command: command.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arity_is_derived_from_required_params() {
        let registry = CapabilityRegistry::standard();
        assert_eq!(
            registry.arity("dc_source", "set_voltage").unwrap(),
            Arity {
                min: 1,
                max: Some(2)
            }
        );
        assert_eq!(
            registry.arity("clim_chamber", "write_setpoint").unwrap(),
            Arity {
                min: 2,
                max: Some(3)
            }
        );
        assert_eq!(
            registry.arity("ac_source", "europe_grid").unwrap(),
            Arity {
                min: 0,
                max: Some(0)
            }
        );
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let registry = CapabilityRegistry::standard();
        assert!(registry.contains("Clim_Chamber"));
        assert_eq!(registry.commands("OSCILLOSCOPE").unwrap(), vec!["save_screen"]);
    }

    #[test]
    fn test_unknown_instrument_and_command() {
        let registry = CapabilityRegistry::standard();
        assert!(matches!(
            registry.arity("laser", "fire"),
            Err(BenchError::UnknownInstrument(id)) if id == "laser"
        ));
        assert!(matches!(
            registry.arity("powersupply", "europe_grid"),
            Err(BenchError::UnknownCommand { .. })
        ));
    }

    #[test]
    fn test_charger_scripts() {
        let registry = CapabilityRegistry::standard();
        assert_eq!(
            registry.arity("armxl", "set_voltage_and_power.sh").unwrap(),
            Arity {
                min: 2,
                max: Some(2)
            }
        );
        assert_eq!(
            registry.arity("armxl", "custom_script.sh").unwrap(),
            Arity::UNCONSTRAINED
        );
        assert!(registry.params("armxl", "custom_script.sh").unwrap().is_empty());
    }

    #[test]
    fn test_arity_accepts() {
        let arity = Arity {
            min: 1,
            max: Some(2),
        };
        assert!(!arity.accepts(0));
        assert!(arity.accepts(2));
        assert!(!arity.accepts(3));
        assert!(Arity::UNCONSTRAINED.accepts(17));
        assert_eq!(arity.to_string(), "1..=2");
    }
}
