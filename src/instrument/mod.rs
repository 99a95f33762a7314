//! Instrument abstraction and the shipped driver set.
//!
//! Physical drivers speak SCPI, Modbus or SSH; none of that is modelled here.
//! What the sequencer needs is a uniform dispatch surface: `invoke` a named
//! command with parsed arguments, and optionally read back a setpoint so a
//! ramp knows where it starts.

pub mod bindings;
pub mod capabilities;
pub mod charger;
pub mod simulated;

pub use bindings::{Binding, Connector, InstrumentBindings, SimulatedConnector};
pub use capabilities::{ArgKind, Arity, CapabilityEntry, CapabilityRegistry, CommandSpec, Param};
pub use charger::{script_line, Charger, RemoteShell};
pub use simulated::{CallLog, FailurePlan, Invocation, ShellLines, SimulatedInstrument, SimulatedShell};

use crate::error::DispatchError;
use crate::sequence::ArgValue;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The driver families a bench can be built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    /// Programmable bidirectional DC source / electronic load.
    DcSource,
    /// AC grid simulator.
    AcSource,
    /// Bench DC power supply.
    PowerSupply,
    /// Temperature and humidity chamber.
    ClimChamber,
    /// Digital oscilloscope.
    Oscilloscope,
    /// Charger controlled over a remote shell.
    Charger,
}

impl InstrumentKind {
    /// Every kind, in display order.
    pub const ALL: [InstrumentKind; 6] = [
        InstrumentKind::DcSource,
        InstrumentKind::AcSource,
        InstrumentKind::PowerSupply,
        InstrumentKind::ClimChamber,
        InstrumentKind::Oscilloscope,
        InstrumentKind::Charger,
    ];

    /// The id a sequence uses for this kind.
    pub fn default_id(&self) -> &'static str {
        match self {
            InstrumentKind::DcSource => "dc_source",
            InstrumentKind::AcSource => "ac_source",
            InstrumentKind::PowerSupply => "powersupply",
            InstrumentKind::ClimChamber => "clim_chamber",
            InstrumentKind::Oscilloscope => "oscilloscope",
            InstrumentKind::Charger => "armxl",
        }
    }

    /// Kind whose default id is `id`, ignoring case.
    pub fn from_id(id: &str) -> Option<Self> {
        let id = id.trim().to_lowercase();
        Self::ALL.into_iter().find(|k| k.default_id() == id)
    }
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.default_id())
    }
}

/// A bound instrument the scheduler can dispatch to.
///
/// Handles are owned by one scheduler task for the length of a run, so the
/// methods take `&mut self` and no locking is involved.
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Lower-cased id.
    fn id(&self) -> &str;

    /// Kind of instrument.
    fn kind(&self) -> InstrumentKind;

    /// Run one command. `None` arguments means a no-argument call.
    async fn invoke(
        &mut self,
        command: &str,
        args: Option<&[ArgValue]>,
    ) -> Result<Option<ArgValue>, DispatchError>;

    /// Current setpoint of a rampable channel, if the driver can report it.
    async fn read_setpoint(&mut self, _channel: &str) -> Option<f64> {
        None
    }
}
