//! Live instrument handles and how they are obtained.

use super::charger::Charger;
use super::simulated::{CallLog, FailurePlan, SimulatedInstrument, SimulatedShell};
use super::{Instrument, InstrumentKind};
use crate::config::Address;
use crate::error::ConnectionError;
use crate::sequence::SeedTable;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// A bound instrument.
pub enum Binding {
    /// Instrument driven by commands.
    Device(Box<dyn Instrument>),
    /// Charger driven by shell scripts.
    Charger(Charger),
}

impl Binding {
    /// Id of the bound instrument.
    pub fn id(&self) -> &str {
        match self {
            Binding::Device(device) => device.id(),
            Binding::Charger(charger) => charger.id(),
        }
    }
}

/// Turns an id and address into a live binding.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `id`, at `address` when one is configured.
    async fn connect(
        &self,
        id: &str,
        address: Option<&Address>,
    ) -> Result<Binding, ConnectionError>;
}

/// The set of instruments bound for one run.
#[derive(Default)]
pub struct InstrumentBindings {
    bindings: HashMap<String, Binding>,
}

impl InstrumentBindings {
    /// No bindings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding under its own id.
    pub fn insert(&mut self, binding: Binding) {
        self.bindings.insert(binding.id().to_lowercase(), binding);
    }

    /// True if `id` is present.
    pub fn contains(&self, id: &str) -> bool {
        self.bindings.contains_key(&id.to_lowercase())
    }

    /// Binding for `id`.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Binding> {
        self.bindings.get_mut(&id.to_lowercase())
    }

    /// Bound ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.bindings.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of bound instruments.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// True when nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Connect each id in turn; failures are collected, not fatal.
    pub async fn connect_all(
        connector: &dyn Connector,
        ids: &[String],
        addresses: &BTreeMap<String, Address>,
    ) -> (Self, Vec<ConnectionError>) {
        let mut bindings = Self::new();
        let mut failures = Vec::new();

        for id in ids {
            match connector.connect(id, addresses.get(id)).await {
                Ok(binding) => {
                    info!("Connected {}", id);
                    bindings.insert(binding);
                }
                Err(e) => {
                    warn!("Could not connect {}: {}", id, e);
                    failures.push(e);
                }
            }
        }
        (bindings, failures)
    }

    /// Read the current setpoint of each `(instrument, channel)` once.
    ///
    /// Unbound instruments and channels a driver cannot report are left out.
    pub async fn read_seeds(&mut self, requests: &[(String, String)]) -> SeedTable {
        let mut seeds = SeedTable::new();
        for (id, channel) in requests {
            if let Some(Binding::Device(device)) = self.get_mut(id) {
                match device.read_setpoint(channel).await {
                    Some(value) => {
                        debug!("Seed {} {} = {}", id, channel, value);
                        seeds.insert(id, channel, value);
                    }
                    None => debug!("{} cannot report {}", id, channel),
                }
            }
        }
        seeds
    }

    /// Every id in `required` must be bound.
    pub fn require(&self, required: &[String]) -> Result<(), ConnectionError> {
        let missing: Vec<String> = required
            .iter()
            .filter(|id| !self.contains(id))
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConnectionError::MissingRequired(missing))
        }
    }
}

/// Connector producing simulated instruments.
///
/// Every instrument it creates writes to the same call log, so tests can
/// assert the global dispatch order. Each `connect` yields a fresh handle.
#[derive(Clone, Default)]
pub struct SimulatedConnector {
    log: CallLog,
    failures: FailurePlan,
    unreachable: Arc<Mutex<HashSet<String>>>,
    setpoints: Arc<Mutex<HashMap<(String, String), f64>>>,
    connections: Arc<Mutex<Vec<String>>>,
}

impl SimulatedConnector {
    /// Connector where every instrument is reachable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared log of every call made through this connector.
    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    /// Failure rules applied to every new handle.
    pub fn failures(&self) -> &FailurePlan {
        &self.failures
    }

    /// Make every future connection to `id` fail.
    pub fn unreachable(&self, id: &str) {
        self.unreachable_ids().insert(id.to_lowercase());
    }

    /// Initial setpoint reported by new handles for `id`.
    pub fn with_setpoint(self, id: &str, channel: &str, value: f64) -> Self {
        self.setpoints
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((id.to_lowercase(), channel.to_lowercase()), value);
        self
    }

    /// Ids in the order connections were attempted.
    pub fn connections(&self) -> Vec<String> {
        self.connections
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn unreachable_ids(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.unreachable.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    async fn connect(
        &self,
        id: &str,
        address: Option<&Address>,
    ) -> Result<Binding, ConnectionError> {
        let id = id.to_lowercase();
        self.connections
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(id.clone());

        if self.unreachable_ids().contains(&id) {
            return Err(ConnectionError::Failed {
                instrument: id,
                message: match address {
                    Some(address) => format!("no response at {}", address),
                    None => "no response".to_string(),
                },
            });
        }

        let kind = InstrumentKind::from_id(&id).ok_or_else(|| ConnectionError::Failed {
            instrument: id.clone(),
            message: "no driver for this instrument".to_string(),
        })?;

        if kind == InstrumentKind::Charger {
            let shell = SimulatedShell::new()
                .with_log(&id, self.log.clone())
                .with_failures(self.failures.clone());
            return Ok(Binding::Charger(Charger::new(&id, Box::new(shell))));
        }

        let mut device = SimulatedInstrument::new(&id, kind, self.log.clone())
            .with_failures(self.failures.clone());
        let setpoints = self.setpoints.lock().unwrap_or_else(|p| p.into_inner());
        for ((owner, channel), value) in setpoints.iter() {
            if *owner == id {
                device = device.with_setpoint(channel, *value);
            }
        }
        Ok(Binding::Device(Box::new(device)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_connect_all_collects_failures() {
        let connector = SimulatedConnector::new();
        connector.unreachable("ac_source");

        let (bindings, failures) = InstrumentBindings::connect_all(
            &connector,
            &ids(&["dc_source", "ac_source", "armxl"]),
            &BTreeMap::new(),
        )
        .await;

        assert_eq!(bindings.ids(), ids(&["armxl", "dc_source"]));
        assert_eq!(failures.len(), 1);
        assert_eq!(
            connector.connections(),
            ids(&["dc_source", "ac_source", "armxl"])
        );
    }

    #[tokio::test]
    async fn test_require_lists_every_missing_instrument() {
        let connector = SimulatedConnector::new();
        let (bindings, _) =
            InstrumentBindings::connect_all(&connector, &ids(&["dc_source"]), &BTreeMap::new())
                .await;
        let err = bindings
            .require(&ids(&["dc_source", "ac_source", "clim_chamber"]))
            .unwrap_err();
        assert_eq!(
            err,
            ConnectionError::MissingRequired(ids(&["ac_source", "clim_chamber"]))
        );
    }

    #[tokio::test]
    async fn test_setpoints_seed_new_handles() {
        let connector = SimulatedConnector::new().with_setpoint("clim_chamber", "temp", 21.5);
        let binding = connector.connect("clim_chamber", None).await.unwrap();
        match binding {
            Binding::Device(mut device) => {
                assert_eq!(device.read_setpoint("temp").await, Some(21.5));
            }
            Binding::Charger(_) => panic!("chamber bound as charger"),
        }
    }
}
