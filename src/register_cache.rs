use crate::prelude::*;

use crate::register;

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Reading {
    pub value: f64,
    pub at: DateTime<Local>,
}

/// Decoded register values from one completed poll. Never mutated once published; the
/// next poll builds a new one.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RegisterSnapshot {
    pub taken_at: Option<DateTime<Local>>,
    values: BTreeMap<String, Reading>,
}

impl RegisterSnapshot {
    /// Carry forward `previous`, overwriting whatever was read fresh this cycle.
    pub fn merged(
        previous: &RegisterSnapshot,
        fresh: Vec<(&str, f64)>,
        at: DateTime<Local>,
    ) -> Self {
        let mut values = previous.values.clone();
        for (name, value) in fresh {
            values.insert(name.to_owned(), Reading { value, at });
        }

        Self {
            taken_at: Some(at),
            values,
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).map(|r| r.value)
    }

    pub fn reading(&self, name: &str) -> Option<&Reading> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn soc(&self) -> Option<f64> {
        self.get(register::BATTERY_SOC)
    }

    /// Energy currently held, kWh.
    pub fn stored_energy_kwh(&self) -> Option<f64> {
        let soc = self.soc()?;
        let total = self.get(register::BATTERY_TOTAL_ENERGY)?;
        Some(soc / 100.0 * total)
    }

    /// Lifetime energy out over energy in, percent. None until something was charged.
    pub fn round_trip_efficiency(&self) -> Option<f64> {
        let charged = self.get(register::TOTAL_CHARGING_ENERGY)?;
        let discharged = self.get(register::TOTAL_DISCHARGING_ENERGY)?;
        (charged > 0.0).then(|| discharged * 100.0 / charged)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, r)| (k.as_str(), r.value))
    }
}

/// Latest snapshot of one battery. Readers never block the poller and never see a
/// half-built snapshot.
#[derive(Clone)]
pub struct RegisterCache {
    tx: Arc<watch::Sender<Arc<RegisterSnapshot>>>,
}

impl Default for RegisterCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterCache {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(RegisterSnapshot::default()));
        Self { tx: Arc::new(tx) }
    }

    pub fn latest(&self) -> Arc<RegisterSnapshot> {
        self.tx.borrow().clone()
    }

    /// "state changed" notifications for display adapters.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RegisterSnapshot>> {
        self.tx.subscribe()
    }

    pub fn publish(&self, snapshot: RegisterSnapshot) {
        self.tx.send_replace(Arc::new(snapshot));
    }
}
