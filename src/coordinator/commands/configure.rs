use crate::prelude::*;

use crate::coordinator::BatteryConnection;
use crate::register;

use super::write_atomic::{WriteAtomic, WriteOutcome};
use std::collections::BTreeMap;

/// Startup writes: take RS485 control and push the configured limits to the device.
pub struct Configure<'a> {
    battery: &'a BatteryConnection,
    settings: config::Battery,
}

impl<'a> Configure<'a> {
    pub fn new(battery: &'a BatteryConnection, settings: config::Battery) -> Self {
        Self { battery, settings }
    }

    pub fn writes(&self) -> BTreeMap<String, f64> {
        let s = &self.settings;
        let mut writes = BTreeMap::from([
            (register::RS485_CONTROL.to_owned(), register::RS485_ENABLE as f64),
            (register::MAX_CHARGE_POWER.to_owned(), s.max_charge_power()),
            (register::MAX_DISCHARGE_POWER.to_owned(), s.max_discharge_power()),
        ]);

        if self.battery.version().has_cutoff_registers() {
            writes.insert(register::CHARGING_CUTOFF_CAPACITY.to_owned(), s.max_soc());
            writes.insert(register::DISCHARGING_CUTOFF_CAPACITY.to_owned(), s.min_soc());
        }

        writes
    }

    pub async fn run(&self) -> Result<WriteOutcome> {
        if self.settings.read_only() {
            info!("{}: read-only, skipping startup configuration", self.battery.name());
            return Ok(WriteOutcome::default());
        }

        info!("{}: enabling RS485 control and writing limits", self.battery.name());
        WriteAtomic::new(self.battery, &self.writes(), false)?
            .run()
            .await
    }
}
