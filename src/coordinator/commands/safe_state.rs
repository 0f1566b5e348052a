use crate::prelude::*;

use crate::coordinator::BatteryConnection;
use crate::register::{self, ForceMode, WorkMode};

/// Final writes before disconnecting: zero both setpoints, stop forcing, hand control
/// back to the battery's own logic.
pub struct SafeState<'a> {
    battery: &'a BatteryConnection,
}

impl<'a> SafeState<'a> {
    pub fn new(battery: &'a BatteryConnection) -> Self {
        Self { battery }
    }

    pub fn writes(&self) -> Vec<(&'static str, f64)> {
        let mut writes = vec![
            (register::SET_DISCHARGE_POWER, 0.0),
            (register::SET_CHARGE_POWER, 0.0),
            (register::FORCE_MODE, u16::from(ForceMode::Stop) as f64),
        ];

        if self.battery.register_map().supports(register::USER_WORK_MODE) {
            writes.push((register::USER_WORK_MODE, u16::from(WorkMode::AntiFeed) as f64));
        }

        writes.push((register::RS485_CONTROL, register::RS485_DISABLE as f64));
        writes
    }

    /// Waits for whoever holds the connection, then writes each register once. Runs
    /// after the shutdown flag is set, so it never retries or reconnects.
    pub async fn run(&self) -> Result<()> {
        let name = self.battery.name();
        let map = self.battery.register_map();
        let mut guard = self.battery.transport.lock().await;
        let mut failed = Vec::new();

        for (register, value) in self.writes() {
            let request = super::write_request(map.get(register)?, value)?;
            match guard.exchange_once(request).await {
                Ok(_) => info!("{}: safe state {} = {}", name, register, value),
                Err(err) => {
                    error!("{}: safe state {} failed: {}", name, register, err);
                    failed.push(register);
                }
            }
        }

        if !failed.is_empty() {
            bail!("{}: safe-state writes failed for {:?}", name, failed);
        }

        Ok(())
    }
}
