use crate::prelude::*;

use crate::coordinator::BatteryConnection;
use crate::modbus::TransportGuard;
use crate::register::{self, ForceMode, RegisterDescriptor};

use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteOutcome {
    /// values read back after the writes, keyed by register name
    pub confirmed: BTreeMap<String, f64>,
    pub mismatches: Vec<WriteMismatchError>,
}

impl WriteOutcome {
    pub fn is_confirmed(&self) -> bool {
        self.mismatches.is_empty()
    }
}

// discharge power before charge power, and the mode last, since the device acts on the
// mode using whatever setpoints it holds at that moment
fn write_rank(name: &str) -> u8 {
    match name {
        register::SET_DISCHARGE_POWER => 0,
        register::SET_CHARGE_POWER => 1,
        register::FORCE_MODE => 3,
        _ => 2,
    }
}

pub struct WriteAtomic<'a> {
    battery: &'a BatteryConnection,
    writes: Vec<(&'static RegisterDescriptor, f64)>,
    read_only: bool,
}

impl<'a> WriteAtomic<'a> {
    /// Resolves and range-checks every write before anything goes on the wire.
    pub fn new(
        battery: &'a BatteryConnection,
        writes: &BTreeMap<String, f64>,
        read_only: bool,
    ) -> Result<Self> {
        if writes.is_empty() {
            bail!("nothing to write");
        }

        let map = battery.register_map();
        let mut resolved = writes
            .iter()
            .map(|(name, value)| {
                let r = map.get(name)?;
                if !r.access.writable() {
                    return Err(RegisterError::ReadOnly(name.clone()).into());
                }
                r.encode(*value)?;
                Ok((r, *value))
            })
            .collect::<Result<Vec<_>>>()?;

        resolved.sort_by_key(|(r, _)| (write_rank(r.name), r.name));

        Ok(Self {
            battery,
            writes: resolved,
            read_only,
        })
    }

    pub async fn run(&self) -> Result<WriteOutcome> {
        let name = self.battery.name();
        if self.read_only {
            bail!("{} is read-only, refusing to write {:?}", name, self.writes);
        }

        let mut guard = self.battery.transport.lock().await;

        for (i, (r, value)) in self.writes.iter().enumerate() {
            info!("{}: writing {} = {}", name, r.name, value);
            if let Err(err) = guard.exchange(super::write_request(r, *value)?).await {
                error!("{}: writing {} failed: {}", name, r.name, err);
                if i > 0 {
                    restore_safe_state(name, &mut guard).await;
                }
                return Err(err.into());
            }
        }

        // read back under the same lock so nobody else's writes can be mixed in
        let mut outcome = WriteOutcome::default();
        for (r, wanted) in &self.writes {
            if !r.access.readable() {
                continue;
            }

            let reply = guard.exchange(super::read_request(r)).await?;
            let actual = super::decode_reply(r, reply)?;

            if !r.matches(*wanted, actual) {
                let mismatch = WriteMismatchError {
                    name: r.name.to_owned(),
                    wanted: *wanted,
                    actual,
                };
                warn!("{}: {}", name, mismatch);
                outcome.mismatches.push(mismatch);
            }
            outcome.confirmed.insert(r.name.to_owned(), actual);
        }

        Ok(outcome)
    }
}

/// A group that failed half way must not leave a new setpoint under an old mode, so put
/// the battery into stop with zero setpoints. Best effort: the link is likely unwell.
async fn restore_safe_state(name: &str, guard: &mut TransportGuard<'_>) {
    warn!("{}: partial write, restoring safe state", name);

    let map = guard.version().register_map();
    let safe = [
        (register::FORCE_MODE, u16::from(ForceMode::Stop) as f64),
        (register::SET_CHARGE_POWER, 0.0),
        (register::SET_DISCHARGE_POWER, 0.0),
    ];

    for (register, value) in safe {
        let request = match map
            .get(register)
            .map_err(Error::from)
            .and_then(|r| super::write_request(r, value))
        {
            Ok(request) => request,
            Err(err) => {
                error!("{}: cannot build safe-state write for {}: {}", name, register, err);
                continue;
            }
        };

        if let Err(err) = guard.exchange_once(request).await {
            error!("{}: safe-state write {} failed: {}", name, register, err);
        }
    }
}
