use crate::prelude::*;

use crate::coordinator::BatteryConnection;
use crate::register::RegisterDescriptor;

use std::collections::BTreeMap;

pub struct ReadRegisters<'a> {
    battery: &'a BatteryConnection,
    registers: Vec<&'static RegisterDescriptor>,
}

impl<'a> ReadRegisters<'a> {
    /// Fails straight away if any name is unknown for this battery's firmware.
    pub fn new(battery: &'a BatteryConnection, names: &[&str]) -> Result<Self> {
        let map = battery.register_map();
        let registers = names
            .iter()
            .map(|name| {
                let r = map.get(name)?;
                if !r.access.readable() {
                    bail!("register {} is write-only", name);
                }
                Ok(r)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { battery, registers })
    }

    pub async fn run(&self) -> Result<BTreeMap<String, f64>> {
        let mut values = BTreeMap::new();

        // one lock acquisition per register, so control writes can slot in between
        for r in &self.registers {
            let reply = self.battery.transport.exchange(super::read_request(r)).await?;
            let value = super::decode_reply(r, reply)?;
            debug!("{}: {} = {}", self.battery.name(), r.name, value);
            values.insert(r.name.to_owned(), value);
        }

        Ok(values)
    }
}
