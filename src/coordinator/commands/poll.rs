use crate::prelude::*;

use crate::coordinator::BatteryConnection;

use std::sync::Arc;

pub struct Poll<'a> {
    battery: &'a BatteryConnection,
    cycle: u64,
}

impl<'a> Poll<'a> {
    pub fn new(battery: &'a BatteryConnection, cycle: u64) -> Self {
        Self { battery, cycle }
    }

    pub async fn run(&self) -> Result<Arc<RegisterSnapshot>> {
        let previous = self.battery.snapshot();
        let map = self.battery.register_map();

        // registers due this cycle, plus anything never read so the first
        // snapshot is complete
        let due: Vec<_> = map
            .all()
            .filter(|r| r.access.readable())
            .filter(|r| r.tier.due(self.cycle) || !previous.contains(r.name))
            .collect();

        let mut fresh = Vec::with_capacity(due.len());
        for r in due {
            let reply = self.battery.transport.exchange(super::read_request(r)).await?;
            fresh.push((r.name, super::decode_reply(r, reply)?));
        }

        trace!("{}: cycle {} read {} registers", self.battery.name(), self.cycle, fresh.len());

        let snapshot = RegisterSnapshot::merged(&previous, fresh, chrono::Local::now());
        self.battery.cache.publish(snapshot);

        Ok(self.battery.snapshot())
    }
}
