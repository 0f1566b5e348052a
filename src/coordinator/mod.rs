use crate::prelude::*;

pub mod commands;

use crate::modbus::{Transport, TransportSettings};
use crate::register_cache::RegisterCache;
use commands::write_atomic::WriteOutcome;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;

/// Everything the engine knows about one configured battery.
pub struct BatteryConnection {
    name: String,
    version: BatteryVersion,
    pub transport: Transport,
    pub cache: RegisterCache,
    cycle: AtomicU64,
}

impl BatteryConnection {
    pub fn new(battery: &config::Battery, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            name: battery.name().to_owned(),
            version: battery.version(),
            transport: Transport::new(
                battery.name(),
                TransportSettings::for_battery(battery),
                shutdown,
            ),
            cache: RegisterCache::new(),
            cycle: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> BatteryVersion {
        self.version
    }

    pub fn register_map(&self) -> &'static RegisterMap {
        self.version.register_map()
    }

    pub fn snapshot(&self) -> Arc<RegisterSnapshot> {
        self.cache.latest()
    }

    fn next_cycle(&self) -> u64 {
        self.cycle.fetch_add(1, Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct Coordinator {
    config: ConfigWrapper,
    batteries: Arc<Vec<Arc<BatteryConnection>>>,
    shutdown: Arc<AtomicBool>,
}

impl Coordinator {
    pub fn new(config: ConfigWrapper, shutdown: Arc<AtomicBool>) -> Self {
        let batteries = config
            .enabled_batteries()
            .iter()
            .map(|b| Arc::new(BatteryConnection::new(b, shutdown.clone())))
            .collect();

        Self {
            config,
            batteries: Arc::new(batteries),
            shutdown,
        }
    }

    pub fn config(&self) -> &ConfigWrapper {
        &self.config
    }

    pub fn batteries(&self) -> &[Arc<BatteryConnection>] {
        &self.batteries
    }

    pub fn battery(&self, name: &str) -> Result<&Arc<BatteryConnection>> {
        self.batteries
            .iter()
            .find(|b| b.name() == name)
            .ok_or_else(|| anyhow!("unknown battery {}", name))
    }

    pub fn snapshot(&self, name: &str) -> Result<Arc<RegisterSnapshot>> {
        Ok(self.battery(name)?.snapshot())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Read every register due this cycle; the cached snapshot is only replaced if all
    /// of them succeed.
    pub async fn poll(&self, name: &str) -> Result<Arc<RegisterSnapshot>> {
        let battery = self.battery(name)?;
        commands::poll::Poll::new(battery, battery.next_cycle())
            .run()
            .await
    }

    pub async fn poll_all(&self) {
        for battery in self.batteries.iter() {
            if self.is_shutting_down() {
                return;
            }
            if let Err(err) = self.poll(battery.name()).await {
                warn!(
                    "{}: poll failed, keeping snapshot from {:?}: {:#}",
                    battery.name(),
                    battery.snapshot().taken_at,
                    err
                );
            }
        }
    }

    pub async fn read(&self, name: &str, registers: &[&str]) -> Result<BTreeMap<String, f64>> {
        let battery = self.battery(name)?;
        commands::read_registers::ReadRegisters::new(battery, registers)?
            .run()
            .await
    }

    /// Apply a group of register writes under one lock acquisition and read them back.
    pub async fn write_atomic(
        &self,
        name: &str,
        writes: &BTreeMap<String, f64>,
    ) -> Result<WriteOutcome> {
        let battery = self.battery(name)?;
        let read_only = self
            .config
            .battery(name)
            .map(|b| b.read_only())
            .unwrap_or(false);

        commands::write_atomic::WriteAtomic::new(battery, writes, read_only)?
            .run()
            .await
    }

    pub async fn configure(&self, name: &str) -> Result<WriteOutcome> {
        let battery = self.battery(name)?;
        let settings = self
            .config
            .battery(name)
            .ok_or_else(|| anyhow!("no configuration for battery {}", name))?;

        commands::configure::Configure::new(battery, settings)
            .run()
            .await
    }

    /// From here on every exchange fails fast; only the safe-state path still talks.
    pub fn begin_shutdown(&self) {
        info!("shutdown flag set");
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub async fn safe_state(&self, name: &str) -> Result<()> {
        if self.config.battery(name).is_some_and(|b| b.read_only()) {
            info!("{}: read-only, leaving registers alone", name);
            return Ok(());
        }

        commands::safe_state::SafeState::new(self.battery(name)?)
            .run()
            .await
    }

    /// Periodic poller, runs until `stop` fires.
    pub async fn start(&self, mut stop: broadcast::Receiver<()>) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("poller starting, every {:?}", self.config.poll_interval());

        loop {
            tokio::select! {
                _ = stop.recv() => break,
                _ = interval.tick() => self.poll_all().await,
            }
        }

        info!("poller stopped");
        Ok(())
    }
}
