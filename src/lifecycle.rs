use crate::prelude::*;

use crate::control::ControlLoop;
use crate::coordinator::Coordinator;
use crate::inputs::Inputs;
use crate::mqtt::Mqtt;
use crate::predictive::{HistoryStore, JsonFileStore, MemoryStore, PredictiveHold};
use crate::scheduler::Scheduler;

use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Stopped,
    Connecting,
    Running,
    Stopping,
}

/// Owns the engine's tasks and takes the batteries in and out of remote control.
pub struct Lifecycle {
    config: ConfigWrapper,
    channels: Channels,
    inputs: Inputs,
    hold: PredictiveHold,
    coordinator: Coordinator,
    state: watch::Sender<LifecycleState>,
    stop_tx: broadcast::Sender<()>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Lifecycle {
    pub fn new(config: ConfigWrapper, channels: Channels, inputs: Inputs) -> Self {
        let coordinator = Coordinator::new(config.clone(), Arc::new(AtomicBool::new(false)));
        let (state, _) = watch::channel(LifecycleState::Stopped);
        let (stop_tx, _) = broadcast::channel(1);

        Self {
            config,
            channels,
            inputs,
            hold: PredictiveHold::default(),
            coordinator,
            state,
            stop_tx,
            handles: Vec::new(),
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn inputs(&self) -> &Inputs {
        &self.inputs
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: LifecycleState) {
        info!("lifecycle: {:?} -> {:?}", self.state(), state);
        self.state.send_replace(state);
    }

    fn history_store(&self) -> Arc<dyn HistoryStore> {
        match self.config.predictive().and_then(|p| p.history_file) {
            Some(path) => Arc::new(JsonFileStore::new(path)),
            None => Arc::new(MemoryStore::default()),
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.state() != LifecycleState::Stopped {
            bail!("cannot start while {:?}", self.state());
        }
        if self.coordinator.is_shutting_down() {
            bail!("engine was shut down, create a new one to start again");
        }

        self.set_state(LifecycleState::Connecting);

        for battery in self.coordinator.batteries() {
            let name = battery.name();
            if let Err(err) = battery.transport.connect().await {
                warn!("{}: not reachable yet, polling will keep trying: {}", name, err);
                continue;
            }

            match self.coordinator.configure(name).await {
                Ok(outcome) if !outcome.is_confirmed() => {
                    warn!("{}: startup configuration not confirmed: {:?}", name, outcome.mismatches)
                }
                Ok(_) => {}
                Err(err) => warn!("{}: startup configuration failed: {:#}", name, err),
            }
        }

        let mut scheduler = Scheduler::new(
            self.coordinator.clone(),
            self.inputs.clone(),
            self.channels.clone(),
            self.hold.clone(),
            self.history_store(),
        );
        if let Err(err) = scheduler.backfill().await {
            warn!("consumption history backfill failed: {:#}", err);
        }

        // give the control loop something to work with on its first tick
        self.coordinator.poll_all().await;

        let coordinator = self.coordinator.clone();
        let stop = self.stop_tx.subscribe();
        self.spawn("poller", async move { coordinator.start(stop).await });

        let control = ControlLoop::new(
            self.coordinator.clone(),
            self.inputs.clone(),
            self.hold.clone(),
        );
        let stop = self.stop_tx.subscribe();
        self.spawn("control", control.start(stop));

        let stop = self.stop_tx.subscribe();
        self.spawn("scheduler", scheduler.start(stop));

        if self.config.mqtt().enabled() {
            let mqtt = Mqtt::new(
                self.config.clone(),
                self.channels.clone(),
                self.coordinator.clone(),
                self.inputs.clone(),
            );
            let stop = self.stop_tx.subscribe();
            self.spawn("mqtt", async move { mqtt.start(stop).await });
        }

        self.set_state(LifecycleState::Running);
        Ok(())
    }

    fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            if let Err(err) = task.await {
                error!("{} task failed: {:#}", name, err);
            }
        });
        self.handles.push((name, handle));
    }

    /// Stop every task, leave each battery in a safe state and disconnect. Polling and
    /// control are confirmed finished before the safe-state writes go out.
    pub async fn stop(&mut self) -> Result<()> {
        match self.state() {
            LifecycleState::Stopped | LifecycleState::Stopping => return Ok(()),
            LifecycleState::Connecting | LifecycleState::Running => {}
        }

        self.set_state(LifecycleState::Stopping);

        let _ = self.stop_tx.send(());
        self.coordinator.begin_shutdown();

        for (name, handle) in self.handles.drain(..) {
            if let Err(err) = handle.await {
                error!("waiting for {} task: {}", name, err);
            }
            debug!("{} task finished", name);
        }

        let mut failed = Vec::new();
        for battery in self.coordinator.batteries() {
            if let Err(err) = self.coordinator.safe_state(battery.name()).await {
                error!("{:#}", err);
                failed.push(battery.name().to_owned());
            }
            battery.transport.close().await;
        }

        self.hold.release_all();
        self.set_state(LifecycleState::Stopped);

        if !failed.is_empty() {
            bail!("batteries may not be in a safe state: {:?}", failed);
        }
        Ok(())
    }
}
