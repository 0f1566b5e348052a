use crate::prelude::*;

use std::collections::HashMap;
use std::sync::Arc;

/// Signals fed in from outside: meter readings, forecasts and user switches.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InputState {
    /// grid consumption in W, positive while importing
    pub consumption: Option<f64>,
    /// forecast solar production for tomorrow, kWh
    pub solar_forecast_kwh: Option<f64>,
    /// current house load in W, used to keep grid charging under the contracted power
    pub house_load: Option<f64>,
    /// power of individual devices, keyed by name, for load exclusion
    pub devices: HashMap<String, f64>,
    pub manual_mode: bool,
    pub predictive_override: bool,
}

#[derive(Clone)]
pub struct Inputs {
    tx: Arc<watch::Sender<InputState>>,
}

impl Default for Inputs {
    fn default() -> Self {
        Self::new()
    }
}

impl Inputs {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(InputState::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> InputState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<InputState> {
        self.tx.subscribe()
    }

    pub fn set_consumption(&self, watts: f64) {
        self.tx.send_modify(|s| s.consumption = Some(watts));
    }

    pub fn set_solar_forecast(&self, kwh: Option<f64>) {
        self.tx.send_modify(|s| s.solar_forecast_kwh = kwh);
    }

    pub fn set_house_load(&self, watts: f64) {
        self.tx.send_modify(|s| s.house_load = Some(watts));
    }

    pub fn set_device_power(&self, device: &str, watts: f64) {
        self.tx.send_modify(|s| {
            s.devices.insert(device.to_owned(), watts);
        });
    }

    pub fn set_manual_mode(&self, enabled: bool) {
        info!("manual mode {}", if enabled { "on" } else { "off" });
        self.tx.send_modify(|s| s.manual_mode = enabled);
    }

    pub fn set_predictive_override(&self, enabled: bool) {
        info!("predictive charging override {}", if enabled { "on" } else { "off" });
        self.tx.send_modify(|s| s.predictive_override = enabled);
    }
}
