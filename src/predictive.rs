use crate::prelude::*;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

pub const HISTORY_DAYS: usize = 7;
pub const DEFAULT_DAILY_KWH: f64 = 5.0;
/// below this a day's reading is assumed to be a meter glitch or an outage
pub const MIN_DAILY_KWH: f64 = 1.5;
/// SOC points lost since the decision that trigger a fresh one
pub const SOC_REEVALUATION_DROP: f64 = 30.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatteryEnergy {
    pub capacity_kwh: f64,
    pub soc: f64,
    pub min_soc: f64,
    pub max_soc: f64,
}

impl BatteryEnergy {
    fn stored(&self) -> f64 {
        self.soc / 100.0 * self.capacity_kwh
    }
}

/// Energy available above the discharge cutoffs, kWh.
pub fn usable_energy(batteries: &[BatteryEnergy]) -> f64 {
    let stored: f64 = batteries.iter().map(|b| b.stored()).sum();
    let reserve: f64 = batteries.iter().map(|b| b.min_soc / 100.0 * b.capacity_kwh).sum();
    (stored - reserve).max(0.0)
}

/// Room left below the charge cutoffs, kWh.
pub fn headroom(batteries: &[BatteryEnergy]) -> f64 {
    let ceiling: f64 = batteries.iter().map(|b| b.max_soc / 100.0 * b.capacity_kwh).sum();
    let stored: f64 = batteries.iter().map(|b| b.stored()).sum();
    (ceiling - stored).max(0.0)
}

pub fn average_soc(batteries: &[BatteryEnergy]) -> f64 {
    if batteries.is_empty() {
        return 0.0;
    }
    batteries.iter().map(|b| b.soc).sum::<f64>() / batteries.len() as f64
}

/// Grid power available for charging without tripping the main breaker.
pub fn grid_charge_power(total_max_charge: f64, max_contracted_power: f64, house_load: f64) -> f64 {
    total_max_charge.min((max_contracted_power - house_load.max(0.0)).max(0.0))
}

/// Split `total` watts across batteries in proportion to their limits, in 5W steps.
pub fn distribute(total: f64, limits: &[f64]) -> Vec<f64> {
    let sum: f64 = limits.iter().sum();
    if sum <= 0.0 || total <= 0.0 {
        return vec![0.0; limits.len()];
    }

    limits
        .iter()
        .map(|l| ((total * l / sum / 5.0).floor() * 5.0).min(*l))
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct DecisionInputs {
    pub date: NaiveDate,
    pub batteries: Vec<BatteryEnergy>,
    pub consumption_kwh: f64,
    pub solar_forecast_kwh: Option<f64>,
    pub house_load: f64,
    pub max_contracted_power: f64,
    pub window_hours: f64,
    pub override_active: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PredictiveDecision {
    pub date: NaiveDate,
    pub usable_kwh: f64,
    pub solar_kwh: f64,
    /// false when no usable forecast was available and solar was taken as zero
    pub solar_forecast_valid: bool,
    pub consumption_kwh: f64,
    pub charge_target_wh: f64,
    pub override_active: bool,
    pub average_soc: f64,
}

impl PredictiveDecision {
    pub fn decide(i: &DecisionInputs) -> Self {
        let (solar_kwh, solar_forecast_valid) = match i.solar_forecast_kwh {
            Some(kwh) if kwh.is_finite() && kwh >= 0.0 => (kwh, true),
            _ => (0.0, false),
        };

        let usable_kwh = usable_energy(&i.batteries);
        let deficit = i.consumption_kwh - (usable_kwh + solar_kwh);

        let charge_target_kwh = if deficit <= 0.0 {
            0.0
        } else {
            let breaker_kwh =
                grid_charge_power(f64::INFINITY, i.max_contracted_power, i.house_load) / 1000.0
                    * i.window_hours;
            deficit.min(headroom(&i.batteries)).min(breaker_kwh).max(0.0)
        };

        Self {
            date: i.date,
            usable_kwh,
            solar_kwh,
            solar_forecast_valid,
            consumption_kwh: i.consumption_kwh,
            charge_target_wh: (charge_target_kwh * 1000.0).round(),
            override_active: i.override_active,
            average_soc: average_soc(&i.batteries),
        }
    }

    pub fn charges(&self) -> bool {
        self.charge_target_wh > 0.0
    }

    pub fn summary(&self) -> String {
        let forecast = if self.solar_forecast_valid {
            format!("{:.2} kWh solar forecast", self.solar_kwh)
        } else {
            "no solar forecast, assuming none".to_string()
        };

        let verdict = if self.charges() {
            format!("grid charge {:.2} kWh", self.charge_target_wh / 1000.0)
        } else {
            "no grid charging needed".to_string()
        };

        let over = if self.override_active {
            " (override engaged, charging will be skipped)"
        } else {
            ""
        };

        format!(
            "{}: {}. {:.2} kWh usable, {}, {:.2} kWh expected consumption{}",
            self.date, verdict, self.usable_kwh, forecast, self.consumption_kwh, over
        )
    }
}

// ConsumptionHistory {{{
/// Daily consumption, newest seven days.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionHistory {
    days: BTreeMap<NaiveDate, f64>,
}

impl ConsumptionHistory {
    /// Returns false if the reading looks implausible and was ignored.
    pub fn record(&mut self, date: NaiveDate, kwh: f64) -> bool {
        if !kwh.is_finite() || kwh < MIN_DAILY_KWH {
            warn!("ignoring consumption of {:.2} kWh for {}", kwh, date);
            return false;
        }

        self.days.insert(date, kwh);
        while self.days.len() > HISTORY_DAYS {
            self.days.pop_first();
        }
        true
    }

    pub fn merge(&mut self, other: ConsumptionHistory) {
        for (date, kwh) in other.days {
            self.record(date, kwh);
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.days.contains_key(&date)
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn average(&self) -> f64 {
        if self.days.is_empty() {
            return DEFAULT_DAILY_KWH;
        }
        self.days.values().sum::<f64>() / self.days.len() as f64
    }
} // }}}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn load(&self) -> Result<ConsumptionHistory>;
    async fn save(&self, history: &ConsumptionHistory) -> Result<()>;
}

/// Keeps history for the lifetime of the process only.
#[derive(Default)]
pub struct MemoryStore {
    history: Mutex<ConsumptionHistory>,
}

impl MemoryStore {
    pub fn new(history: ConsumptionHistory) -> Self {
        Self {
            history: Mutex::new(history),
        }
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn load(&self) -> Result<ConsumptionHistory> {
        Ok(self.history.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn save(&self, history: &ConsumptionHistory) -> Result<()> {
        *self.history.lock().unwrap_or_else(|e| e.into_inner()) = history.clone();
        Ok(())
    }
}

pub struct JsonFileStore {
    path: String,
}

impl JsonFileStore {
    pub fn new(path: String) -> Self {
        Self { path }
    }
}

#[async_trait]
impl HistoryStore for JsonFileStore {
    async fn load(&self) -> Result<ConsumptionHistory> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(serde_json::from_str(&content)
                .map_err(|err| anyhow!("error parsing {}: {}", self.path, err))?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("no consumption history at {} yet", self.path);
                Ok(ConsumptionHistory::default())
            }
            Err(err) => bail!("error reading {}: {}", self.path, err),
        }
    }

    async fn save(&self, history: &ConsumptionHistory) -> Result<()> {
        let content = serde_json::to_string_pretty(history)?;
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|err| anyhow!("error writing {}: {}", self.path, err))
    }
}

#[derive(Debug, Default)]
struct HoldState {
    held: HashSet<String>,
    block_discharge: bool,
}

/// Batteries the scheduler has taken away from the control loop for the charge window.
#[derive(Clone, Debug, Default)]
pub struct PredictiveHold {
    inner: Arc<Mutex<HoldState>>,
}

impl PredictiveHold {
    fn state(&self) -> std::sync::MutexGuard<'_, HoldState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn hold<I: IntoIterator<Item = String>>(&self, names: I) {
        self.state().held.extend(names);
    }

    pub fn release_all(&self) {
        let mut state = self.state();
        state.held.clear();
        state.block_discharge = false;
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.state().held.contains(name)
    }

    pub fn any_held(&self) -> bool {
        !self.state().held.is_empty()
    }

    /// In the window with nothing to charge, the batteries still must not drain.
    pub fn set_block_discharge(&self, block: bool) {
        self.state().block_discharge = block;
    }

    pub fn discharge_blocked(&self) -> bool {
        self.state().block_discharge
    }
}
