use crate::prelude::*;

use crate::channels::Notification;
use crate::config::TimeSlot;
use crate::control::{power_writes, time_slots};
use crate::coordinator::Coordinator;
use crate::inputs::{InputState, Inputs};
use crate::predictive::{
    self, BatteryEnergy, ConsumptionHistory, DecisionInputs, HistoryStore, PredictiveDecision,
    PredictiveHold,
};
use crate::register;

use chrono::{Datelike, Duration, Local, NaiveDate, NaiveDateTime, NaiveTime};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;

const TICK_SECS: u64 = 30;

fn capture_time() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 55, 0).unwrap_or(NaiveTime::MIN)
}

fn window_slot(p: &config::Predictive) -> TimeSlot {
    TimeSlot {
        start: p.start_time,
        end: p.end_time,
        days: p.days.clone(),
        apply_to_charge: false,
    }
}

pub fn window_hours(p: &config::Predictive) -> f64 {
    let mut minutes = (p.end_time.0 - p.start_time.0).num_minutes();
    if minutes <= 0 {
        minutes += 24 * 60;
    }
    minutes as f64 / 60.0
}

/// The date the charge window containing `now` started on, if `now` is inside one.
pub fn current_window(p: &config::Predictive, now: NaiveDateTime) -> Option<NaiveDate> {
    if !time_slots::slot_active(&window_slot(p), now) {
        return None;
    }
    if now.time() >= p.start_time.0 {
        Some(now.date())
    } else {
        now.date().pred_opt()
    }
}

/// Start of the next charge window after `now`.
pub fn next_window_start(p: &config::Predictive, now: NaiveDateTime) -> Option<NaiveDateTime> {
    (0..=7)
        .filter_map(|offset| now.date().checked_add_signed(Duration::days(offset)))
        .filter(|date| p.days.contains(&date.weekday()))
        .map(|date| date.and_time(p.start_time.0))
        .find(|start| *start > now)
}

#[derive(Clone, Debug, Default)]
struct ForcedCharge {
    target_wh: f64,
    start_wh: f64,
    /// per battery charge power the device has confirmed
    applied: BTreeMap<String, f64>,
    /// every battery a charge write went to, confirmed or not
    tried: BTreeSet<String>,
}

impl ForcedCharge {
    fn own_power(&self) -> f64 {
        self.applied.values().sum()
    }
}

#[derive(Clone, Debug)]
struct Window {
    date: NaiveDate,
    charge: Option<ForcedCharge>,
}

/// Daily predictive grid charging, plus the consumption history it feeds on.
pub struct Scheduler {
    coordinator: Coordinator,
    inputs: Inputs,
    channels: Channels,
    hold: PredictiveHold,
    store: Arc<dyn HistoryStore>,
    history: ConsumptionHistory,
    decision: Option<PredictiveDecision>,
    window: Option<Window>,
    last_capture: Option<NaiveDate>,
}

impl Scheduler {
    pub fn new(
        coordinator: Coordinator,
        inputs: Inputs,
        channels: Channels,
        hold: PredictiveHold,
        store: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            coordinator,
            inputs,
            channels,
            hold,
            store,
            history: ConsumptionHistory::default(),
            decision: None,
            window: None,
            last_capture: None,
        }
    }

    pub fn history(&self) -> &ConsumptionHistory {
        &self.history
    }

    pub fn decision(&self) -> Option<&PredictiveDecision> {
        self.decision.as_ref()
    }

    /// Whether any battery has confirmed a grid charge setpoint.
    pub fn is_charging(&self) -> bool {
        self.window
            .as_ref()
            .and_then(|w| w.charge.as_ref())
            .is_some_and(|c| !c.applied.is_empty())
    }

    /// Load whatever history was kept from earlier runs.
    pub async fn backfill(&mut self) -> Result<()> {
        let stored = self.store.load().await?;
        let days = stored.len();
        self.history.merge(stored);
        info!(
            "consumption history: {} days backfilled, average {:.2} kWh/day",
            days,
            self.history.average()
        );
        Ok(())
    }

    pub async fn start(mut self, mut stop: broadcast::Receiver<()>) -> Result<()> {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(TICK_SECS));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("scheduler starting");

        loop {
            tokio::select! {
                _ = stop.recv() => break,
                _ = interval.tick() => {
                    if self.coordinator.is_shutting_down() {
                        break;
                    }
                    self.tick(Local::now().naive_local()).await;
                }
            }
        }

        info!("scheduler stopped");
        Ok(())
    }

    pub async fn tick(&mut self, now: NaiveDateTime) {
        self.capture_if_due(now).await;

        let Some(p) = self.coordinator.config().predictive().filter(|p| p.enabled()) else {
            return;
        };
        let inputs = self.inputs.current();

        match current_window(&p, now) {
            Some(date) if self.window.as_ref().map(|w| w.date) != Some(date) => {
                self.open_window(&p, date, &inputs).await;
            }
            Some(_) => self.continue_window(&p, &inputs).await,
            None => {
                if self.window.is_some() {
                    self.close_window(&inputs).await;
                }

                let Some(start) = next_window_start(&p, now) else {
                    return;
                };
                if now < start - Duration::minutes(p.lead_minutes as i64) {
                    return;
                }

                let due = match &self.decision {
                    Some(d) if d.date == start.date() => {
                        let soc = predictive::average_soc(&self.energy());
                        if d.average_soc - soc >= predictive::SOC_REEVALUATION_DROP {
                            info!(
                                "SOC fell from {:.0}% to {:.0}% since the decision, re-evaluating",
                                d.average_soc, soc
                            );
                            true
                        } else {
                            false
                        }
                    }
                    _ => true,
                };
                if due {
                    self.evaluate(&p, start.date(), &inputs);
                }
            }
        }
    }

    fn energy(&self) -> Vec<BatteryEnergy> {
        self.coordinator
            .batteries()
            .iter()
            .filter_map(|b| {
                let cfg = self.coordinator.config().battery(b.name())?;
                Some(BatteryEnergy {
                    capacity_kwh: cfg.capacity_kwh(),
                    // unknown SOC counts as empty
                    soc: b.snapshot().soc().unwrap_or(cfg.min_soc()),
                    min_soc: cfg.min_soc(),
                    max_soc: cfg.max_soc(),
                })
            })
            .collect()
    }

    fn evaluate(
        &mut self,
        p: &config::Predictive,
        date: NaiveDate,
        inputs: &InputState,
    ) -> PredictiveDecision {
        let decision = PredictiveDecision::decide(&DecisionInputs {
            date,
            batteries: self.energy(),
            consumption_kwh: self.history.average(),
            solar_forecast_kwh: inputs.solar_forecast_kwh,
            house_load: house_load(inputs, 0.0),
            max_contracted_power: p.max_contracted_power,
            window_hours: window_hours(p),
            override_active: inputs.predictive_override,
        });

        info!("predictive charging decision: {}", decision.summary());
        self.channels
            .notify(Notification::new("Predictive charging", decision.summary()));

        self.decision = Some(decision.clone());
        decision
    }

    async fn open_window(&mut self, p: &config::Predictive, date: NaiveDate, inputs: &InputState) {
        if self.window.is_some() {
            self.close_window(inputs).await;
        }

        let decision = match self.decision.clone() {
            Some(d) if d.date == date => d,
            _ => self.evaluate(p, date, inputs),
        };

        info!("charge window for {} open", date);
        self.window = Some(Window { date, charge: None });

        if inputs.predictive_override {
            info!("override engaged, no grid charging tonight");
            self.channels.notify(Notification::new(
                "Predictive charging",
                "Override engaged, skipping grid charging",
            ));
            return;
        }

        if !decision.charges() {
            info!("nothing to charge, holding batteries for the window");
            self.hold.set_block_discharge(true);
            return;
        }

        let charge = ForcedCharge {
            target_wh: decision.charge_target_wh,
            start_wh: stored_wh(&self.energy()),
            applied: BTreeMap::new(),
            tried: BTreeSet::new(),
        };

        let names: Vec<String> = self.chargeable().into_iter().map(|b| b.name).collect();
        self.hold.hold(names);

        if let Some(w) = self.window.as_mut() {
            w.charge = Some(charge);
        }
        self.drive_charge(p, inputs).await;
    }

    async fn continue_window(&mut self, p: &config::Predictive, inputs: &InputState) {
        let Some((target_wh, start_wh)) = self
            .window
            .as_ref()
            .and_then(|w| w.charge.as_ref())
            .map(|c| (c.target_wh, c.start_wh))
        else {
            return;
        };

        if inputs.predictive_override {
            info!("override engaged, stopping grid charge");
            self.stop_charge().await;
            return;
        }

        let energy = self.energy();
        let charged = stored_wh(&energy) - start_wh;
        let full = energy.iter().all(|b| b.soc >= b.max_soc);

        if charged >= target_wh || full {
            info!(
                "grid charge complete: {:.0} of {:.0} Wh{}",
                charged,
                target_wh,
                if full { ", batteries full" } else { "" }
            );
            self.stop_charge().await;
            return;
        }

        self.drive_charge(p, inputs).await;
    }

    async fn close_window(&mut self, inputs: &InputState) {
        self.stop_charge().await;
        self.hold.release_all();

        if inputs.predictive_override {
            self.inputs.set_predictive_override(false);
        }

        if let Some(w) = self.window.take() {
            info!("charge window for {} closed", w.date);
        }
    }

    fn chargeable(&self) -> Vec<config::Battery> {
        self.coordinator
            .batteries()
            .iter()
            .filter_map(|b| {
                let cfg = self.coordinator.config().battery(b.name())?;
                let below_max = b.snapshot().soc().is_some_and(|s| s < cfg.max_soc());
                (below_max && !cfg.read_only()).then_some(cfg)
            })
            .collect()
    }

    /// Work out the charge power for this moment and send it to any battery that isn't
    /// already at it.
    async fn drive_charge(&mut self, p: &config::Predictive, inputs: &InputState) {
        let batteries: Vec<config::Battery> = self
            .chargeable()
            .into_iter()
            .filter(|b| self.hold.is_held(b.name()))
            .collect();

        let own_power = self
            .window
            .as_ref()
            .and_then(|w| w.charge.as_ref())
            .map_or(0.0, ForcedCharge::own_power);

        let limits: Vec<f64> = batteries.iter().map(|b| b.max_charge_power()).collect();
        let total = predictive::grid_charge_power(
            limits.iter().sum(),
            p.max_contracted_power,
            house_load(inputs, own_power),
        );
        let powers = predictive::distribute(total, &limits);

        let Some(charge) = self.window.as_mut().and_then(|w| w.charge.as_mut()) else {
            return;
        };

        for (battery, power) in batteries.iter().zip(powers) {
            let name = battery.name();
            if charge.applied.get(name) == Some(&power) {
                continue;
            }

            charge.tried.insert(name.to_owned());
            let failure = match self.coordinator.write_atomic(name, &power_writes(-power)).await {
                Ok(outcome) if outcome.is_confirmed() => {
                    info!("{}: grid charging at {}W", name, power);
                    charge.applied.insert(name.to_owned(), power);
                    continue;
                }
                Ok(outcome) => {
                    warn!(
                        "{}: {}W grid charge not confirmed, will retry: {:?}",
                        name, power, outcome.mismatches
                    );
                    format!("{}: {}W charge not confirmed", name, power)
                }
                Err(err) => {
                    error!("{}: forced charge failed: {:#}", name, err);
                    format!("{}: {:#}", name, err)
                }
            };

            charge.applied.remove(name);
            self.channels
                .notify(Notification::new("Predictive charging failed", failure));
        }
    }

    async fn stop_charge(&mut self) {
        let Some(charge) = self.window.as_mut().and_then(|w| w.charge.take()) else {
            return;
        };

        for name in &charge.tried {
            if let Err(err) = self.coordinator.write_atomic(name, &power_writes(0.0)).await {
                warn!("{}: stopping forced charge failed: {:#}", name, err);
            }
        }

        // the control loop picks these up again from a clean state
        self.hold.release_all();
    }

    async fn capture_if_due(&mut self, now: NaiveDateTime) {
        let today = now.date();
        if now.time() < capture_time() || self.last_capture == Some(today) {
            return;
        }
        self.last_capture = Some(today);

        let readings: Vec<f64> = self
            .coordinator
            .batteries()
            .iter()
            .filter_map(|b| b.snapshot().get(register::TOTAL_DAILY_DISCHARGING_ENERGY))
            .collect();
        if readings.is_empty() {
            warn!("no daily discharge readings, consumption for {} not recorded", today);
            return;
        }

        let kwh: f64 = readings.iter().sum();
        if !self.history.record(today, kwh) {
            return;
        }

        info!(
            "consumption for {}: {:.2} kWh, 7 day average {:.2} kWh",
            today,
            kwh,
            self.history.average()
        );
        if let Err(err) = self.store.save(&self.history).await {
            warn!("saving consumption history failed: {:#}", err);
        }
    }
}

fn stored_wh(energy: &[BatteryEnergy]) -> f64 {
    energy
        .iter()
        .map(|b| b.soc / 100.0 * b.capacity_kwh * 1000.0)
        .sum()
}

/// House demand in W. Without a house load reading the grid import stands in, less
/// whatever the batteries are drawing from the grid themselves.
fn house_load(inputs: &InputState, own_charge: f64) -> f64 {
    inputs
        .house_load
        .or(inputs.consumption.map(|c| c - own_charge))
        .filter(|w| w.is_finite())
        .unwrap_or(0.0)
        .max(0.0)
}
