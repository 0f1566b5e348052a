use crate::prelude::*;

pub mod exclusion;
pub mod pd;
pub mod time_slots;
pub mod weekly;

use crate::coordinator::Coordinator;
use crate::inputs::Inputs;
use crate::predictive::PredictiveHold;
use crate::register::{self, ForceMode};
use exclusion::{LoadExclusionFilter, SensorFilter};
use pd::{ControlState, Limits, PdParams};
use time_slots::Restriction;

use chrono::{DateTime, Local, NaiveDate};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::time::MissedTickBehavior;

const SENSOR_SAMPLES: usize = 2;

/// Register writes that put a battery at `power` watts, positive discharging.
pub fn power_writes(power: f64) -> BTreeMap<String, f64> {
    let (charge, discharge, mode) = if power > 0.0 {
        (0.0, power, ForceMode::Discharge)
    } else if power < 0.0 {
        (-power, 0.0, ForceMode::Charge)
    } else {
        (0.0, 0.0, ForceMode::Stop)
    };

    BTreeMap::from([
        (register::SET_CHARGE_POWER.to_owned(), charge),
        (register::SET_DISCHARGE_POWER.to_owned(), discharge),
        (register::FORCE_MODE.to_owned(), u16::from(mode) as f64),
    ])
}

/// Work out what one battery may do this cycle. Also maintains its charge latch.
pub fn battery_limits(
    battery: &config::Battery,
    soc: Option<f64>,
    state: &mut ControlState,
    restriction: Restriction,
    full_charge_day: bool,
    discharge_blocked: bool,
) -> Limits {
    let Some(soc) = soc else {
        return Limits::NONE;
    };

    let max_soc = if full_charge_day { 100.0 } else { battery.max_soc() };

    if soc >= max_soc {
        if !state.charge_latched {
            debug!("{}: reached {}% SOC, charging paused", battery.name(), max_soc);
        }
        state.charge_latched = true;
    } else if full_charge_day {
        state.charge_latched = false;
    } else {
        let resume_at = max_soc - battery.charge_hysteresis_percent().unwrap_or(0.0);
        if soc <= resume_at {
            state.charge_latched = false;
        }
    }

    let mut limits = Limits {
        max_charge: battery.max_charge_power(),
        max_discharge: battery.max_discharge_power(),
    };

    if state.charge_latched || (restriction.no_charge && !full_charge_day) {
        limits.max_charge = 0.0;
    }
    if soc <= battery.min_soc() || restriction.no_discharge || discharge_blocked {
        limits.max_discharge = 0.0;
    }

    limits
}

pub struct ControlLoop {
    coordinator: Coordinator,
    inputs: Inputs,
    hold: PredictiveHold,
    states: HashMap<String, ControlState>,
    filter: SensorFilter,
    weekly: Option<weekly::WeeklyFullCharge>,
    /// v2 batteries whose charging cutoff is currently raised to 100%
    raised_cutoffs: HashSet<String>,
}

impl ControlLoop {
    pub fn new(coordinator: Coordinator, inputs: Inputs, hold: PredictiveHold) -> Self {
        Self {
            coordinator,
            inputs,
            hold,
            states: HashMap::new(),
            filter: SensorFilter::new(SENSOR_SAMPLES),
            weekly: None,
            raised_cutoffs: HashSet::new(),
        }
    }

    pub fn state(&self, battery: &str) -> Option<&ControlState> {
        self.states.get(battery)
    }

    pub async fn start(mut self, mut stop: broadcast::Receiver<()>) -> Result<()> {
        let period = self.coordinator.config().control().interval();
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("control loop starting, every {:?}", period);

        loop {
            tokio::select! {
                _ = stop.recv() => break,
                _ = interval.tick() => {
                    if let Err(err) = self.run_cycle(Local::now()).await {
                        error!("control cycle failed: {:#}", err);
                    }
                }
            }
        }

        info!("control loop stopped");
        Ok(())
    }

    pub async fn run_cycle(&mut self, now: DateTime<Local>) -> Result<()> {
        if self.coordinator.is_shutting_down() {
            return Ok(());
        }

        let control = self.coordinator.config().control();
        if !control.enabled() {
            return Ok(());
        }

        let inputs = self.inputs.current();
        if inputs.manual_mode {
            debug!("manual mode, control cycle skipped");
            return Ok(());
        }

        let full_charge_day = self.update_weekly(now.date_naive()).await;

        let Some(consumption) = inputs.consumption.filter(|c| c.is_finite()) else {
            debug!("no consumption reading yet");
            return Ok(());
        };

        let smoothed = self.filter.push(consumption);
        let error =
            LoadExclusionFilter::new(control.exclusions.clone()).apply(smoothed, &inputs.devices);

        let restriction = time_slots::restriction(&control.time_slots, now.naive_local());
        if restriction.any() {
            trace!("time slot active: {:?}", restriction);
        }
        let discharge_blocked = self.hold.discharge_blocked();

        let mut participants = Vec::new();
        for battery in self.coordinator.batteries() {
            let name = battery.name();

            if self.hold.is_held(name) {
                // predictive charging owns it; start over once it's handed back
                self.states.insert(name.to_owned(), ControlState::default());
                continue;
            }

            let Some(cfg) = self.coordinator.config().battery(name) else {
                continue;
            };

            let mut state = self.states.remove(name).unwrap_or_default();
            let limits = battery_limits(
                &cfg,
                battery.snapshot().soc(),
                &mut state,
                restriction,
                full_charge_day,
                discharge_blocked,
            );
            participants.push((cfg, state, limits));
        }

        let params = PdParams::from(&control);
        let targets = {
            let mut shares: Vec<(&mut ControlState, Limits)> = participants
                .iter_mut()
                .map(|(_, state, limits)| (state, *limits))
                .collect();
            pd::control_cycle(&params, error, &mut shares)
        };

        debug!("error {:.0}W -> targets {:?}", error, targets);

        for ((cfg, mut state, _), target) in participants.into_iter().zip(targets) {
            if state.needs_write() {
                self.apply(&cfg, &mut state, target, now).await;
            }
            self.states.insert(cfg.name().to_owned(), state);
        }

        Ok(())
    }

    async fn apply(
        &self,
        cfg: &config::Battery,
        state: &mut ControlState,
        power: f64,
        now: DateTime<Local>,
    ) {
        let name = cfg.name();
        if cfg.read_only() {
            debug!("{}: read-only, not applying {}W", name, power);
            return;
        }

        match self.coordinator.write_atomic(name, &power_writes(power)).await {
            Ok(outcome) if outcome.is_confirmed() => {
                info!("{}: now at {}W ({:?})", name, power, state.mode);
                state.mark_applied(power, now);
            }
            Ok(outcome) => {
                warn!("{}: {}W not confirmed, will retry: {:?}", name, power, outcome.mismatches);
                state.write_failed();
            }
            Err(err) => {
                error!("{}: applying {}W failed: {:#}", name, power, err);
                state.write_failed();
            }
        }
    }

    /// Whether today is the weekly full charge day and it hasn't finished yet. v2
    /// batteries enforce their own cutoff, so it gets raised for the day.
    async fn update_weekly(&mut self, today: NaiveDate) -> bool {
        let active = match self.coordinator.config().weekly_full_charge() {
            Some(w) if w.enabled() => {
                let socs: Vec<Option<f64>> = self
                    .coordinator
                    .batteries()
                    .iter()
                    .map(|b| b.snapshot().soc())
                    .collect();
                if self.weekly.as_ref().map(|x| x.day()) != Some(w.day) {
                    self.weekly = Some(weekly::WeeklyFullCharge::new(w.day));
                }
                self.weekly
                    .get_or_insert_with(|| weekly::WeeklyFullCharge::new(w.day))
                    .update(today, &socs)
            }
            _ => false,
        };

        for battery in self.coordinator.batteries() {
            if !battery.version().has_cutoff_registers() {
                continue;
            }
            let name = battery.name();
            let Some(cfg) = self.coordinator.config().battery(name) else {
                continue;
            };
            if cfg.read_only() || active == self.raised_cutoffs.contains(name) {
                continue;
            }

            let cutoff = if active { 100.0 } else { cfg.max_soc() };
            let writes = BTreeMap::from([(register::CHARGING_CUTOFF_CAPACITY.to_owned(), cutoff)]);

            match self.coordinator.write_atomic(name, &writes).await {
                Ok(_) if active => {
                    info!("{}: weekly full charge, charging cutoff raised to 100%", name);
                    self.raised_cutoffs.insert(name.to_owned());
                }
                Ok(_) => {
                    info!("{}: charging cutoff restored to {}%", name, cutoff);
                    self.raised_cutoffs.remove(name);
                }
                Err(err) => warn!(
                    "{}: setting charging cutoff to {}% failed: {:#}",
                    name, cutoff, err
                ),
            }
        }

        active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn battery() -> config::Battery {
        serde_yaml::from_str(
            "name: b1\nhost: 10.0.0.5\nversion: v3\nmin_soc: 15\nmax_soc: 90\ncharge_hysteresis_percent: 5\n",
        )
        .unwrap()
    }

    const OPEN: Restriction = Restriction {
        no_discharge: false,
        no_charge: false,
    };

    #[test]
    fn unknown_soc_means_no_power() {
        let mut state = ControlState::default();
        assert_eq!(battery_limits(&battery(), None, &mut state, OPEN, false, false), Limits::NONE);
    }

    #[test]
    fn soc_bounds_close_directions() {
        let b = battery();
        let mut state = ControlState::default();

        let low = battery_limits(&b, Some(15.0), &mut state, OPEN, false, false);
        assert_eq!(low.max_discharge, 0.0);
        assert_eq!(low.max_charge, 2500.0);

        let full = battery_limits(&b, Some(90.0), &mut state, OPEN, false, false);
        assert_eq!(full.max_charge, 0.0);
        assert_eq!(full.max_discharge, 2500.0);
    }

    #[test]
    fn charge_latch_waits_for_hysteresis() {
        let b = battery();
        let mut state = ControlState::default();

        battery_limits(&b, Some(90.0), &mut state, OPEN, false, false);
        assert!(state.charge_latched);

        let l = battery_limits(&b, Some(87.0), &mut state, OPEN, false, false);
        assert_eq!(l.max_charge, 0.0);

        let l = battery_limits(&b, Some(85.0), &mut state, OPEN, false, false);
        assert_eq!(l.max_charge, 2500.0);
        assert!(!state.charge_latched);
    }

    #[test]
    fn time_slot_and_weekly_override() {
        let b = battery();
        let mut state = ControlState::default();
        let both = Restriction {
            no_discharge: true,
            no_charge: true,
        };

        assert_eq!(battery_limits(&b, Some(50.0), &mut state, both, false, false), Limits::NONE);

        // full charge day: charging allowed past max_soc and through the slot
        let l = battery_limits(&b, Some(95.0), &mut state, both, true, false);
        assert_eq!(l.max_charge, 2500.0);
        assert_eq!(l.max_discharge, 0.0);
    }

    #[test]
    fn predictive_window_blocks_discharge() {
        let mut state = ControlState::default();
        let l = battery_limits(&battery(), Some(50.0), &mut state, OPEN, false, true);
        assert_eq!(l.max_discharge, 0.0);
        assert_eq!(l.max_charge, 2500.0);
    }

    #[test]
    fn writes_for_each_direction() {
        let w = power_writes(250.0);
        assert_eq!(w[register::SET_DISCHARGE_POWER], 250.0);
        assert_eq!(w[register::SET_CHARGE_POWER], 0.0);
        assert_eq!(w[register::FORCE_MODE], 2.0);

        let w = power_writes(-400.0);
        assert_eq!(w[register::SET_CHARGE_POWER], 400.0);
        assert_eq!(w[register::FORCE_MODE], 1.0);

        assert_eq!(power_writes(0.0)[register::FORCE_MODE], 0.0);
    }
}
