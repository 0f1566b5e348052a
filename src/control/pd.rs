//! Proportional-derivative power controller.
//!
//! Power is signed: positive discharges the battery into the house, negative charges it.
//! The error is the grid reading, positive while importing, so a positive error pushes the
//! batteries towards discharge.

use crate::prelude::*;

use chrono::{DateTime, Local};
use serde::Serialize;

const ROUND_TO_WATTS: f64 = 5.0;
const OSCILLATION_FLIPS: u8 = 3;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PdParams {
    pub kp: f64,
    pub kd: f64,
    pub deadband: f64,
    pub max_change: f64,
    pub direction_hysteresis: f64,
    pub period_secs: f64,
}

impl From<&config::Control> for PdParams {
    fn from(c: &config::Control) -> Self {
        Self {
            kp: c.kp,
            kd: c.kd,
            deadband: c.deadband,
            max_change: c.max_power_change,
            direction_hysteresis: c.direction_hysteresis,
            period_secs: c.interval().as_secs_f64(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Idle,
    Charge,
    Discharge,
}

impl Mode {
    pub fn of(power: f64) -> Self {
        if power > 0.0 {
            Self::Discharge
        } else if power < 0.0 {
            Self::Charge
        } else {
            Self::Idle
        }
    }
}

/// What a battery may do right now, in watts. Zero means the direction is closed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Limits {
    pub max_charge: f64,
    pub max_discharge: f64,
}

impl Limits {
    pub const NONE: Limits = Limits {
        max_charge: 0.0,
        max_discharge: 0.0,
    };

    pub fn clamp(&self, power: f64) -> f64 {
        power.clamp(-self.max_charge, self.max_discharge)
    }

    /// How much this battery could still add in the direction the error asks for.
    fn weight(&self, error: f64, last: f64) -> f64 {
        if error > 0.0 && last < self.max_discharge {
            self.max_discharge
        } else if error < 0.0 && last > -self.max_charge {
            self.max_charge
        } else {
            0.0
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ControlState {
    pub previous_error: f64,
    pub previous_derivative: f64,
    pub mode: Mode,
    pub last_commanded: f64,
    /// power the device last confirmed, None until the first successful write
    pub applied: Option<f64>,
    pub last_applied_at: Option<DateTime<Local>>,
    /// set when max SOC is reached, cleared once SOC drops by the charge hysteresis
    pub charge_latched: bool,
    error_sign: i8,
    sign_flips: u8,
}

impl ControlState {
    /// One PD step on this battery's share of the error, without the deadband check.
    pub fn step(&mut self, p: &PdParams, error: f64, limits: Limits) -> f64 {
        let mut derivative = (error - self.previous_error) / p.period_secs;
        if self.track_oscillation(error) {
            debug!("error keeps changing sign, dropping derivative term");
            derivative = 0.0;
        }

        let raw = p.kp * error + p.kd * derivative;
        let last = self.last_commanded;

        let mut target = last + raw.clamp(-p.max_change, p.max_change);
        target = limits.clamp(target);

        if Mode::of(target) != Mode::of(last)
            && Mode::of(target) != Mode::Idle
            && Mode::of(last) != Mode::Idle
            && target.abs() < p.direction_hysteresis
        {
            target = 0.0;
        }

        target = limits.clamp((target / ROUND_TO_WATTS).round() * ROUND_TO_WATTS);

        self.previous_error = error;
        self.previous_derivative = derivative;
        self.set_commanded(target);

        target
    }

    /// Keep the current command, only tightening it if the limits shrank.
    pub fn hold(&mut self, limits: Limits) -> f64 {
        let target = limits.clamp(self.last_commanded);
        self.set_commanded(target);
        target
    }

    pub fn set_commanded(&mut self, power: f64) {
        self.last_commanded = power;
        self.mode = Mode::of(power);
    }

    pub fn mark_applied(&mut self, power: f64, at: DateTime<Local>) {
        self.applied = Some(power);
        self.last_applied_at = Some(at);
    }

    pub fn needs_write(&self) -> bool {
        self.applied != Some(self.last_commanded)
    }

    /// A write didn't land: step from what the device actually runs at, or from idle
    /// if nothing was ever confirmed.
    pub fn write_failed(&mut self) {
        self.set_commanded(self.applied.unwrap_or(0.0));
    }

    /// Error sat inside the deadband, so earlier sign changes no longer count.
    pub fn settle(&mut self) {
        self.sign_flips = 0;
    }

    fn track_oscillation(&mut self, error: f64) -> bool {
        let sign = if error > 0.0 {
            1
        } else if error < 0.0 {
            -1
        } else {
            0
        };

        if sign != 0 && self.error_sign != 0 && sign != self.error_sign {
            self.sign_flips += 1;
        } else if sign == self.error_sign {
            self.sign_flips = 0;
        }
        if sign != 0 {
            self.error_sign = sign;
        }

        if self.sign_flips >= OSCILLATION_FLIPS {
            self.sign_flips = 0;
            return true;
        }
        false
    }
}

/// Run one control cycle over all participating batteries. The deadband applies to the
/// whole-house error; outside it the error is shared by each battery's available power.
pub fn control_cycle(
    p: &PdParams,
    error: f64,
    batteries: &mut [(&mut ControlState, Limits)],
) -> Vec<f64> {
    if error.abs() < p.deadband {
        return batteries
            .iter_mut()
            .map(|(state, limits)| {
                state.settle();
                state.hold(*limits)
            })
            .collect();
    }

    let weights: Vec<f64> = batteries
        .iter()
        .map(|(state, limits)| limits.weight(error, state.last_commanded))
        .collect();
    let total: f64 = weights.iter().sum();

    batteries
        .iter_mut()
        .zip(weights)
        .map(|((state, limits), weight)| {
            if total <= 0.0 || weight <= 0.0 {
                state.hold(*limits)
            } else {
                state.step(p, error * weight / total, *limits)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> PdParams {
        PdParams {
            kp: 0.5,
            kd: 0.0,
            deadband: 50.0,
            max_change: 300.0,
            direction_hysteresis: 100.0,
            period_secs: 2.0,
        }
    }

    const WIDE: Limits = Limits {
        max_charge: 2500.0,
        max_discharge: 2500.0,
    };

    #[test]
    fn within_deadband_keeps_command() {
        let mut state = ControlState::default();
        state.set_commanded(300.0);

        let out = control_cycle(&params(), 30.0, &mut [(&mut state, WIDE)]);
        assert_eq!(out, vec![300.0]);
        assert_eq!(state.last_commanded, 300.0);
        assert_eq!(state.previous_error, 0.0);
    }

    #[test]
    fn import_moves_towards_discharge() {
        let mut state = ControlState::default();
        let out = control_cycle(&params(), 500.0, &mut [(&mut state, WIDE)]);
        assert_eq!(out, vec![250.0]);
        assert_eq!(state.mode, Mode::Discharge);
        assert_eq!(state.previous_error, 500.0);
    }

    #[test]
    fn change_per_cycle_is_rate_limited() {
        let mut state = ControlState::default();
        let out = control_cycle(&params(), 2000.0, &mut [(&mut state, WIDE)]);
        assert_eq!(out, vec![300.0]);
    }

    #[test]
    fn derivative_term_uses_period() {
        let p = PdParams {
            kd: 1.0,
            ..params()
        };
        let mut state = ControlState::default();
        state.previous_error = 100.0;

        // 0.5 * 300 + 1.0 * (300 - 100) / 2 = 250
        assert_eq!(state.step(&p, 300.0, WIDE), 250.0);
    }

    #[test]
    fn never_exceeds_limits() {
        let mut state = ControlState::default();
        state.set_commanded(2400.0);
        let limits = Limits {
            max_charge: 2500.0,
            max_discharge: 2500.0,
        };
        assert_eq!(state.step(&params(), 1000.0, limits), 2500.0);

        let empty = Limits {
            max_charge: 2500.0,
            max_discharge: 0.0,
        };
        assert_eq!(state.step(&params(), 1000.0, empty), 0.0);
    }

    #[test]
    fn small_reversal_goes_idle_instead_of_flipping() {
        let p = PdParams {
            kp: 1.0,
            ..params()
        };
        let mut state = ControlState::default();
        state.set_commanded(20.0);

        // 20 - 30 = -10: would start charging, but 10W is inside the hysteresis
        assert_eq!(state.step(&p, -30.0, WIDE), 0.0);
        assert_eq!(state.mode, Mode::Idle);
    }

    #[test]
    fn large_reversal_flips() {
        let p = PdParams {
            kp: 1.0,
            ..params()
        };
        let mut state = ControlState::default();
        state.set_commanded(20.0);

        assert_eq!(state.step(&p, -250.0, WIDE), -230.0);
        assert_eq!(state.mode, Mode::Charge);
    }

    #[test]
    fn error_shared_by_available_power() {
        let mut a = ControlState::default();
        let mut b = ControlState::default();
        let small = Limits {
            max_charge: 800.0,
            max_discharge: 800.0,
        };
        let big = Limits {
            max_charge: 2400.0,
            max_discharge: 2400.0,
        };

        let out = control_cycle(&params(), 400.0, &mut [(&mut a, small), (&mut b, big)]);
        assert_eq!(out, vec![50.0, 150.0]);
    }

    #[test]
    fn exhausted_battery_takes_no_share() {
        let mut a = ControlState::default();
        let mut b = ControlState::default();
        let out = control_cycle(
            &params(),
            400.0,
            &mut [(&mut a, Limits { max_charge: 2500.0, max_discharge: 0.0 }), (&mut b, WIDE)],
        );
        assert_eq!(out, vec![0.0, 200.0]);
    }

    #[test]
    fn oscillation_drops_derivative() {
        let p = PdParams {
            kp: 0.0,
            kd: 1.0,
            direction_hysteresis: 0.0,
            max_change: 10_000.0,
            ..params()
        };
        let mut state = ControlState::default();
        state.step(&p, 100.0, WIDE);
        state.step(&p, -100.0, WIDE);
        state.step(&p, 100.0, WIDE);
        let before = state.last_commanded;

        // third flip in a row: derivative ignored, kp is zero, so nothing moves
        assert_eq!(state.step(&p, -100.0, WIDE), before);
    }

    #[test]
    fn deadband_clears_oscillation_count() {
        let p = PdParams {
            kp: 0.0,
            kd: 1.0,
            direction_hysteresis: 0.0,
            max_change: 10_000.0,
            ..params()
        };
        let mut state = ControlState::default();
        state.step(&p, 100.0, WIDE);
        state.step(&p, -100.0, WIDE);
        assert_eq!(state.step(&p, 100.0, WIDE), 50.0);

        control_cycle(&p, 10.0, &mut [(&mut state, WIDE)]);
        assert_eq!(state.last_commanded, 50.0);

        // only one flip since settling, so the derivative still acts: (-100 - 100) / 2
        assert_eq!(state.step(&p, -100.0, WIDE), -50.0);
    }

    #[test]
    fn failed_write_steps_from_applied_power() {
        let mut state = ControlState::default();

        for _ in 0..4 {
            assert_eq!(state.step(&params(), 2000.0, WIDE), 300.0);
            state.write_failed();
            assert_eq!(state.last_commanded, 0.0);
            assert_eq!(state.mode, Mode::Idle);
        }

        state.mark_applied(300.0, Local::now());
        state.set_commanded(300.0);
        state.step(&params(), 2000.0, WIDE);
        state.write_failed();
        assert_eq!(state.last_commanded, 300.0);
        assert_eq!(state.step(&params(), 2000.0, WIDE), 600.0);
    }

    #[test]
    fn needs_write_until_applied() {
        let mut state = ControlState::default();
        state.set_commanded(0.0);
        assert!(state.needs_write());
        state.mark_applied(0.0, Local::now());
        assert!(!state.needs_write());
        state.set_commanded(100.0);
        assert!(state.needs_write());
    }
}
