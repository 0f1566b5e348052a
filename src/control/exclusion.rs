use crate::prelude::*;

use std::collections::HashMap;

/// Masks the power of selected devices out of the consumption signal, so the batteries
/// neither feed them nor hold back because of them.
#[derive(Clone, Debug, Default)]
pub struct LoadExclusionFilter {
    rules: Vec<config::Exclusion>,
}

impl LoadExclusionFilter {
    pub fn new(rules: Vec<config::Exclusion>) -> Self {
        Self { rules }
    }

    /// Net watts to take off the measured consumption. A device whose draw is already in
    /// the meter reading is removed; one that isn't is added back.
    pub fn adjustment(&self, devices: &HashMap<String, f64>) -> f64 {
        self.rules
            .iter()
            .filter_map(|rule| {
                let power = devices.get(&rule.device).copied().filter(|p| p.is_finite());
                if power.is_none() {
                    trace!("no power reading for excluded device {}", rule.device);
                }
                power.map(|p| if rule.included_in_consumption { p } else { -p })
            })
            .sum()
    }

    pub fn apply(&self, consumption: f64, devices: &HashMap<String, f64>) -> f64 {
        consumption - self.adjustment(devices)
    }
}

/// Short moving average over the consumption readings.
#[derive(Clone, Debug)]
pub struct SensorFilter {
    size: usize,
    samples: std::collections::VecDeque<f64>,
}

impl SensorFilter {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            samples: std::collections::VecDeque::with_capacity(size.max(1)),
        }
    }

    pub fn push(&mut self, value: f64) -> f64 {
        if self.samples.len() == self.size {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}
