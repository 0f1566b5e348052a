use crate::prelude::*;

use crate::config::{BatteryLimits, ControlUpdate};

/// Something asked of the engine from outside, decoded from an MQTT topic and payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Consumption(f64),
    SolarForecast(Option<f64>),
    HouseLoad(f64),
    DevicePower(String, f64),
    ManualMode(bool),
    PredictiveOverride(bool),
    ReadRegister { battery: String, register: String },
    WriteRegister { battery: String, register: String, value: f64 },
    SetControl(ControlUpdate),
    SetBatteryLimits { battery: String, limits: BatteryLimits },
}

impl Command {
    /// Where the outcome of a battery command gets published. Inputs have no result.
    pub fn to_result_topic(&self) -> Option<String> {
        use Command::*;

        let rest = match self {
            ReadRegister { battery, register } => format!("{}/read/{}", battery, register),
            WriteRegister { battery, register, .. } => format!("{}/write/{}", battery, register),
            SetControl(_) => "config/control".to_owned(),
            SetBatteryLimits { battery, .. } => format!("config/{}/limits", battery),
            _ => return None,
        };

        Some(format!("result/{}", rest))
    }
}
