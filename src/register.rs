use crate::prelude::*;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// logical register names shared by every firmware version
pub const RS485_CONTROL: &str = "rs485_control";
pub const FORCE_MODE: &str = "force_mode";
pub const CHARGE_TO_SOC: &str = "charge_to_soc";
pub const SET_CHARGE_POWER: &str = "set_charge_power";
pub const SET_DISCHARGE_POWER: &str = "set_discharge_power";
pub const MAX_CHARGE_POWER: &str = "max_charge_power";
pub const MAX_DISCHARGE_POWER: &str = "max_discharge_power";
pub const BATTERY_SOC: &str = "battery_soc";
pub const BATTERY_POWER: &str = "battery_power";
pub const BATTERY_TOTAL_ENERGY: &str = "battery_total_energy";
pub const TOTAL_CHARGING_ENERGY: &str = "total_charging_energy";
pub const TOTAL_DISCHARGING_ENERGY: &str = "total_discharging_energy";
pub const TOTAL_DAILY_DISCHARGING_ENERGY: &str = "total_daily_discharging_energy";
pub const CHARGING_CUTOFF_CAPACITY: &str = "charging_cutoff_capacity";
pub const DISCHARGING_CUTOFF_CAPACITY: &str = "discharging_cutoff_capacity";
pub const USER_WORK_MODE: &str = "user_work_mode";

pub const RS485_ENABLE: u16 = 0x55AA;
pub const RS485_DISABLE: u16 = 0x55BB;

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum ForceMode {
    Stop = 0,
    Charge = 1,
    Discharge = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum WorkMode {
    Manual = 0,
    AntiFeed = 1,
    TradeMode = 2,
}

// BatteryVersion {{{
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryVersion {
    V2,
    V3,
}

impl BatteryVersion {
    pub fn register_map(&self) -> &'static RegisterMap {
        match self {
            Self::V2 => &V2_MAP,
            Self::V3 => &V3_MAP,
        }
    }

    /// Minimum gap the device needs between two consecutive exchanges.
    pub fn message_wait(&self) -> Duration {
        match self {
            Self::V2 => Duration::from_millis(50),
            Self::V3 => Duration::from_millis(150),
        }
    }

    /// v3 firmware sends exception responses with an MBAP length of 4 instead of 3.
    pub fn repairs_exception_length(&self) -> bool {
        matches!(self, Self::V3)
    }

    /// v2 has hardware SOC cutoff registers, v3 relies on the controller alone.
    pub fn has_cutoff_registers(&self) -> bool {
        matches!(self, Self::V2)
    }
}

impl std::fmt::Display for BatteryVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::V2 => write!(f, "v2"),
            Self::V3 => write!(f, "v3"),
        }
    }
} // }}}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterKind {
    Signed16,
    Unsigned16,
    Signed32,
    Unsigned32,
    Bitfield { words: u8 },
}

impl RegisterKind {
    pub const fn words(&self) -> u16 {
        match self {
            Self::Signed16 | Self::Unsigned16 => 1,
            Self::Signed32 | Self::Unsigned32 => 2,
            Self::Bitfield { words } => *words as u16,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn readable(&self) -> bool {
        !matches!(self, Self::Write)
    }

    pub fn writable(&self) -> bool {
        !matches!(self, Self::Read)
    }
}

/// How often a register is refreshed, in poll cycles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanTier {
    High,
    Medium,
    Low,
    VeryLow,
}

impl ScanTier {
    pub fn every(&self) -> u64 {
        match self {
            Self::High => 1,
            Self::Medium => 3,
            Self::Low => 20,
            Self::VeryLow => 200,
        }
    }

    pub fn due(&self, cycle: u64) -> bool {
        cycle % self.every() == 0
    }
}

/// Rational scale, decoded value = raw * num / den
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Scale {
    pub num: i32,
    pub den: i32,
}

impl Scale {
    pub const ONE: Scale = Scale { num: 1, den: 1 };
    pub const TENTH: Scale = Scale { num: 1, den: 10 };
    pub const HUNDREDTH: Scale = Scale { num: 1, den: 100 };
    pub const THOUSANDTH: Scale = Scale { num: 1, den: 1000 };

    pub fn apply(&self, raw: i64) -> f64 {
        raw as f64 * self.num as f64 / self.den as f64
    }

    pub fn unapply(&self, value: f64) -> i64 {
        (value * self.den as f64 / self.num as f64).round() as i64
    }

    pub fn step(&self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

// RegisterDescriptor {{{
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterDescriptor {
    pub name: &'static str,
    pub address: u16,
    pub kind: RegisterKind,
    pub scale: Scale,
    pub access: Access,
    pub tier: ScanTier,
}

impl RegisterDescriptor {
    const fn new(
        name: &'static str,
        address: u16,
        kind: RegisterKind,
        scale: Scale,
        access: Access,
        tier: ScanTier,
    ) -> Self {
        Self {
            name,
            address,
            kind,
            scale,
            access,
            tier,
        }
    }

    pub fn length(&self) -> u16 {
        self.kind.words()
    }

    /// Decode raw register words (high word first) into a scaled value.
    pub fn decode(&self, words: &[u16]) -> Result<f64, FrameError> {
        if words.len() != self.length() as usize {
            return Err(FrameError::new(format!(
                "{} needs {} registers, got {}",
                self.name,
                self.length(),
                words.len()
            )));
        }

        let raw: i64 = match self.kind {
            RegisterKind::Signed16 => words[0] as i16 as i64,
            RegisterKind::Unsigned16 => words[0] as i64,
            RegisterKind::Signed32 => (((words[0] as u32) << 16) | words[1] as u32) as i32 as i64,
            RegisterKind::Unsigned32 => (((words[0] as u32) << 16) | words[1] as u32) as i64,
            RegisterKind::Bitfield { .. } => words
                .iter()
                .fold(0u64, |acc, w| (acc << 16) | *w as u64) as i64,
        };

        Ok(self.scale.apply(raw))
    }

    /// Encode a scaled value into register words, refusing values the kind can't hold.
    pub fn encode(&self, value: f64) -> Result<Vec<u16>, RegisterError> {
        let raw = self.scale.unapply(value);
        let out_of_range = || RegisterError::OutOfRange {
            name: self.name.to_owned(),
            value,
        };

        let words = match self.kind {
            RegisterKind::Signed16 => {
                let v = i16::try_from(raw).map_err(|_| out_of_range())?;
                vec![v as u16]
            }
            RegisterKind::Unsigned16 | RegisterKind::Bitfield { words: 1 } => {
                vec![u16::try_from(raw).map_err(|_| out_of_range())?]
            }
            RegisterKind::Signed32 => {
                let v = i32::try_from(raw).map_err(|_| out_of_range())? as u32;
                vec![(v >> 16) as u16, v as u16]
            }
            RegisterKind::Unsigned32 | RegisterKind::Bitfield { .. } => {
                let v = u32::try_from(raw).map_err(|_| out_of_range())?;
                vec![(v >> 16) as u16, v as u16]
            }
        };

        Ok(words)
    }

    /// Two values are the same register state if they differ by less than half a scale step.
    pub fn matches(&self, wanted: f64, actual: f64) -> bool {
        (wanted - actual).abs() < self.scale.step() / 2.0
    }
} // }}}

// RegisterMap {{{
#[derive(Debug)]
pub struct RegisterMap {
    pub version: BatteryVersion,
    registers: &'static [RegisterDescriptor],
}

impl RegisterMap {
    pub fn get(&self, name: &str) -> Result<&'static RegisterDescriptor, RegisterError> {
        self.registers
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| RegisterError::Unsupported {
                name: name.to_owned(),
                version: self.version.to_string(),
            })
    }

    pub fn supports(&self, name: &str) -> bool {
        self.get(name).is_ok()
    }

    pub fn all(&self) -> impl Iterator<Item = &'static RegisterDescriptor> {
        self.registers.iter()
    }

    /// Registers the poller should read on the given cycle.
    pub fn due(&self, cycle: u64) -> impl Iterator<Item = &'static RegisterDescriptor> {
        self.registers
            .iter()
            .filter(move |r| r.access.readable() && r.tier.due(cycle))
    }
} // }}}

use Access::*;
use RegisterKind::*;
use ScanTier::*;

type D = RegisterDescriptor;

static V2_REGISTERS: [RegisterDescriptor; 27] = [
    D::new(RS485_CONTROL, 42000, Unsigned16, Scale::ONE, ReadWrite, VeryLow),
    D::new(FORCE_MODE, 42010, Unsigned16, Scale::ONE, ReadWrite, High),
    D::new(CHARGE_TO_SOC, 42011, Unsigned16, Scale::ONE, ReadWrite, Low),
    D::new(SET_CHARGE_POWER, 42020, Unsigned16, Scale::ONE, ReadWrite, High),
    D::new(SET_DISCHARGE_POWER, 42021, Unsigned16, Scale::ONE, ReadWrite, High),
    D::new(MAX_CHARGE_POWER, 44002, Unsigned16, Scale::ONE, ReadWrite, Low),
    D::new(MAX_DISCHARGE_POWER, 44003, Unsigned16, Scale::ONE, ReadWrite, Low),
    D::new(CHARGING_CUTOFF_CAPACITY, 44000, Unsigned16, Scale::TENTH, ReadWrite, Low),
    D::new(DISCHARGING_CUTOFF_CAPACITY, 44001, Unsigned16, Scale::TENTH, ReadWrite, Low),
    D::new(BATTERY_SOC, 32104, Unsigned16, Scale::ONE, Read, High),
    D::new(BATTERY_POWER, 32102, Signed32, Scale::ONE, Read, High),
    D::new("ac_power", 32202, Signed32, Scale::ONE, Read, High),
    D::new("ac_offgrid_power", 32302, Signed32, Scale::ONE, Read, Medium),
    D::new("battery_voltage", 32100, Unsigned16, Scale::HUNDREDTH, Read, Medium),
    D::new(BATTERY_TOTAL_ENERGY, 32105, Unsigned16, Scale::THOUSANDTH, Read, Low),
    D::new("max_cell_voltage", 37007, Signed16, Scale::THOUSANDTH, Read, Medium),
    D::new("min_cell_voltage", 37008, Signed16, Scale::THOUSANDTH, Read, Medium),
    D::new("internal_temperature", 35000, Signed16, Scale::TENTH, Read, Medium),
    D::new("inverter_state", 35100, Unsigned16, Scale::ONE, Read, High),
    D::new(TOTAL_CHARGING_ENERGY, 33000, Unsigned32, Scale::HUNDREDTH, Read, VeryLow),
    D::new(TOTAL_DISCHARGING_ENERGY, 33002, Signed32, Scale::HUNDREDTH, Read, VeryLow),
    D::new("total_daily_charging_energy", 33004, Unsigned32, Scale::HUNDREDTH, Read, Low),
    D::new(TOTAL_DAILY_DISCHARGING_ENERGY, 33006, Signed32, Scale::HUNDREDTH, Read, Low),
    D::new("alarm_status", 36000, Bitfield { words: 2 }, Scale::ONE, Read, Low),
    D::new("fault_status", 36100, Bitfield { words: 2 }, Scale::ONE, Read, Low),
    D::new("backup_function", 41200, Unsigned16, Scale::ONE, ReadWrite, Low),
    D::new("reset_device", 41000, Unsigned16, Scale::ONE, Write, Low),
];

static V3_REGISTERS: [RegisterDescriptor; 21] = [
    D::new(RS485_CONTROL, 42000, Unsigned16, Scale::ONE, ReadWrite, VeryLow),
    D::new(FORCE_MODE, 42010, Unsigned16, Scale::ONE, ReadWrite, High),
    D::new(CHARGE_TO_SOC, 42011, Unsigned16, Scale::ONE, ReadWrite, Low),
    D::new(SET_CHARGE_POWER, 42020, Unsigned16, Scale::ONE, ReadWrite, High),
    D::new(SET_DISCHARGE_POWER, 42021, Unsigned16, Scale::ONE, ReadWrite, High),
    D::new(MAX_CHARGE_POWER, 44002, Unsigned16, Scale::ONE, ReadWrite, Low),
    D::new(MAX_DISCHARGE_POWER, 44003, Unsigned16, Scale::ONE, ReadWrite, Low),
    D::new(USER_WORK_MODE, 43000, Unsigned16, Scale::ONE, ReadWrite, Low),
    D::new(BATTERY_SOC, 37005, Unsigned16, Scale::ONE, Read, High),
    D::new(BATTERY_POWER, 30001, Signed16, Scale::ONE, Read, High),
    D::new("ac_power", 30006, Signed16, Scale::ONE, Read, High),
    D::new("battery_voltage", 30100, Unsigned16, Scale::HUNDREDTH, Read, Medium),
    D::new(BATTERY_TOTAL_ENERGY, 32105, Unsigned16, Scale::THOUSANDTH, Read, Low),
    D::new("internal_temperature", 35000, Signed16, Scale::TENTH, Read, Medium),
    D::new("inverter_state", 35100, Unsigned16, Scale::ONE, Read, High),
    D::new(TOTAL_CHARGING_ENERGY, 33000, Unsigned32, Scale::HUNDREDTH, Read, VeryLow),
    D::new(TOTAL_DISCHARGING_ENERGY, 33002, Signed32, Scale::HUNDREDTH, Read, VeryLow),
    D::new("total_daily_charging_energy", 33004, Unsigned32, Scale::HUNDREDTH, Read, Low),
    D::new(TOTAL_DAILY_DISCHARGING_ENERGY, 33006, Signed32, Scale::HUNDREDTH, Read, Low),
    D::new("backup_function", 41200, Unsigned16, Scale::ONE, ReadWrite, Low),
    D::new("reset_device", 41000, Unsigned16, Scale::ONE, Write, Low),
];

static V2_MAP: RegisterMap = RegisterMap {
    version: BatteryVersion::V2,
    registers: &V2_REGISTERS,
};

static V3_MAP: RegisterMap = RegisterMap {
    version: BatteryVersion::V3,
    registers: &V3_REGISTERS,
};
