use crate::prelude::*;

use chrono::{NaiveTime, Weekday};
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use std::sync::{Arc, Mutex, MutexGuard};

pub const MAX_TIME_SLOTS: usize = 4;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub batteries: Vec<Battery>,

    #[serde(default = "Config::default_control")]
    pub control: Control,

    pub predictive: Option<Predictive>,
    pub weekly_full_charge: Option<WeeklyFullCharge>,

    #[serde(default = "Config::default_mqtt")]
    pub mqtt: Mqtt,

    #[serde(default = "Config::default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

// ClockTime {{{
/// Wall clock time written as HH:MM.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClockTime(pub NaiveTime);

impl FromStr for ClockTime {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        NaiveTime::parse_from_str(s, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
            .map(Self)
            .map_err(|err| anyhow!("badly formatted time {:?}, use HH:MM: {}", s, err))
    }
}

impl std::fmt::Display for ClockTime {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%H:%M"))
    }
} // }}}

// Battery {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Battery {
    pub name: String,
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub host: String,
    #[serde(default = "Config::default_port")]
    pub port: u16,
    pub unit_id: Option<u8>,
    pub version: BatteryVersion,

    #[serde(default = "Config::default_max_power")]
    pub max_charge_power: u16,
    #[serde(default = "Config::default_max_power")]
    pub max_discharge_power: u16,
    #[serde(default = "Config::default_min_soc")]
    pub min_soc: u8,
    #[serde(default = "Config::default_max_soc")]
    pub max_soc: u8,
    #[serde(default = "Config::default_capacity_kwh")]
    pub capacity_kwh: f64,
    /// once max_soc is reached, don't charge again until SOC falls this far below it
    pub charge_hysteresis_percent: Option<u8>,

    pub read_only: Option<bool>,
    pub response_timeout_ms: Option<u64>,
    pub attempts: Option<u32>,
    pub tcp_nodelay: Option<bool>,
}

impl Battery {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id.unwrap_or(1)
    }

    pub fn version(&self) -> BatteryVersion {
        self.version
    }

    pub fn max_charge_power(&self) -> f64 {
        self.max_charge_power as f64
    }

    pub fn max_discharge_power(&self) -> f64 {
        self.max_discharge_power as f64
    }

    pub fn min_soc(&self) -> f64 {
        self.min_soc as f64
    }

    pub fn max_soc(&self) -> f64 {
        self.max_soc as f64
    }

    pub fn capacity_kwh(&self) -> f64 {
        self.capacity_kwh
    }

    pub fn charge_hysteresis_percent(&self) -> Option<f64> {
        self.charge_hysteresis_percent.map(f64::from)
    }

    pub fn read_only(&self) -> bool {
        self.read_only == Some(true)
    }

    pub fn response_timeout_ms(&self) -> u64 {
        self.response_timeout_ms.unwrap_or(3000)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.unwrap_or(3)
    }

    pub fn tcp_nodelay(&self) -> bool {
        self.tcp_nodelay.unwrap_or(true)
    }
} // }}}

// TimeSlot {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TimeSlot {
    #[serde_as(as = "DisplayFromStr")]
    pub start: ClockTime,
    #[serde_as(as = "DisplayFromStr")]
    pub end: ClockTime,
    #[serde_as(as = "Vec<DisplayFromStr>")]
    #[serde(default = "Config::default_days")]
    pub days: Vec<Weekday>,
    #[serde(default)]
    pub apply_to_charge: bool,
} // }}}

// Exclusion {{{
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Exclusion {
    /// name of the device power feed, see `inputs`
    pub device: String,
    #[serde(default = "Config::default_enabled")]
    pub included_in_consumption: bool,
} // }}}

// Control {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Control {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,
    #[serde(default = "Config::default_kp")]
    pub kp: f64,
    #[serde(default = "Config::default_kd")]
    pub kd: f64,
    #[serde(default = "Config::default_deadband")]
    pub deadband: f64,
    #[serde(default = "Config::default_max_power_change")]
    pub max_power_change: f64,
    #[serde(default = "Config::default_direction_hysteresis")]
    pub direction_hysteresis: f64,
    #[serde(default = "Config::default_control_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "Vec::new")]
    pub time_slots: Vec<TimeSlot>,
    #[serde(default = "Vec::new")]
    pub exclusions: Vec<Exclusion>,
}

impl Control {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.interval_ms)
    }
} // }}}

// Predictive {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Predictive {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,
    #[serde_as(as = "DisplayFromStr")]
    pub start_time: ClockTime,
    #[serde_as(as = "DisplayFromStr")]
    pub end_time: ClockTime,
    #[serde_as(as = "Vec<DisplayFromStr>")]
    #[serde(default = "Config::default_days")]
    pub days: Vec<Weekday>,
    #[serde(default = "Config::default_max_contracted_power")]
    pub max_contracted_power: f64,
    #[serde(default = "Config::default_lead_minutes")]
    pub lead_minutes: u32,
    pub history_file: Option<String>,
}

impl Predictive {
    pub fn enabled(&self) -> bool {
        self.enabled
    }
} // }}}

// WeeklyFullCharge {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct WeeklyFullCharge {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,
    #[serde_as(as = "DisplayFromStr")]
    pub day: Weekday,
}

impl WeeklyFullCharge {
    pub fn enabled(&self) -> bool {
        self.enabled
    }
} // }}}

// Mqtt {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Mqtt {
    #[serde(default = "Config::default_disabled")]
    pub enabled: bool,

    #[serde(default = "Config::default_mqtt_host")]
    pub host: String,
    #[serde(default = "Config::default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "Config::default_mqtt_namespace")]
    pub namespace: String,
}

impl Mqtt {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &Option<String> {
        &self.username
    }

    pub fn password(&self) -> &Option<String> {
        &self.password
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
} // }}}

// runtime updates {{{
/// Controller tuning pushed at runtime. Absent fields keep their current value.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlUpdate {
    pub kp: Option<f64>,
    pub kd: Option<f64>,
    pub deadband: Option<f64>,
    pub max_power_change: Option<f64>,
    pub direction_hysteresis: Option<f64>,
}

impl ControlUpdate {
    pub fn applied_to(&self, mut control: Control) -> Control {
        control.kp = self.kp.unwrap_or(control.kp);
        control.kd = self.kd.unwrap_or(control.kd);
        control.deadband = self.deadband.unwrap_or(control.deadband);
        control.max_power_change = self.max_power_change.unwrap_or(control.max_power_change);
        control.direction_hysteresis = self
            .direction_hysteresis
            .unwrap_or(control.direction_hysteresis);
        control
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatteryLimits {
    pub max_charge_power: u16,
    pub max_discharge_power: u16,
    pub min_soc: u8,
    pub max_soc: u8,
}
// }}}

#[derive(Debug)]
pub struct ConfigWrapper {
    config: Arc<Mutex<Config>>,
}

impl Clone for ConfigWrapper {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
        }
    }
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        let config = Config::new(file)?;
        Ok(Self::from_config(config))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Config> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn batteries(&self) -> Vec<Battery> {
        self.lock().batteries.clone()
    }

    pub fn enabled_batteries(&self) -> Vec<Battery> {
        self.batteries().into_iter().filter(|b| b.enabled()).collect()
    }

    pub fn battery(&self, name: &str) -> Option<Battery> {
        self.batteries().into_iter().find(|b| b.name() == name)
    }

    pub fn control(&self) -> Control {
        self.lock().control.clone()
    }

    /// Reconfigure the controller at runtime; takes effect on the next cycle.
    pub fn set_control(&self, new: Control) -> Result<()> {
        validate_control(&new)?;
        self.lock().control = new;
        Ok(())
    }

    /// Replace per-battery limits at runtime. Connection settings can't change here.
    pub fn set_battery_limits(&self, name: &str, limits: BatteryLimits) -> Result<()> {
        let BatteryLimits {
            max_charge_power: max_charge,
            max_discharge_power: max_discharge,
            min_soc,
            max_soc,
        } = limits;

        if min_soc >= max_soc || max_soc > 100 {
            bail!("min_soc {} must be below max_soc {} (max 100)", min_soc, max_soc);
        }
        if max_charge == 0 || max_discharge == 0 {
            bail!("power limits must be positive");
        }

        let mut config = self.lock();
        let battery = config
            .batteries
            .iter_mut()
            .find(|b| b.name == name)
            .ok_or_else(|| anyhow!("battery {} not found", name))?;

        info!(
            "Updating battery {} limits: charge {}W discharge {}W soc {}-{}%",
            name, max_charge, max_discharge, min_soc, max_soc
        );
        battery.max_charge_power = max_charge;
        battery.max_discharge_power = max_discharge;
        battery.min_soc = min_soc;
        battery.max_soc = max_soc;

        Ok(())
    }

    pub fn predictive(&self) -> Option<Predictive> {
        self.lock().predictive.clone()
    }

    pub fn weekly_full_charge(&self) -> Option<WeeklyFullCharge> {
        self.lock().weekly_full_charge.clone()
    }

    pub fn mqtt(&self) -> Mqtt {
        self.lock().mqtt.clone()
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lock().poll_interval_ms)
    }

    pub fn loglevel(&self) -> String {
        self.lock().loglevel.clone()
    }
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        info!("Reading configuration from {}", file);
        let content = std::fs::read_to_string(&file)
            .map_err(|err| anyhow!("error reading {}: {}", file, err))?;

        let config: Self = serde_yaml::from_str(&content)?;

        info!("Configuration loaded successfully:");
        info!(
            "  Batteries: {} configured, {} enabled",
            config.batteries.len(),
            config.batteries.iter().filter(|b| b.enabled).count()
        );
        for b in &config.batteries {
            info!("    Battery[{}]:", b.name);
            info!("      Enabled: {}", b.enabled);
            info!("      Host: {}:{} unit {}", b.host, b.port, b.unit_id());
            info!("      Version: {}", b.version);
            info!("      Max Charge/Discharge: {}W/{}W", b.max_charge_power, b.max_discharge_power);
            info!("      SOC Range: {}-{}%", b.min_soc, b.max_soc);
            info!("      Read Only: {}", b.read_only());
        }

        let c = &config.control;
        info!("  Control: {}", if c.enabled { "enabled" } else { "disabled" });
        info!(
            "    Kp {} Kd {} deadband {}W max change {}W hysteresis {}W every {}ms",
            c.kp, c.kd, c.deadband, c.max_power_change, c.direction_hysteresis, c.interval_ms
        );
        info!("    Time slots: {}, exclusions: {}", c.time_slots.len(), c.exclusions.len());

        match &config.predictive {
            Some(p) if p.enabled => info!(
                "  Predictive charging: {}-{}, max contracted power {}W",
                p.start_time, p.end_time, p.max_contracted_power
            ),
            _ => info!("  Predictive charging: disabled"),
        }
        match &config.weekly_full_charge {
            Some(w) if w.enabled => info!("  Weekly full charge: {}", w.day),
            _ => info!("  Weekly full charge: disabled"),
        }

        info!("  MQTT: {}", if config.mqtt.enabled { "enabled" } else { "disabled" });
        if config.mqtt.enabled {
            info!("    Host: {}:{}", config.mqtt.host, config.mqtt.port);
            info!("    Namespace: {}", config.mqtt.namespace);
        }
        info!("  Poll Interval: {}ms", config.poll_interval_ms);
        info!("  Log Level: {}", config.loglevel);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batteries.is_empty() {
            bail!("at least one battery must be configured");
        }

        for (i, b) in self.batteries.iter().enumerate() {
            if b.name.is_empty() {
                bail!("battery[{}].name cannot be empty", i);
            }
            if self.batteries[..i].iter().any(|o| o.name == b.name) {
                bail!("battery name {} is used twice", b.name);
            }
            if b.host.is_empty() {
                bail!("battery[{}].host cannot be empty", i);
            }
            if b.port == 0 {
                bail!("battery[{}].port must be between 1 and 65535", i);
            }
            if b.min_soc >= b.max_soc || b.max_soc > 100 {
                bail!(
                    "battery[{}]: min_soc {} must be below max_soc {} (max 100)",
                    i,
                    b.min_soc,
                    b.max_soc
                );
            }
            if b.max_charge_power == 0 || b.max_discharge_power == 0 {
                bail!("battery[{}]: power limits must be positive", i);
            }
            if b.capacity_kwh <= 0.0 {
                bail!("battery[{}].capacity_kwh must be positive", i);
            }
            if b.response_timeout_ms() == 0 {
                bail!("battery[{}].response_timeout_ms cannot be 0", i);
            }
        }

        validate_control(&self.control)?;

        if let Some(p) = &self.predictive {
            if p.start_time == p.end_time {
                bail!("predictive.start_time and end_time must differ");
            }
            if p.max_contracted_power <= 0.0 {
                bail!("predictive.max_contracted_power must be positive");
            }
        }

        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms cannot be 0");
        }

        if self.mqtt.enabled {
            if self.mqtt.port == 0 {
                bail!("mqtt.port must be between 1 and 65535");
            }
            if self.mqtt.host.is_empty() {
                bail!("mqtt.host cannot be empty");
            }
        }

        Ok(())
    }

    fn default_control() -> Control {
        Control {
            enabled: Self::default_enabled(),
            kp: Self::default_kp(),
            kd: Self::default_kd(),
            deadband: Self::default_deadband(),
            max_power_change: Self::default_max_power_change(),
            direction_hysteresis: Self::default_direction_hysteresis(),
            interval_ms: Self::default_control_interval_ms(),
            time_slots: Vec::new(),
            exclusions: Vec::new(),
        }
    }

    fn default_mqtt() -> Mqtt {
        Mqtt {
            enabled: false,
            host: Self::default_mqtt_host(),
            port: Self::default_mqtt_port(),
            username: None,
            password: None,
            namespace: Self::default_mqtt_namespace(),
        }
    }

    fn default_enabled() -> bool {
        true
    }

    fn default_disabled() -> bool {
        false
    }

    fn default_port() -> u16 {
        502
    }

    fn default_max_power() -> u16 {
        2500
    }

    fn default_min_soc() -> u8 {
        12
    }

    fn default_max_soc() -> u8 {
        100
    }

    fn default_capacity_kwh() -> f64 {
        5.12
    }

    fn default_days() -> Vec<Weekday> {
        vec![
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ]
    }

    fn default_kp() -> f64 {
        0.65
    }

    fn default_kd() -> f64 {
        0.5
    }

    fn default_deadband() -> f64 {
        40.0
    }

    fn default_max_power_change() -> f64 {
        800.0
    }

    fn default_direction_hysteresis() -> f64 {
        60.0
    }

    fn default_control_interval_ms() -> u64 {
        2000
    }

    fn default_poll_interval_ms() -> u64 {
        1500
    }

    fn default_max_contracted_power() -> f64 {
        7000.0
    }

    fn default_lead_minutes() -> u32 {
        60
    }

    fn default_mqtt_host() -> String {
        "localhost".to_string()
    }

    fn default_mqtt_port() -> u16 {
        1883
    }

    fn default_mqtt_namespace() -> String {
        "venus".to_string()
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }
}

fn validate_control(c: &Control) -> Result<()> {
    if c.kp < 0.0 || c.kd < 0.0 {
        bail!("control gains cannot be negative");
    }
    if c.deadband < 0.0 || c.direction_hysteresis < 0.0 {
        bail!("control deadband and direction_hysteresis cannot be negative");
    }
    if c.max_power_change <= 0.0 {
        bail!("control.max_power_change must be positive");
    }
    if c.interval_ms == 0 {
        bail!("control.interval_ms cannot be 0");
    }
    if c.time_slots.len() > MAX_TIME_SLOTS {
        bail!("at most {} time slots are supported, got {}", MAX_TIME_SLOTS, c.time_slots.len());
    }
    Ok(())
}
