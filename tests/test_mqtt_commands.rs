mod common;
use common::*;

use venus_energy_manager::command::Command;
use venus_energy_manager::control::ControlLoop;
use venus_energy_manager::coordinator::Coordinator;
use venus_energy_manager::inputs::Inputs;
use venus_energy_manager::mqtt::{Message, Mqtt};
use venus_energy_manager::predictive::PredictiveHold;
use venus_energy_manager::register;

use chrono::{Local, TimeZone};

const V2: BatteryVersion = BatteryVersion::V2;

fn message(topic: &str, payload: &str) -> Message {
    Message {
        topic: topic.to_owned(),
        retain: false,
        payload: payload.to_owned(),
    }
}

async fn setup() -> (FakeBattery, ConfigWrapper, Channels, Coordinator, Inputs, Mqtt) {
    common_setup();
    let (fake, port) = FakeBattery::start().await;
    fake.set(address(V2, register::BATTERY_SOC), 50);

    let config = Factory::config_wrapper(vec![Factory::battery("b1", port, "v2")]);
    let channels = Channels::new();
    let coordinator = Coordinator::new(config.clone(), Factory::shutdown_flag());
    let inputs = Inputs::new();
    let mqtt = Mqtt::new(config.clone(), channels.clone(), coordinator.clone(), inputs.clone());

    (fake, config, channels, coordinator, inputs, mqtt)
}

fn command(topic: &str, payload: &str) -> Command {
    message(topic, payload).to_command().unwrap()
}

#[tokio::test]
async fn control_tuning_is_merged_and_reported() {
    let (_fake, config, channels, _, _, mqtt) = setup().await;
    let mut results = channels.to_mqtt.subscribe();

    mqtt.process_command(command("config/control", r#"{"deadband": 120, "kd": 0.25}"#))
        .await;

    let control = config.control();
    assert_eq!(control.deadband, 120.0);
    assert_eq!(control.kd, 0.25);
    assert_eq!(control.kp, 0.5);

    let result = results.try_recv().unwrap();
    assert_eq!(result.topic, "result/config/control");
    let v: serde_json::Value = serde_json::from_str(&result.payload).unwrap();
    assert_eq!(v["deadband"], 120.0);

    // invalid values leave the running settings alone
    mqtt.process_command(command("config/control", r#"{"max_power_change": 0}"#))
        .await;
    assert_eq!(config.control().max_power_change, 300.0);
    assert_eq!(results.try_recv().unwrap().payload, "FAIL");
}

#[tokio::test]
async fn battery_limits_reach_the_control_loop() -> Result<()> {
    let (fake, config, channels, coordinator, inputs, mqtt) = setup().await;
    let mut results = channels.to_mqtt.subscribe();

    mqtt.process_command(command(
        "config/b1/limits",
        r#"{"max_charge_power": 1000, "max_discharge_power": 200, "min_soc": 20, "max_soc": 90}"#,
    ))
    .await;

    let b1 = config.battery("b1").unwrap();
    assert_eq!(b1.max_discharge_power(), 200.0);
    assert_eq!(b1.min_soc(), 20.0);
    assert_eq!(results.try_recv().unwrap().topic, "result/config/b1/limits");

    coordinator.poll_all().await;
    inputs.set_consumption(2000.0);
    let mut control = ControlLoop::new(coordinator, inputs, PredictiveHold::default());
    control
        .run_cycle(Local.with_ymd_and_hms(2024, 1, 1, 18, 0, 0).single().unwrap())
        .await?;

    assert_eq!(fake.get(address(V2, register::SET_DISCHARGE_POWER)), Some(200));

    mqtt.process_command(command(
        "config/nope/limits",
        r#"{"max_charge_power": 1000, "max_discharge_power": 200, "min_soc": 20, "max_soc": 90}"#,
    ))
    .await;
    assert_eq!(results.try_recv().unwrap().payload, "FAIL");

    Ok(())
}
