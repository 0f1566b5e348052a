mod common;
use common::*;

use venus_energy_manager::control::power_writes;
use venus_energy_manager::coordinator::Coordinator;
use venus_energy_manager::register;

use std::collections::BTreeMap;

const V3: BatteryVersion = BatteryVersion::V3;

async fn setup(version: &str) -> (FakeBattery, Coordinator) {
    common_setup();
    let (fake, port) = FakeBattery::start().await;
    let config = Factory::config_wrapper(vec![Factory::battery("b1", port, version)]);
    (fake, Coordinator::new(config, Factory::shutdown_flag()))
}

#[tokio::test]
async fn writes_in_order_and_reads_back() -> Result<()> {
    let (fake, coordinator) = setup("v3").await;

    let outcome = coordinator.write_atomic("b1", &power_writes(250.0)).await?;

    assert!(outcome.is_confirmed());
    assert_eq!(outcome.confirmed[register::SET_DISCHARGE_POWER], 250.0);
    assert_eq!(outcome.confirmed[register::FORCE_MODE], 2.0);

    assert_eq!(
        fake.writes(),
        vec![
            (address(V3, register::SET_DISCHARGE_POWER), 250),
            (address(V3, register::SET_CHARGE_POWER), 0),
            (address(V3, register::FORCE_MODE), 2),
        ]
    );

    // every write is followed by its read-back, nothing interleaved
    let functions: Vec<u8> = fake.requests().iter().map(|r| r.function).collect();
    assert_eq!(functions, vec![6, 6, 6, 3, 3, 3]);

    Ok(())
}

#[tokio::test]
async fn mismatch_is_reported() -> Result<()> {
    let (fake, coordinator) = setup("v3").await;
    fake.with(|s| s.ignore_writes_to.insert(address(V3, register::FORCE_MODE)));

    let outcome = coordinator.write_atomic("b1", &power_writes(-400.0)).await?;

    assert!(!outcome.is_confirmed());
    assert_eq!(
        outcome.mismatches,
        vec![WriteMismatchError {
            name: register::FORCE_MODE.to_owned(),
            wanted: 1.0,
            actual: 0.0,
        }]
    );

    Ok(())
}

#[tokio::test]
async fn partial_failure_restores_safe_state() {
    let (fake, coordinator) = setup("v3").await;
    let charge = address(V3, register::SET_CHARGE_POWER);
    fake.with(|s| s.reject_writes_to.insert(charge));

    let err = coordinator
        .write_atomic("b1", &power_writes(300.0))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("exception"), "{}", err);

    let discharge = address(V3, register::SET_DISCHARGE_POWER);
    let force_mode = address(V3, register::FORCE_MODE);

    // discharge went through, charge was refused; then stop, zero charge, zero discharge
    let seen: Vec<(u16, u16)> = fake
        .requests()
        .into_iter()
        .filter(|r| r.is_write())
        .map(|r| (r.address, r.values[0]))
        .collect();
    assert_eq!(
        seen,
        vec![(discharge, 300), (charge, 0), (force_mode, 0), (charge, 0), (discharge, 0)]
    );
    assert_eq!(fake.get(discharge), Some(0));
    assert_eq!(fake.get(force_mode), Some(0));
}

#[tokio::test]
async fn first_write_failing_leaves_device_alone() {
    let (fake, coordinator) = setup("v3").await;
    let discharge = address(V3, register::SET_DISCHARGE_POWER);
    fake.with(|s| s.reject_writes_to.insert(discharge));

    assert!(coordinator.write_atomic("b1", &power_writes(300.0)).await.is_err());
    assert_eq!(fake.requests().len(), 1);
}

#[tokio::test]
async fn invalid_groups_never_reach_the_wire() {
    let (fake, coordinator) = setup("v2").await;

    let unsupported = BTreeMap::from([(register::USER_WORK_MODE.to_owned(), 1.0)]);
    let err = coordinator.write_atomic("b1", &unsupported).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RegisterError>(),
        Some(RegisterError::Unsupported { .. })
    ));

    let read_only = BTreeMap::from([(register::BATTERY_SOC.to_owned(), 50.0)]);
    let err = coordinator.write_atomic("b1", &read_only).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RegisterError>(),
        Some(RegisterError::ReadOnly(_))
    ));

    let too_big = BTreeMap::from([(register::SET_CHARGE_POWER.to_owned(), 70_000.0)]);
    assert!(coordinator.write_atomic("b1", &too_big).await.is_err());

    assert!(fake.requests().is_empty());
}

#[tokio::test]
async fn read_only_battery_refuses_writes() {
    common_setup();
    let (fake, port) = FakeBattery::start().await;
    let mut battery = Factory::battery("b1", port, "v2");
    battery.read_only = Some(true);
    let coordinator = Coordinator::new(Factory::config_wrapper(vec![battery]), Factory::shutdown_flag());

    assert!(coordinator.write_atomic("b1", &power_writes(100.0)).await.is_err());
    assert!(fake.requests().is_empty());
}

#[tokio::test]
async fn read_returns_named_values() -> Result<()> {
    let (fake, coordinator) = setup("v3").await;
    fake.set(address(V3, register::BATTERY_SOC), 64);

    let values = coordinator.read("b1", &[register::BATTERY_SOC]).await?;
    assert_eq!(values[register::BATTERY_SOC], 64.0);

    Ok(())
}
