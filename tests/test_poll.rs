mod common;
use common::*;

use venus_energy_manager::coordinator::Coordinator;
use venus_energy_manager::register;

const V2: BatteryVersion = BatteryVersion::V2;

async fn setup() -> (FakeBattery, Coordinator) {
    common_setup();
    let (fake, port) = FakeBattery::start().await;
    let config = Factory::config_wrapper(vec![Factory::battery("b1", port, "v2")]);
    (fake, Coordinator::new(config, Factory::shutdown_flag()))
}

#[tokio::test]
async fn first_poll_reads_everything_then_only_what_is_due() -> Result<()> {
    let (fake, coordinator) = setup().await;
    let soc = address(V2, register::BATTERY_SOC);
    let daily = address(V2, register::TOTAL_DAILY_DISCHARGING_ENERGY);

    fake.set(soc, 42);
    fake.set(daily + 1, 250);

    let first = coordinator.poll("b1").await?;
    assert_eq!(first.soc(), Some(42.0));
    assert_eq!(first.get(register::TOTAL_DAILY_DISCHARGING_ENERGY), Some(2.5));

    let readable = V2.register_map().all().filter(|r| r.access.readable()).count();
    assert_eq!(fake.requests().len(), readable);

    fake.set(soc, 43);
    fake.set(daily + 1, 900);

    let second = coordinator.poll("b1").await?;
    assert_eq!(second.soc(), Some(43.0));
    // low tier, not read again yet
    assert_eq!(second.get(register::TOTAL_DAILY_DISCHARGING_ENERGY), Some(2.5));

    let due = V2.register_map().due(1).filter(|r| r.access.readable()).count();
    assert_eq!(fake.requests().len(), readable + due);

    Ok(())
}

#[tokio::test]
async fn failed_poll_keeps_previous_snapshot() -> Result<()> {
    let (fake, coordinator) = setup().await;
    fake.set(address(V2, register::BATTERY_SOC), 42);

    let first = coordinator.poll("b1").await?;

    fake.with(|s| s.dead = true);
    assert!(coordinator.poll("b1").await.is_err());

    let after = coordinator.snapshot("b1")?;
    assert_eq!(after.taken_at, first.taken_at);
    assert_eq!(after.soc(), Some(42.0));

    // poll_all only logs
    coordinator.poll_all().await;
    assert_eq!(coordinator.snapshot("b1")?.taken_at, first.taken_at);

    Ok(())
}

#[tokio::test]
async fn snapshot_changes_are_announced() -> Result<()> {
    let (fake, coordinator) = setup().await;
    fake.set(address(V2, register::BATTERY_SOC), 77);

    let mut rx = coordinator.battery("b1")?.cache.subscribe();
    coordinator.poll("b1").await?;

    rx.changed().await?;
    assert_eq!(rx.borrow().soc(), Some(77.0));

    Ok(())
}
