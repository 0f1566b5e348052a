mod common;
use common::*;

use venus_energy_manager::predictive::{ConsumptionHistory, HistoryStore, JsonFileStore};

use chrono::NaiveDate;
use tempfile::TempDir;

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
}

#[tokio::test]
async fn missing_file_is_empty_history() -> Result<()> {
    common_setup();
    let dir = TempDir::new()?;
    let path = dir.path().join("history.json");

    let store = JsonFileStore::new(path.to_string_lossy().into_owned());
    assert!(store.load().await?.is_empty());
    assert!(!path.exists());

    Ok(())
}

#[tokio::test]
async fn history_survives_a_restart() -> Result<()> {
    common_setup();
    let dir = TempDir::new()?;
    let path = dir.path().join("history.json").to_string_lossy().into_owned();

    let mut history = ConsumptionHistory::default();
    history.record(day(1), 9.5);
    history.record(day(2), 7.5);
    JsonFileStore::new(path.clone()).save(&history).await?;

    let loaded = JsonFileStore::new(path).load().await?;
    assert_eq!(loaded.len(), 2);
    assert!(loaded.contains(day(2)));
    assert_eq!(loaded.average(), 8.5);

    Ok(())
}

#[tokio::test]
async fn corrupt_file_is_an_error() -> Result<()> {
    common_setup();
    let dir = TempDir::new()?;
    let path = dir.path().join("history.json");
    tokio::fs::write(&path, "not json").await?;

    let err = JsonFileStore::new(path.to_string_lossy().into_owned())
        .load()
        .await
        .unwrap_err();
    assert!(err.to_string().contains("error parsing"), "{}", err);

    Ok(())
}
