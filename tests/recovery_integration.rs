//! Startup recovery: snapshot + live broker positions

mod common;

use chrono::Utc;
use common::{book, labeled_position, test_config, ACCOUNT, TAG};
use martingale_engine::{
    AllowAll, BatchEngine, BatchRegistry, Broker, Direction, PaperBroker, Snapshot, SnapshotSource,
    SnapshotStore,
};
use pretty_assertions::assert_eq;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tempfile::TempDir;

/// Saved state with batch 1 = EURUSD long (position "a1") and
/// batch 2 = GBPUSD short (position "b1")
async fn save_two_batches(dir: &TempDir, account: &str) {
    let mut registry = BatchRegistry::new();
    let a = registry.create_batch("EURUSD", Direction::Long, dec!(1.1000), dec!(0.0050)).unwrap();
    registry
        .add_layer(a, dec!(0.01), dec!(1.1000), Some("a1".into()))
        .unwrap();
    let b = registry.create_batch("GBPUSD", Direction::Short, dec!(1.3000), dec!(0.0050)).unwrap();
    registry
        .add_layer(b, dec!(0.01), dec!(1.3000), Some("b1".into()))
        .unwrap();

    let config = test_config(dir);
    let store = SnapshotStore::new(
        config.persistence.state_file.clone(),
        config.persistence.backup_file(),
        account,
        TAG,
    );
    store
        .write(&Snapshot::capture(&registry, account, TAG, Utc::now()))
        .await
        .unwrap();
}

fn engine(dir: &TempDir, broker: &Arc<PaperBroker>) -> BatchEngine {
    BatchEngine::new(&test_config(dir), broker.clone(), Arc::new(AllowAll))
}

#[test_log::test(tokio::test)]
async fn test_live_batch_kept_closed_batch_dropped() {
    let dir = TempDir::new().unwrap();
    save_two_batches(&dir, ACCOUNT).await;

    let broker = Arc::new(PaperBroker::new());
    broker.insert_position(TAG, labeled_position("a1", "BM01_EURUSD_B01", dec!(0.01), dec!(1.1002)));

    let mut engine = engine(&dir, &broker);
    let report = engine.startup(&book(&[("EURUSD", dec!(1.1000))])).await;

    assert_eq!(report.snapshot_source, Some(SnapshotSource::Primary));
    assert!(report.broker_verified);
    assert_eq!(report.rebuilt, vec![1]);
    assert_eq!(report.completed_offline, vec![2]);
    assert!(report.adopted.is_empty());

    assert_eq!(engine.registry().len(), 1);
    assert!(engine.registry().has_open_position("EURUSD", Direction::Long));
    assert!(!engine.registry().has_open_position("GBPUSD", Direction::Short));

    // live data wins for the fill price
    let batch = engine.registry().batch(1).unwrap();
    assert_eq!(batch.breakeven_price(), Some(dec!(1.1002)));
    assert_eq!(batch.target_price(), Some(dec!(1.1017)));
    assert_eq!(engine.registry().next_batch_id(), 3);

    let live = broker.get_positions(TAG).await.unwrap();
    assert_eq!(live[0].target_price, Some(dec!(1.1017)));
}

#[test_log::test(tokio::test)]
async fn test_orphans_adopted_as_one_batch() {
    let dir = TempDir::new().unwrap();
    let broker = Arc::new(PaperBroker::new());
    broker.insert_position(TAG, labeled_position("x1", "BM05_XAUUSD_S01", dec!(0.01), dec!(2000.0)));
    broker.insert_position(TAG, labeled_position("x2", "BM05_XAUUSD_S02", dec!(0.02), dec!(2005.0)));
    broker.insert_position(TAG, labeled_position("x3", "BM05_XAUUSD_S03", dec!(0.04), dec!(2010.0)));
    broker.insert_position(TAG, labeled_position("m1", "BM01_EURUSD_B01", dec!(0.01), dec!(1.1)));
    broker.insert_position("someone-else", labeled_position("z1", "BM09_EURUSD_S01", dec!(0.01), dec!(1.1)));

    let mut engine = engine(&dir, &broker);
    let report = engine.startup(&book(&[("XAUUSD", dec!(2006.0))])).await;

    assert_eq!(report.snapshot_source, None);
    assert_eq!(report.adopted.len(), 2);
    assert_eq!(engine.registry().len(), 2);

    let gold = engine.registry().get("XAUUSD", Direction::Short).unwrap();
    assert_eq!(gold.total_volume(), dec!(0.07));
    assert_eq!(gold.initial_entry_price, dec!(2000.0));
    // 50 pips at 0.1
    assert_eq!(gold.layer_spacing, dec!(5.0));
    assert_eq!(gold.next_layer_index(), 4);
    assert!(gold.batch_id >= 6);

    let target = gold.target_price().unwrap();
    let live = broker.get_positions(TAG).await.unwrap();
    assert!(live
        .iter()
        .filter(|p| p.symbol == "XAUUSD")
        .all(|p| p.target_price == Some(target)));

    // the foreign-tag position is untouched and not adopted
    assert!(!engine.registry().has_open_position("EURUSD", Direction::Short));
}

#[test_log::test(tokio::test)]
async fn test_foreign_snapshot_means_fresh_start() {
    let dir = TempDir::new().unwrap();
    save_two_batches(&dir, "another-account").await;

    let broker = Arc::new(PaperBroker::new());
    let mut engine = engine(&dir, &broker);
    let report = engine.startup(&book(&[])).await;

    assert_eq!(report.snapshot_source, None);
    assert!(engine.registry().is_empty());
    assert_eq!(engine.registry().next_batch_id(), 1);
}

#[test_log::test(tokio::test)]
async fn test_unreachable_broker_restores_unverified() {
    let dir = TempDir::new().unwrap();
    save_two_batches(&dir, ACCOUNT).await;

    let broker = Arc::new(PaperBroker::new());
    broker.set_unavailable(true);
    let mut engine = engine(&dir, &broker);
    let report = engine.startup(&book(&[])).await;

    assert!(!report.broker_verified);
    assert_eq!(engine.registry().len(), 2);

    // first cycle with the broker back reconciles: nothing is live
    broker.set_unavailable(false);
    let cycle = engine.run_cycle(&book(&[])).await;
    assert_eq!(cycle.sync.completed.len(), 2);
    assert!(engine.registry().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_corrupt_primary_uses_backup() {
    let dir = TempDir::new().unwrap();
    save_two_batches(&dir, ACCOUNT).await;
    save_two_batches(&dir, ACCOUNT).await;
    let config = test_config(&dir);
    tokio::fs::write(&config.persistence.state_file, b"\x00\x01garbage")
        .await
        .unwrap();

    let broker = Arc::new(PaperBroker::new());
    broker.insert_position(TAG, labeled_position("b1", "BM02_GBPUSD_S01", dec!(0.01), dec!(1.3000)));
    let mut engine = engine(&dir, &broker);
    let report = engine.startup(&book(&[])).await;

    assert_eq!(report.snapshot_source, Some(SnapshotSource::Backup));
    assert_eq!(report.rebuilt, vec![2]);
    assert_eq!(report.completed_offline, vec![1]);
}

#[test_log::test(tokio::test)]
async fn test_missed_layers_logged_not_executed() {
    let dir = TempDir::new().unwrap();
    save_two_batches(&dir, ACCOUNT).await;

    let broker = Arc::new(PaperBroker::new());
    broker.insert_position(TAG, labeled_position("a1", "BM01_EURUSD_B01", dec!(0.01), dec!(1.1000)));
    let mut engine = engine(&dir, &broker);
    let report = engine.startup(&book(&[("EURUSD", dec!(1.0880))])).await;

    let missed: Vec<u32> = report.missed_layers.iter().map(|m| m.layer_number).collect();
    assert_eq!(missed, vec![2, 3]);
    assert_eq!(engine.registry().batch(1).unwrap().layer_count(), 1);
    assert_eq!(broker.orders_placed(), 0);
}
