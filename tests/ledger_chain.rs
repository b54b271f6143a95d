//! Ledger chain integrity against a ledger produced by real cycles,
//! including out-of-band tampering.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use evoloop::config::EngineConfig;
use evoloop::engine::EvolutionEngine;
use evoloop::ledger::ChainStatus;
use evoloop::metrics::Telemetry;

fn run_cycles(dir: &tempfile::TempDir, n: u64) -> EvolutionEngine {
    let mut cfg = EngineConfig::default();
    cfg.evolution.seed = Some(42);
    let mut engine = EvolutionEngine::bootstrap(
        cfg,
        dir.path().join("worm.db"),
        None,
        Arc::new(Telemetry::new()),
        PathBuf::from(dir.path().join("snapshots")),
    )
    .unwrap();

    let mut metrics = HashMap::new();
    metrics.insert("rsi".to_string(), 0.7);
    metrics.insert("synergy".to_string(), 0.7);
    for k in 0..8 {
        metrics.insert(format!("module_{k}"), 0.92);
    }

    let rt = tokio::runtime::Runtime::new().unwrap();
    for _ in 0..n {
        rt.block_on(engine.run_cycle(&metrics)).unwrap();
    }
    engine
}

#[test]
fn chain_verifies_after_mixed_outcomes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = run_cycles(&dir, 5);
    // A mix of rollbacks and promotions still forms one valid chain.
    assert!(engine.counters().cycles + engine.counters().aborts > 0);
    match engine.ledger().verify_chain().unwrap() {
        ChainStatus::Valid { rows } => assert!(rows >= 10),
        other => panic!("expected valid chain, got {other:?}"),
    }
}

#[test]
fn tampering_with_row_data_breaks_chain_at_that_row() {
    let dir = tempfile::tempdir().unwrap();
    let engine = run_cycles(&dir, 5);
    drop(engine);

    let conn = rusqlite::Connection::open(dir.path().join("worm.db")).unwrap();
    // Overwrite row 5's payload with valid JSON so the detected failure is
    // specifically a hash mismatch rather than a parse error.
    let tampered = "{\"tampered\":true}";
    conn.execute(
        "UPDATE events SET data = ?1 WHERE id = 5",
        rusqlite::params![tampered],
    )
    .unwrap();
    drop(conn);

    let ledger = evoloop::ledger::WormLedger::open(
        dir.path().join("worm.db"),
        evoloop::clock::EngineClock::wall(),
    )
    .unwrap();
    assert_eq!(
        ledger.verify_chain().unwrap(),
        ChainStatus::Broken {
            row: 5,
            reason: "hash mismatch".to_string()
        }
    );
}

#[test]
fn reopened_ledger_extends_the_same_chain() {
    let dir = tempfile::tempdir().unwrap();
    let engine = run_cycles(&dir, 2);
    let tail = engine.ledger().tail_hash().unwrap();
    let rows_before = engine.ledger().len().unwrap();
    drop(engine);

    let ledger = evoloop::ledger::WormLedger::open(
        dir.path().join("worm.db"),
        evoloop::clock::EngineClock::wall(),
    )
    .unwrap();
    assert_eq!(ledger.tail_hash().unwrap(), tail);
    ledger
        .record(
            evoloop::ledger::EventType::Boot,
            serde_json::json!({"reopen": true}),
            evoloop::ledger::RecordOpts::default(),
        )
        .unwrap();
    assert_eq!(ledger.len().unwrap(), rows_before + 1);
    assert!(matches!(
        ledger.verify_chain().unwrap(),
        ChainStatus::Valid { .. }
    ));
}
