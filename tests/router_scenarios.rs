//! Engine + router integration: enrichment queries hit the ledger, budget
//! exhaustion degrades to a recorded abort, and provider failures stay
//! contained inside the router.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use evoloop::config::EngineConfig;
use evoloop::engine::{Decision, EvolutionEngine};
use evoloop::metrics::Telemetry;
use evoloop::router::breaker::BreakerConfig;
use evoloop::router::budget::BudgetTracker;
use evoloop::router::cache::TieredCache;
use evoloop::router::provider::{Provider, StubProvider};
use evoloop::router::{ProviderRouter, RouterConfig};

fn seeded_config(seed: u64) -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.evolution.seed = Some(seed);
    cfg
}

fn good_metrics(i: u64) -> HashMap<String, f64> {
    let i = i as f64;
    let mut m = HashMap::new();
    m.insert("rsi".to_string(), 0.65 + 0.05 * i);
    m.insert("synergy".to_string(), 0.65 + 0.05 * i);
    m.insert("novelty".to_string(), 0.60 + 0.05 * i);
    m.insert("stability".to_string(), 0.75 + 0.04 * i);
    m.insert("viability".to_string(), 0.85 + 0.03 * i);
    m.insert("cost".to_string(), (0.15 - 0.02 * i).max(0.0));
    m.insert("c".to_string(), 0.70 + 0.03 * i);
    m.insert("a".to_string(), 0.70 + 0.03 * i);
    m.insert("o".to_string(), 0.60 + 0.02 * i);
    m.insert("s".to_string(), 0.60 + 0.02 * i);
    m.insert("c_cal".to_string(), 0.90);
    m.insert("m".to_string(), 0.85);
    m.insert("a_eff".to_string(), 0.80);
    for k in 0..8 {
        m.insert(format!("module_{k}"), 0.92);
    }
    m
}

fn build_router(
    providers: Vec<Arc<dyn Provider>>,
    daily_limit: f64,
    telemetry: Arc<Telemetry>,
) -> Arc<ProviderRouter> {
    Arc::new(ProviderRouter::new(
        providers,
        RouterConfig::default(),
        Arc::new(BudgetTracker::new(daily_limit, 0.95).unwrap()),
        BreakerConfig::default(),
        TieredCache::memory_only(64, Duration::from_secs(60), None),
        telemetry,
    ))
}

fn build_engine(
    dir: &tempfile::TempDir,
    cfg: EngineConfig,
    router: Arc<ProviderRouter>,
    telemetry: Arc<Telemetry>,
) -> EvolutionEngine {
    EvolutionEngine::bootstrap(
        cfg,
        dir.path().join("worm.db"),
        Some(router),
        telemetry,
        PathBuf::from(dir.path().join("snapshots")),
    )
    .unwrap()
}

#[tokio::test]
async fn enrichment_queries_are_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let telemetry = Arc::new(Telemetry::new());
    let stub: Arc<dyn Provider> = Arc::new(StubProvider::new("local", 0.01, 0.0));
    let router = build_router(vec![stub], 10.0, telemetry.clone());
    let mut engine = build_engine(&dir, seeded_config(42), router.clone(), telemetry);

    for i in 0..2 {
        let result = engine.run_cycle(&good_metrics(i)).await.unwrap();
        assert_eq!(result.decision, Decision::Promote);
    }

    let queries = engine.ledger().rows(Some("LLM_QUERY")).unwrap();
    assert_eq!(queries.len(), 2);
    assert_eq!(queries[0].data["provider"], serde_json::json!("local"));
    assert!((router.budget().usage().spend_today_usd - 0.02).abs() < 1e-12);
}

#[tokio::test]
async fn budget_exhaustion_becomes_recorded_abort() {
    let dir = tempfile::tempdir().unwrap();
    let telemetry = Arc::new(Telemetry::new());
    let stub: Arc<dyn Provider> = Arc::new(StubProvider::new("local", 0.40, 0.0));
    let router = build_router(vec![stub], 1.0, telemetry.clone());
    let mut engine = build_engine(&dir, seeded_config(42), router.clone(), telemetry);

    // Two affordable cycles, then the projected spend crosses the cap.
    let r1 = engine.run_cycle(&good_metrics(0)).await.unwrap();
    assert_eq!(r1.decision, Decision::Promote);
    let r2 = engine.run_cycle(&good_metrics(1)).await.unwrap();
    assert_eq!(r2.decision, Decision::Promote);
    let r3 = engine.run_cycle(&good_metrics(2)).await.unwrap();
    assert_eq!(r3.decision, Decision::Abort);
    assert_eq!(r3.reason.as_deref(), Some("NO_PROVIDER"));

    let aborts = engine.ledger().rows(Some("CYCLE_ABORT")).unwrap();
    assert_eq!(aborts.len(), 1);
    assert_eq!(aborts[0].data["reason"], serde_json::json!("NO_PROVIDER"));
    // The block never dinged the breaker: still closed.
    assert_eq!(router.breaker_states()["local"], serde_json::json!("closed"));
    assert!((router.budget().usage().spend_today_usd - 0.80).abs() < 1e-12);
}

#[tokio::test]
async fn provider_failures_fall_back_without_aborting() {
    let dir = tempfile::tempdir().unwrap();
    let telemetry = Arc::new(Telemetry::new());
    let flaky = Arc::new(StubProvider::new("flaky", 0.01, 0.0));
    flaky.fail_next(1);
    let backup = Arc::new(StubProvider::new("backup", 0.02, 0.0));
    let providers: Vec<Arc<dyn Provider>> = vec![flaky, backup];
    let router = build_router(providers, 10.0, telemetry.clone());
    let mut engine = build_engine(&dir, seeded_config(42), router.clone(), telemetry);

    let result = engine.run_cycle(&good_metrics(0)).await.unwrap();
    assert_eq!(result.decision, Decision::Promote);

    let queries = engine.ledger().rows(Some("LLM_QUERY")).unwrap();
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].data["provider"], serde_json::json!("backup"));
    let breakdown = router.budget().provider_breakdown();
    assert_eq!(breakdown["flaky"].requests_failed, 1);
}

#[tokio::test]
async fn total_provider_failure_aborts_with_no_provider() {
    let dir = tempfile::tempdir().unwrap();
    let telemetry = Arc::new(Telemetry::new());
    let dead = Arc::new(StubProvider::new("dead", 0.0, 0.0));
    dead.fail_next(100);
    let providers: Vec<Arc<dyn Provider>> = vec![dead];
    let router = build_router(providers, 10.0, telemetry.clone());
    let mut engine = build_engine(&dir, seeded_config(42), router, telemetry);

    let result = engine.run_cycle(&good_metrics(0)).await.unwrap();
    assert_eq!(result.decision, Decision::Abort);
    assert_eq!(result.reason.as_deref(), Some("NO_PROVIDER"));
    assert_eq!(engine.counters().aborts, 1);
    assert_eq!(engine.counters().promotions, 0);
}
