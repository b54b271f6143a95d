//! CLI: run evolution cycles, verify the ledger chain, manage snapshots
//! and print current status.
//!
//! Exit codes: 0 success, 1 operational failure, 2 gate violation or
//! budget block, 3 configuration validation failure.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use evoloop::clock::EngineClock;
use evoloop::config::{root_dir, EngineConfig};
use evoloop::engine::{Decision, EvolutionEngine};
use evoloop::ledger::{ChainStatus, WormLedger};
use evoloop::logging::{json_log, obj, v_num, v_str, Domain};
use evoloop::metrics::Telemetry;
use evoloop::router::breaker::BreakerConfig;
use evoloop::router::budget::BudgetTracker;
use evoloop::router::cache::{secret_from_env, TieredCache};
use evoloop::router::provider::{Provider, ProviderKind, StubProvider};
use evoloop::router::{ProviderRouter, RouterConfig, SelectionStrategy};

const EXIT_OK: i32 = 0;
const EXIT_OPERATIONAL: i32 = 1;
const EXIT_GATE: i32 = 2;
const EXIT_CONFIG: i32 = 3;

fn usage() -> i32 {
    eprintln!(
        "usage: evoloop <command>\n\
         \n\
         commands:\n\
         \x20 evolve --cycles N [--budget USD] [--provider P] [--dry-run] [--resume]\n\
         \x20 ledger verify\n\
         \x20 snapshot save [tag]\n\
         \x20 snapshot load ID\n\
         \x20 status"
    );
    EXIT_OPERATIONAL
}

fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn has_flag(args: &[String], name: &str) -> bool {
    args.iter().any(|a| a == name)
}

fn ledger_path() -> PathBuf {
    root_dir().join("worm_ledger.db")
}

fn snapshot_dir() -> PathBuf {
    root_dir().join("snapshots")
}

fn latest_pointer() -> PathBuf {
    snapshot_dir().join("LATEST")
}

fn load_config() -> Result<EngineConfig, i32> {
    match EngineConfig::from_env() {
        Ok(cfg) => Ok(cfg),
        Err(err) => {
            eprintln!("config error: {err}");
            Err(EXIT_CONFIG)
        }
    }
}

fn build_router(
    args: &[String],
    telemetry: Arc<Telemetry>,
) -> anyhow::Result<Option<Arc<ProviderRouter>>> {
    let daily_limit = flag_value(args, "--budget")
        .and_then(|v| v.parse().ok())
        .or_else(|| {
            std::env::var("DAILY_BUDGET_USD")
                .ok()
                .and_then(|v| v.parse().ok())
        })
        .unwrap_or(100.0);

    let providers: Vec<Arc<dyn Provider>> = if has_flag(args, "--dry-run") {
        vec![Arc::new(StubProvider::new("local", 0.0, 0.0))]
    } else {
        let mut built: Vec<Arc<dyn Provider>> = ProviderKind::from_env()
            .into_iter()
            .map(Arc::from)
            .collect();
        if let Some(only) = flag_value(args, "--provider") {
            built.retain(|p| p.name() == only);
        }
        built
    };
    if providers.is_empty() {
        return Ok(None);
    }

    let mut router_cfg = RouterConfig::default();
    if let Some(strategy) = std::env::var("ROUTER_STRATEGY")
        .ok()
        .as_deref()
        .and_then(SelectionStrategy::parse)
    {
        router_cfg.strategy = strategy;
    }

    let budget = Arc::new(BudgetTracker::new(daily_limit, 0.95)?);
    std::fs::create_dir_all(root_dir())?;
    let cache = TieredCache::new(
        512,
        Duration::from_secs(3600),
        Some(root_dir().join("l2_cache.db")),
        Duration::from_secs(7200),
        secret_from_env(),
    )?;
    Ok(Some(Arc::new(ProviderRouter::new(
        providers,
        router_cfg,
        budget,
        BreakerConfig::default(),
        cache,
        telemetry,
    ))))
}

fn build_engine(
    args: &[String],
    telemetry: Arc<Telemetry>,
) -> Result<(EvolutionEngine, Option<Arc<ProviderRouter>>), i32> {
    let cfg = load_config()?;
    if let Err(err) = std::fs::create_dir_all(root_dir()) {
        eprintln!("cannot create {}: {err}", root_dir().display());
        return Err(EXIT_OPERATIONAL);
    }
    let router = match build_router(args, telemetry.clone()) {
        Ok(r) => r,
        Err(err) => {
            eprintln!("router setup failed: {err}");
            return Err(EXIT_OPERATIONAL);
        }
    };
    match EvolutionEngine::bootstrap(
        cfg,
        ledger_path(),
        router.clone(),
        telemetry,
        snapshot_dir(),
    ) {
        Ok(engine) => Ok((engine, router)),
        Err(err) => {
            eprintln!("engine startup failed: {err}");
            Err(EXIT_OPERATIONAL)
        }
    }
}

async fn cmd_evolve(args: &[String]) -> i32 {
    let cycles: u64 = flag_value(args, "--cycles")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);

    let telemetry = Arc::new(Telemetry::new());
    let (mut engine, router) = match build_engine(args, telemetry.clone()) {
        Ok(pair) => pair,
        Err(code) => return code,
    };

    if has_flag(args, "--resume") {
        if let Ok(id) = std::fs::read_to_string(latest_pointer()) {
            if let Err(err) = engine.load_snapshot(id.trim()) {
                eprintln!("resume failed: {err}");
                return EXIT_OPERATIONAL;
            }
        }
    }

    let external = std::collections::HashMap::new();
    let mut gate_stops: u64 = 0;
    for i in 0..cycles {
        match engine.run_cycle(&external).await {
            Ok(result) => {
                json_log(
                    Domain::Cycle,
                    "cycle_done",
                    obj(&[
                        ("n", v_num(i as f64)),
                        ("decision", v_str(result.decision.as_str())),
                        (
                            "reason",
                            v_str(result.reason.as_deref().unwrap_or("")),
                        ),
                        ("step", v_num(result.step)),
                    ]),
                );
                if result.decision != Decision::Promote {
                    gate_stops += 1;
                }
            }
            Err(err) => {
                eprintln!("cycle failed: {err}");
                return EXIT_OPERATIONAL;
            }
        }
    }

    match engine.shutdown() {
        Ok(snap_id) => {
            let _ = std::fs::write(latest_pointer(), &snap_id);
        }
        Err(err) => {
            eprintln!("shutdown failed: {err}");
            return EXIT_OPERATIONAL;
        }
    }
    if let Some(router) = &router {
        let usage = router.budget().usage();
        json_log(
            Domain::Budget,
            "final_usage",
            obj(&[
                ("spend_usd", v_num(usage.spend_today_usd)),
                ("remaining_usd", v_num(usage.remaining_usd)),
            ]),
        );
    }

    if gate_stops > 0 {
        EXIT_GATE
    } else {
        EXIT_OK
    }
}

fn cmd_ledger_verify() -> i32 {
    let ledger = match WormLedger::open(ledger_path(), EngineClock::wall()) {
        Ok(l) => l,
        Err(err) => {
            eprintln!("cannot open ledger: {err}");
            return EXIT_OPERATIONAL;
        }
    };
    match ledger.verify_chain() {
        Ok(ChainStatus::Valid { rows }) => {
            println!("OK ({rows} rows)");
            EXIT_OK
        }
        Ok(ChainStatus::Broken { row, reason }) => {
            println!("BROKEN at row {row}: {reason}");
            EXIT_OPERATIONAL
        }
        Err(err) => {
            eprintln!("verification failed: {err}");
            EXIT_OPERATIONAL
        }
    }
}

fn cmd_snapshot_save(args: &[String], tag: Option<&str>) -> i32 {
    let telemetry = Arc::new(Telemetry::new());
    let (mut engine, _router) = match build_engine(args, telemetry) {
        Ok(pair) => pair,
        Err(code) => return code,
    };
    if let Ok(id) = std::fs::read_to_string(latest_pointer()) {
        let _ = engine.load_snapshot(id.trim());
    }
    match engine.save_snapshot(tag) {
        Ok(id) => {
            let _ = std::fs::write(latest_pointer(), &id);
            println!("{id}");
            EXIT_OK
        }
        Err(err) => {
            eprintln!("snapshot save failed: {err}");
            EXIT_OPERATIONAL
        }
    }
}

fn cmd_snapshot_load(args: &[String], id: &str) -> i32 {
    let telemetry = Arc::new(Telemetry::new());
    let (mut engine, _router) = match build_engine(args, telemetry) {
        Ok(pair) => pair,
        Err(code) => return code,
    };
    match engine.load_snapshot(id) {
        Ok(()) => {
            let _ = std::fs::write(latest_pointer(), id);
            let st = engine.state();
            println!(
                "loaded {id}: cycle={} l_inf={:.4} trust_radius={:.3}",
                st.cycle, st.l_inf, st.trust_radius
            );
            EXIT_OK
        }
        Err(err) => {
            eprintln!("snapshot load failed: {err}");
            EXIT_OPERATIONAL
        }
    }
}

fn cmd_status(args: &[String]) -> i32 {
    let telemetry = Arc::new(Telemetry::new());
    let router = match build_router(args, telemetry.clone()) {
        Ok(r) => r,
        Err(err) => {
            eprintln!("router setup failed: {err}");
            return EXIT_OPERATIONAL;
        }
    };
    let ledger = match WormLedger::open(ledger_path(), EngineClock::wall()) {
        Ok(l) => l,
        Err(err) => {
            eprintln!("cannot open ledger: {err}");
            return EXIT_OPERATIONAL;
        }
    };
    let chain = match ledger.verify_chain() {
        Ok(ChainStatus::Valid { rows }) => format!("valid ({rows} rows)"),
        Ok(ChainStatus::Broken { row, reason }) => format!("broken at {row}: {reason}"),
        Err(err) => format!("error: {err}"),
    };
    let status = match &router {
        Some(r) => serde_json::json!({
            "root": root_dir().display().to_string(),
            "chain": chain,
            "budget": r.budget().usage(),
            "breakers": r.breaker_states(),
            "providers": r.provider_names(),
        }),
        None => serde_json::json!({
            "root": root_dir().display().to_string(),
            "chain": chain,
            "providers": [],
        }),
    };
    println!("{}", serde_json::to_string_pretty(&status).unwrap_or_default());
    if let Some(r) = &router {
        print!("{}", telemetry.render_prometheus(Some(r.budget())));
    }
    EXIT_OK
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let code = match args.get(1).map(String::as_str) {
        Some("evolve") => cmd_evolve(&args[2..]).await,
        Some("ledger") if args.get(2).map(String::as_str) == Some("verify") => cmd_ledger_verify(),
        Some("snapshot") => match args.get(2).map(String::as_str) {
            Some("save") => {
                let tag = args.get(3).filter(|a| !a.starts_with("--"));
                cmd_snapshot_save(&args[3..], tag.map(String::as_str))
            }
            Some("load") => match args.get(3) {
                Some(id) if !id.starts_with("--") => cmd_snapshot_load(&args[4..], id),
                _ => usage(),
            },
            _ => usage(),
        },
        Some("status") => cmd_status(&args[2..]),
        _ => usage(),
    };
    std::process::exit(code);
}
