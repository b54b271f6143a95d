//! The cycle driver: one deterministic master-equation step per call.
//!
//! A cycle snapshots the pre-state, applies external metrics, walks the
//! gate stack in fixed order, computes scores, and either commits a small
//! evolution step with an atomic attestation record or rolls back cleanly.
//! The driver is the only component that mutates state and the only writer
//! of promotion attestations. It is strictly serial: a cycle completes or
//! aborts before the next begins.

use anyhow::Result;
use serde_json::json;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::EngineClock;
use crate::config::{EngineConfig, SearchMethod};
use crate::fibonacci::{FibSchedule, FibToolkit, INV_PHI, PHI};
use crate::gates::{GateOutcome, SigmaGuard, Verdict};
use crate::ledger::{ChainStatus, EventType, RecordOpts, WormLedger};
use crate::logging::{json_log, obj, v_num, v_str, Domain};
use crate::metrics::Telemetry;
use crate::rng::DeterministicRng;
use crate::router::provider::ChatRequest;
use crate::router::ProviderRouter;
use crate::score::{compute_alpha, CaosEngine, CoherenceEngine, LinfScorer, OciEngine, SrEngine};
use crate::snapshot::{self, EngineCounters, SnapshotData};
use crate::state::EngineState;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Promote,
    Rollback,
    Abort,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Promote => "PROMOTE",
            Decision::Rollback => "ROLLBACK",
            Decision::Abort => "ABORT",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CycleResult {
    pub decision: Decision,
    pub reason: Option<String>,
    pub gate_trace: Vec<GateOutcome>,
    pub metrics: BTreeMap<String, f64>,
    pub step: f64,
}

pub struct EvolutionEngine {
    cfg: EngineConfig,
    config_hash: String,
    state: EngineState,
    rng: DeterministicRng,
    clock: EngineClock,
    ledger: Arc<WormLedger>,
    guard: SigmaGuard,
    linf: LinfScorer,
    caos: CaosEngine,
    sr: SrEngine,
    coherence: CoherenceEngine,
    oci: OciEngine,
    toolkit: FibToolkit,
    l1_schedule: FibSchedule,
    l2_schedule: FibSchedule,
    router: Option<Arc<ProviderRouter>>,
    telemetry: Arc<Telemetry>,
    counters: EngineCounters,
    snapshot_dir: PathBuf,
}

impl EvolutionEngine {
    /// Build the engine around an already-open ledger. The clock must be
    /// the one the ledger writes with.
    pub fn new(
        cfg: EngineConfig,
        ledger: Arc<WormLedger>,
        clock: EngineClock,
        router: Option<Arc<ProviderRouter>>,
        telemetry: Arc<Telemetry>,
        snapshot_dir: PathBuf,
    ) -> Result<Self> {
        cfg.validate()?;
        let config_hash = cfg.config_hash();
        let seed = cfg.evolution.seed.unwrap_or_else(|| {
            chrono::Utc::now().timestamp_millis() as u64 % (1u64 << 32)
        });
        let rng = DeterministicRng::new(seed);
        let mut state = EngineState::new();
        state.alpha_0 = cfg.evolution.alpha_0;

        let mut engine = Self {
            guard: SigmaGuard::new(cfg.clone()),
            linf: LinfScorer::new(cfg.linf_placar.clone(), cfg.iric.rho_max),
            caos: CaosEngine::new(cfg.caos_plus.clone()),
            sr: SrEngine::new(cfg.sr_omega.clone()),
            coherence: CoherenceEngine::new(cfg.omega_sigma.clone()),
            oci: OciEngine::new(cfg.oci.clone()),
            toolkit: FibToolkit::new(),
            l1_schedule: FibSchedule::new(cfg.fibonacci.l1_ttl_base, cfg.fibonacci.max_interval_s),
            l2_schedule: FibSchedule::new(cfg.fibonacci.l2_ttl_base, cfg.fibonacci.max_interval_s),
            config_hash,
            state,
            rng,
            clock,
            ledger,
            router,
            telemetry,
            counters: EngineCounters::default(),
            snapshot_dir,
            cfg,
        };
        engine.register_boot()?;
        Ok(engine)
    }

    /// Convenience constructor: derives the clock from the seed setting and
    /// opens the ledger at `ledger_path`.
    pub fn bootstrap(
        cfg: EngineConfig,
        ledger_path: PathBuf,
        router: Option<Arc<ProviderRouter>>,
        telemetry: Arc<Telemetry>,
        snapshot_dir: PathBuf,
    ) -> Result<Self> {
        let clock = if cfg.evolution.seed.is_some() {
            EngineClock::logical()
        } else {
            EngineClock::wall()
        };
        let ledger = Arc::new(WormLedger::open(ledger_path, clock.clone())?);
        Self::new(cfg, ledger, clock, router, telemetry, snapshot_dir)
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn counters(&self) -> &EngineCounters {
        &self.counters
    }

    pub fn ledger(&self) -> &Arc<WormLedger> {
        &self.ledger
    }

    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    fn register_boot(&mut self) -> Result<()> {
        self.ledger.record(
            EventType::Boot,
            json!({
                "version": VERSION,
                "phi": PHI,
                "inv_phi": INV_PHI,
                "fibonacci_enabled": self.cfg.fibonacci.enabled,
                "seed": self.rng.seed(),
                "config_hash": self.config_hash.clone(),
            }),
            RecordOpts {
                state_for_tag: Some(&self.state),
                seed_state: Some(&self.rng.state()),
                ..Default::default()
            },
        )?;
        Ok(())
    }

    /// Sample cpu/mem into the state. With a configured seed the readings
    /// are drawn from the deterministic source; without one they come from
    /// the host, and an unavailable probe pins both to 0.99 (fail-closed).
    fn sample_resources(&mut self) {
        if self.cfg.evolution.seed.is_some() {
            self.state.cpu = 0.3 + 0.4 * self.rng.random();
            self.state.mem = 0.3 + 0.4 * self.rng.random();
            return;
        }
        match crate::resources::sample() {
            Some((cpu, mem)) => {
                self.state.cpu = cpu;
                self.state.mem = mem;
            }
            None => {
                self.state.cpu = 0.99;
                self.state.mem = 0.99;
                json_log(
                    Domain::Cycle,
                    "resource_probe_unavailable",
                    obj(&[("cpu", v_num(0.99)), ("mem", v_num(0.99))]),
                );
            }
        }
    }

    /// Optional pre-score enrichment query through the router. Returns an
    /// error only when the router exhausted every alternate.
    async fn enrich(&mut self) -> Result<(), String> {
        let router = match &self.router {
            Some(r) => r.clone(),
            None => return Ok(()),
        };
        let prompt = format!(
            "state: delta_linf={:.4} sr={:.3} g={:.3} oci={:.3}; summarize next acquisitions",
            self.state.delta_linf, self.state.sr_score, self.state.g_score, self.state.oci_score
        );
        match router.ask(&ChatRequest::simple(&prompt)).await {
            Ok(resp) => {
                let _ = self.ledger.record(
                    EventType::LlmQuery,
                    json!({
                        "provider": resp.provider,
                        "model": resp.model,
                        "latency_s": resp.latency_s,
                        "cost_usd": resp.cost_usd,
                    }),
                    RecordOpts {
                        state_for_tag: Some(&self.state),
                        ..Default::default()
                    },
                );
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    fn contraction_factor(&self) -> f64 {
        if self.cfg.fibonacci.enabled {
            INV_PHI
        } else {
            self.cfg.iric.contraction_factor
        }
    }

    fn record_abort(
        &mut self,
        reason: &str,
        trace: &[GateOutcome],
        result: &CycleResult,
    ) -> Result<()> {
        self.ledger.record(
            EventType::CycleAbort,
            json!({
                "decision": "ABORT",
                "reason": reason,
                "cycle": self.state.cycle,
                "failed_gates": trace
                    .iter()
                    .filter(|g| !g.passed)
                    .map(|g| g.gate.clone())
                    .collect::<Vec<_>>(),
                "metrics": result.metrics.clone(),
            }),
            RecordOpts {
                state_for_tag: Some(&self.state),
                seed_state: Some(&self.rng.state()),
                gate_trace: Some(trace),
                ..Default::default()
            },
        )?;
        Ok(())
    }

    /// Run one evolution cycle against the given external metrics.
    pub async fn run_cycle(&mut self, external: &HashMap<String, f64>) -> Result<CycleResult> {
        let t0 = self.clock.now_epoch();
        self.state.ts = t0;

        self.ledger.record(
            EventType::CycleStart,
            json!({"cycle": self.state.cycle, "seed_state": self.rng.state()}),
            RecordOpts {
                state_for_tag: Some(&self.state),
                seed_state: Some(&self.rng.state()),
                ..Default::default()
            },
        )?;

        let pre_state = self.state.clone();
        let mut result = CycleResult {
            decision: Decision::Abort,
            reason: None,
            gate_trace: Vec::new(),
            metrics: BTreeMap::new(),
            step: 0.0,
        };

        self.state.merge_external(external);
        self.state.clamp_unit_fields();
        self.sample_resources();

        // Ethics sub-gate. Any failure aborts before any score is computed.
        let ethics = self.guard.ethics_subgate(&self.state);
        self.state.sigma_ok = ethics.verdict == Verdict::Pass;
        if ethics.verdict == Verdict::Fail {
            for gate in &ethics.failed_gates {
                self.telemetry.inc_ethics_violation(gate);
            }
            self.telemetry.inc_gate_action("BLOCK");
            self.counters.aborts += 1;
            result.gate_trace = ethics.gates;
            result.reason = Some("SIGMA_GUARD".to_string());
            self.record_abort("SIGMA_GUARD", &result.gate_trace.clone(), &result)?;
            self.state = pre_state;
            json_log(
                Domain::Cycle,
                "abort",
                obj(&[("reason", v_str("SIGMA_GUARD"))]),
            );
            return Ok(result);
        }

        // Risk/resource sub-gate. Failure contracts risk and aborts.
        let risk = self.guard.risk_subgate(&self.state);
        if risk.verdict == Verdict::Fail {
            self.telemetry.inc_gate_action("BLOCK");
            self.counters.aborts += 1;
            result.gate_trace = risk.gates;
            result.reason = Some("IRIC_CONTRACT".to_string());
            self.record_abort("IRIC_CONTRACT", &result.gate_trace.clone(), &result)?;
            let factor = self.contraction_factor();
            self.state = pre_state;
            self.state.rho *= factor;
            self.state.uncertainty *= factor;
            json_log(
                Domain::Cycle,
                "abort",
                obj(&[
                    ("reason", v_str("IRIC_CONTRACT")),
                    ("contraction", v_num(factor)),
                ]),
            );
            return Ok(result);
        }

        // Optional enrichment query; only total provider exhaustion aborts.
        if let Err(detail) = self.enrich().await {
            self.telemetry.inc_gate_action("BLOCK");
            self.counters.aborts += 1;
            result.reason = Some("NO_PROVIDER".to_string());
            self.ledger.record(
                EventType::CycleAbort,
                json!({
                    "decision": "ABORT",
                    "reason": "NO_PROVIDER",
                    "cycle": self.state.cycle,
                    "detail": detail,
                }),
                RecordOpts {
                    state_for_tag: Some(&self.state),
                    seed_state: Some(&self.rng.state()),
                    ..Default::default()
                },
            )?;
            self.state = pre_state;
            return Ok(result);
        }

        // Scores, in fixed order.
        let l_score = self.linf.compute(&mut self.state);
        let caos_val = self
            .caos
            .compute(&mut self.state, &self.toolkit, &mut self.rng);
        let sr_val = self.sr.compute(&mut self.state);
        let g_val = self.coherence.compute(&mut self.state);
        let oci_val = self.oci.compute(&mut self.state);
        let alpha = compute_alpha(
            &mut self.state,
            self.cfg.evolution.alpha_0,
            self.cfg.sr_omega.tau_sr,
            self.cfg.omega_sigma.tau_g,
            self.cfg.oci.tau_oci,
        );

        result.metrics.insert("l_inf".to_string(), l_score);
        result
            .metrics
            .insert("delta_linf".to_string(), self.state.delta_linf);
        result.metrics.insert("caos_plus".to_string(), caos_val);
        result
            .metrics
            .insert("harmony".to_string(), self.state.caos_harmony);
        result.metrics.insert("sr".to_string(), sr_val);
        result.metrics.insert("g".to_string(), g_val);
        result.metrics.insert("oci".to_string(), oci_val);
        result.metrics.insert("alpha".to_string(), alpha);
        self.telemetry.set_score_gauges(&self.state);

        // Promotion gates.
        let gates = self.guard.promotion_gates(&self.state);
        result.gate_trace = gates.gates.clone();
        if gates.verdict == Verdict::Fail {
            result.decision = Decision::Rollback;
            result.reason = Some("GATES_FAILED".to_string());
            self.counters.rollbacks += 1;
            self.telemetry.inc_gate_action("ROLLBACK");
            self.ledger.record(
                EventType::Rollback,
                json!({
                    "decision": "ROLLBACK",
                    "reason": "GATES_FAILED",
                    "cycle": self.state.cycle,
                    "failed_gates": gates.failed_gates,
                    "metrics": result.metrics.clone(),
                }),
                RecordOpts {
                    state_for_tag: Some(&self.state),
                    seed_state: Some(&self.rng.state()),
                    gate_trace: Some(&result.gate_trace),
                    ..Default::default()
                },
            )?;
            self.state = pre_state;
            json_log(
                Domain::Cycle,
                "rollback",
                obj(&[("reason", v_str("GATES_FAILED"))]),
            );
            return Ok(result);
        }

        // Evolution step, optionally refined by a one-dimensional search
        // over a learning-rate multiplier.
        let step = alpha * self.state.delta_linf;
        let mut lr_opt = 1.0;
        if self.cfg.fibonacci.enabled {
            let harmony = self.state.caos_harmony;
            let surrogate = |lr: f64| {
                let harm_bonus = 1.0 - ((harmony - PHI).abs() / PHI).min(1.0);
                step * lr * (1.0 + 0.1 * harm_bonus)
            };
            lr_opt = match self.cfg.fibonacci.search_method {
                SearchMethod::Fibonacci => {
                    self.toolkit.fibonacci_search(surrogate, 0.5, 2.0, 1e-6)
                }
                SearchMethod::Golden => {
                    self.toolkit.golden_section_search(surrogate, 0.5, 2.0, 1e-6)
                }
            };
            self.state.fib_optimizations += 1;
            self.ledger.record(
                EventType::FibonacciOpt,
                json!({"lr_opt": lr_opt, "opt_count": self.toolkit.optimization_count}),
                RecordOpts {
                    state_for_tag: Some(&self.state),
                    seed_state: Some(&self.rng.state()),
                    ..Default::default()
                },
            )?;
        }
        let step_opt = step * lr_opt;
        result.step = step_opt;

        // Apply the published coefficients and re-clamp.
        self.state.rsi += step_opt * 0.08;
        self.state.synergy += step_opt * 0.07;
        self.state.novelty += step_opt * 0.05;
        self.state.stability += step_opt * 0.06;
        self.state.viability += step_opt * 0.05;
        self.state.cost = (self.state.cost - step_opt * 0.03).max(0.0);
        self.state.c += step_opt * 0.04;
        self.state.a += step_opt * 0.05;
        self.state.o += step_opt * 0.03;
        self.state.s += step_opt * 0.02;
        self.state.c_cal += step_opt * 0.03;
        self.state.m += step_opt * 0.04;
        self.state.a_eff += step_opt * 0.05;
        self.state.clamp_unit_fields();

        if self.cfg.fibonacci.enabled && self.cfg.fibonacci.trust_region {
            let grow = self.cfg.fibonacci.trust_growth.unwrap_or(PHI.powf(0.125));
            let shrink = self.cfg.fibonacci.trust_shrink.unwrap_or(INV_PHI.powf(0.125));
            if self.state.delta_linf > 0.02 {
                self.state.trust_radius = (self.state.trust_radius * grow).min(0.5);
            } else {
                self.state.trust_radius = (self.state.trust_radius * shrink).max(0.01);
            }
        }

        if step_opt > 0.0 {
            result.decision = Decision::Promote;
            self.counters.promotions += 1;
            self.telemetry.inc_gate_action("PROMOTE");
            self.ledger.record_promote_attest(
                &pre_state,
                &self.state,
                &result.gate_trace,
                &self.rng.state(),
                &self.config_hash,
                step_opt,
            )?;
            json_log(
                Domain::Cycle,
                "promote",
                obj(&[
                    ("step", v_num(step_opt)),
                    ("delta_linf", v_num(self.state.delta_linf)),
                ]),
            );
        } else {
            result.decision = Decision::Rollback;
            result.reason = Some("NEGATIVE_STEP".to_string());
            self.counters.rollbacks += 1;
            self.telemetry.inc_gate_action("ROLLBACK");
            self.ledger.record(
                EventType::Rollback,
                json!({
                    "decision": "ROLLBACK",
                    "reason": "NEGATIVE_STEP",
                    "step": step_opt,
                    "alpha": alpha,
                    "delta_linf": self.state.delta_linf,
                }),
                RecordOpts {
                    state_for_tag: Some(&self.state),
                    seed_state: Some(&self.rng.state()),
                    ..Default::default()
                },
            )?;
            let cycle = self.state.cycle;
            self.state = pre_state.clone();
            self.state.cycle = cycle;
        }

        // Cycle bookkeeping and telemetry.
        self.state.cycle += 1;
        self.counters.cycles += 1;
        let elapsed = (self.clock.now_epoch() - t0).max(1e-6);
        self.state.latency_ms = elapsed * 1000.0;
        self.state.throughput = 1.0 / elapsed;

        if self.cfg.fibonacci.enabled && self.cfg.fibonacci.cache {
            if let Some(router) = &self.router {
                let l1 = self.l1_schedule.next();
                let l2 = self.l2_schedule.next();
                router
                    .cache()
                    .set_default_ttls(Duration::from_secs_f64(l1), Duration::from_secs_f64(l2));
                self.ledger.record(
                    EventType::FibonacciTick,
                    json!({"l1_ttl": l1, "l2_ttl": l2}),
                    RecordOpts::default(),
                )?;
            }
        }

        self.ledger.record(
            EventType::MasterEq,
            json!({
                "cycle": self.state.cycle,
                "metrics": result.metrics.clone(),
                "step": step_opt,
            }),
            RecordOpts {
                state_for_tag: Some(&self.state),
                seed_state: Some(&self.rng.state()),
                ..Default::default()
            },
        )?;

        Ok(result)
    }

    /// Chain verification plus live counters; the status surface.
    pub fn verify_integrity(&self) -> Result<(ChainStatus, EngineCounters)> {
        let status = self.ledger.verify_chain()?;
        Ok((status, self.counters.clone()))
    }

    pub fn save_snapshot(&mut self, tag: Option<&str>) -> Result<String> {
        let tail = self.ledger.tail_hash()?;
        let snap = SnapshotData {
            id: snapshot::snapshot_id(&self.state, &tail),
            tag: tag.map(|t| t.to_string()),
            ts: self.clock.now_rfc3339(),
            state: self.state.clone(),
            counters: self.counters.clone(),
            rng_state: self.rng.state(),
            tail_hash: tail,
            config_hash: self.config_hash.clone(),
        };
        let path = snapshot::save(&self.snapshot_dir, &snap)?;
        self.ledger.record(
            EventType::Snapshot,
            json!({"id": snap.id.clone(), "tag": snap.tag.clone(), "path": path.display().to_string()}),
            RecordOpts {
                state_for_tag: Some(&self.state),
                ..Default::default()
            },
        )?;
        Ok(snap.id)
    }

    pub fn load_snapshot(&mut self, id: &str) -> Result<()> {
        let snap = snapshot::load(&self.snapshot_dir, id)?;
        if snap.config_hash != self.config_hash {
            json_log(
                Domain::System,
                "snapshot_config_mismatch",
                obj(&[
                    ("snapshot", v_str(&snap.config_hash)),
                    ("current", v_str(&self.config_hash)),
                ]),
            );
        }
        self.state = snap.state;
        self.counters = snap.counters;
        self.rng.restore(&snap.rng_state);
        self.ledger.record(
            EventType::SeedSet,
            json!({"seed": snap.rng_state.seed, "call_count": snap.rng_state.call_count}),
            RecordOpts {
                seed_state: Some(&self.rng.state()),
                ..Default::default()
            },
        )?;
        Ok(())
    }

    /// Final snapshot, shutdown record, cache clear. Returns the snapshot id.
    pub fn shutdown(&mut self) -> Result<String> {
        let snap = self.save_snapshot(Some("shutdown"))?;
        self.ledger.record(
            EventType::Shutdown,
            json!({
                "snapshot": snap.clone(),
                "counters": self.counters.clone(),
                "final_seed_state": self.rng.state(),
            }),
            RecordOpts {
                state_for_tag: Some(&self.state),
                ..Default::default()
            },
        )?;
        if let Some(router) = &self.router {
            router.cache().clear();
        }
        json_log(Domain::System, "shutdown", obj(&[("snapshot", v_str(&snap))]));
        Ok(snap)
    }
}
