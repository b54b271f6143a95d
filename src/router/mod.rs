//! Cost-aware provider routing with budget governance, per-provider circuit
//! breakers, a tiered response cache and serial cost-ascending fallback.
//!
//! Dispatch order per request: budget first, breaker filter second, cache
//! third. A cache hit accounts no new cost. Operational failures are
//! absorbed here; callers only ever see a structured error once every
//! alternate is exhausted.

pub mod breaker;
pub mod budget;
pub mod cache;
pub mod pricing;
pub mod provider;

use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::logging::{json_log, obj, v_num, v_str, Domain};
use crate::metrics::Telemetry;
use breaker::{BreakerConfig, BreakerMap, CircuitState};
use budget::BudgetTracker;
use cache::TieredCache;
use provider::{ChatRequest, ChatResponse, Provider};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("daily budget hard limit reached")]
    BudgetExhausted,
    #[error("no provider available")]
    NoProvider,
    #[error("all providers failed: {summary}")]
    AllProvidersFailed { summary: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    Cheapest,
    BestValue,
    Fastest,
    Balanced,
}

impl SelectionStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cheapest" => Some(Self::Cheapest),
            "best_value" => Some(Self::BestValue),
            "fastest" => Some(Self::Fastest),
            "balanced" => Some(Self::Balanced),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub strategy: SelectionStrategy,
    /// Per-provider deadline for a single dispatch.
    pub deadline: Duration,
    pub max_fallbacks: usize,
    pub cache_ttl: Duration,
    /// Balanced-strategy weights over cost, quality, latency, availability.
    pub balanced_weights: [f64; 4],
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::BestValue,
            deadline: Duration::from_secs(30),
            max_fallbacks: 3,
            cache_ttl: Duration::from_secs(3600),
            balanced_weights: [0.4, 0.3, 0.2, 0.1],
        }
    }
}

pub struct ProviderRouter {
    providers: Vec<Arc<dyn Provider>>,
    cfg: RouterConfig,
    budget: Arc<BudgetTracker>,
    breakers: BreakerMap,
    cache: TieredCache,
    telemetry: Arc<Telemetry>,
}

fn cache_key(req: &ChatRequest) -> String {
    let value = serde_json::to_value(req).unwrap_or_default();
    let mut h = Sha256::new();
    h.update(value.to_string().as_bytes());
    hex::encode(h.finalize())
}

impl ProviderRouter {
    pub fn new(
        providers: Vec<Arc<dyn Provider>>,
        cfg: RouterConfig,
        budget: Arc<BudgetTracker>,
        breaker_cfg: BreakerConfig,
        cache: TieredCache,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            providers,
            cfg,
            budget,
            breakers: BreakerMap::new(breaker_cfg),
            cache,
            telemetry,
        }
    }

    pub fn budget(&self) -> &BudgetTracker {
        &self.budget
    }

    pub fn breakers(&self) -> &BreakerMap {
        &self.breakers
    }

    pub fn cache(&self) -> &TieredCache {
        &self.cache
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Estimated USD cost of one request to this provider: observed average
    /// when history exists, static pricing otherwise.
    fn estimated_cost(&self, p: &Arc<dyn Provider>) -> f64 {
        let stats = self.budget.provider_breakdown();
        if let Some(s) = stats.get(p.name()) {
            if s.requests_total > 0 {
                return s.cost_total_usd / s.requests_total as f64;
            }
        }
        pricing::blended_rate(p.model())
    }

    fn observed_latency(&self, p: &Arc<dyn Provider>) -> f64 {
        self.telemetry.mean_latency(p.name()).unwrap_or(0.1)
    }

    fn availability(&self, p: &Arc<dyn Provider>) -> f64 {
        let stats = self.budget.provider_breakdown();
        match stats.get(p.name()) {
            Some(s) if s.requests_total > 0 => s.success_rate(),
            _ => 1.0,
        }
    }

    /// Rank the candidates according to the configured strategy, best first.
    fn rank(&self, candidates: &[Arc<dyn Provider>]) -> Vec<Arc<dyn Provider>> {
        let mut scored: Vec<(f64, Arc<dyn Provider>)> = match self.cfg.strategy {
            SelectionStrategy::Cheapest => candidates
                .iter()
                .map(|p| (-self.estimated_cost(p), p.clone()))
                .collect(),
            SelectionStrategy::Fastest => candidates
                .iter()
                .map(|p| (-self.observed_latency(p), p.clone()))
                .collect(),
            SelectionStrategy::BestValue => candidates
                .iter()
                .map(|p| {
                    let quality = pricing::baseline_quality(p.name());
                    (quality / (self.estimated_cost(p) + 1e-6), p.clone())
                })
                .collect(),
            SelectionStrategy::Balanced => {
                let costs: Vec<f64> = candidates.iter().map(|p| self.estimated_cost(p)).collect();
                let lats: Vec<f64> = candidates.iter().map(|p| self.observed_latency(p)).collect();
                let norm = |v: f64, values: &[f64]| -> f64 {
                    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
                    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                    if (max - min).abs() < 1e-12 {
                        1.0
                    } else {
                        1.0 - (v - min) / (max - min)
                    }
                };
                let [wc, wq, wl, wa] = self.cfg.balanced_weights;
                candidates
                    .iter()
                    .enumerate()
                    .map(|(i, p)| {
                        let score = norm(costs[i], &costs) * wc
                            + pricing::baseline_quality(p.name()) * wq
                            + norm(lats[i], &lats) * wl
                            + self.availability(p) * wa;
                        (score, p.clone())
                    })
                    .collect()
            }
        };
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(_, p)| p).collect()
    }

    async fn dispatch_one(
        &self,
        p: &Arc<dyn Provider>,
        req: &ChatRequest,
    ) -> Result<ChatResponse, String> {
        match tokio::time::timeout(self.cfg.deadline, p.chat(req)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("deadline {}s exceeded", self.cfg.deadline.as_secs())),
        }
    }

    /// Route one chat request: budget gate, breaker filter, cache lookup,
    /// ranked dispatch and serial cost-ascending fallback.
    pub async fn ask(&self, req: &ChatRequest) -> Result<ChatResponse, RouterError> {
        if self.budget.is_hard_limit_reached() {
            self.telemetry.observe_request("router", "budget_blocked");
            return Err(RouterError::BudgetExhausted);
        }

        let candidates: Vec<Arc<dyn Provider>> = self
            .providers
            .iter()
            .filter(|p| self.breakers.state(p.name()) != CircuitState::Open)
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Err(RouterError::NoProvider);
        }

        let key = cache_key(req);
        if let Some(value) = self.cache.get(&key) {
            if let Ok(resp) = serde_json::from_value::<ChatResponse>(value) {
                self.telemetry.observe_request(&resp.provider, "cache_hit");
                return Ok(resp);
            }
        }

        let ranked = self.rank(&candidates);
        let primary = ranked[0].clone();

        if !self.budget.can_proceed(self.estimated_cost(&primary)) {
            self.telemetry.observe_request(primary.name(), "budget_blocked");
            return Err(RouterError::BudgetExhausted);
        }

        // Primary first, then up to N alternates in cost-ascending order,
        // excluding the primary and anything whose breaker is OPEN.
        let mut alternates: Vec<Arc<dyn Provider>> = ranked
            .iter()
            .skip(1)
            .filter(|p| self.breakers.state(p.name()) != CircuitState::Open)
            .cloned()
            .collect();
        alternates.sort_by(|a, b| {
            self.estimated_cost(a)
                .partial_cmp(&self.estimated_cost(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        alternates.truncate(self.cfg.max_fallbacks);

        let mut attempts: Vec<String> = Vec::new();
        for (i, p) in std::iter::once(primary).chain(alternates).enumerate() {
            // Claims the half-open probe slot when applicable.
            if !self.breakers.can_execute(p.name()) {
                continue;
            }
            match self.dispatch_one(&p, req).await {
                Ok(resp) => {
                    self.budget.record_request(
                        p.name(),
                        resp.cost_usd,
                        resp.tokens_in + resp.tokens_out,
                        true,
                    );
                    self.breakers.record_success(p.name());
                    self.telemetry.observe_request(p.name(), "success");
                    self.telemetry.observe_latency(p.name(), resp.latency_s);
                    self.telemetry.observe_cost(resp.cost_usd);
                    if let Ok(value) = serde_json::to_value(&resp) {
                        self.cache.put(&key, value, Some(self.cfg.cache_ttl));
                    }
                    json_log(
                        Domain::Router,
                        "dispatch",
                        obj(&[
                            ("provider", v_str(p.name())),
                            ("attempt", v_num((i + 1) as f64)),
                            ("cost_usd", v_num(resp.cost_usd)),
                            ("latency_s", v_num(resp.latency_s)),
                        ]),
                    );
                    return Ok(resp);
                }
                Err(err) => {
                    // Cancellations and timeouts account zero cost, zero
                    // tokens, but still count against breaker and budget.
                    self.budget.record_request(p.name(), 0.0, 0, false);
                    self.breakers.record_failure(p.name());
                    self.telemetry.observe_request(p.name(), "failure");
                    json_log(
                        Domain::Router,
                        "dispatch_failed",
                        obj(&[("provider", v_str(p.name())), ("error", v_str(&err))]),
                    );
                    attempts.push(format!("{}: {}", p.name(), err));
                }
            }
        }

        Err(RouterError::AllProvidersFailed {
            summary: attempts.join("; "),
        })
    }

    /// Current breaker states keyed by provider, for the status surface.
    pub fn breaker_states(&self) -> serde_json::Value {
        json!(self.breakers.all_states())
    }
}
