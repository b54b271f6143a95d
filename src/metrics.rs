//! Metrics as a read-through projection: components record observations
//! into [`Telemetry`], and `render_prometheus` assembles the exposition
//! text from those observations plus live budget state. Nothing here is a
//! writable registry.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::router::budget::BudgetTracker;
use crate::state::EngineState;

pub const LATENCY_BUCKETS: [f64; 8] = [0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];
pub const COST_BUCKETS: [f64; 7] = [0.0001, 0.001, 0.01, 0.05, 0.1, 0.5, 1.0];

#[derive(Debug, Clone)]
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    pub fn new(buckets: &[f64]) -> Self {
        Self {
            buckets: buckets.to_vec(),
            counts: vec![0; buckets.len()],
            sum: 0.0,
            count: 0,
        }
    }

    pub fn observe(&mut self, v: f64) {
        for (i, b) in self.buckets.iter().enumerate() {
            if v <= *b {
                self.counts[i] += 1;
            }
        }
        self.sum += v;
        self.count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    fn render(&self, name: &str, labels: &str, out: &mut String) {
        for (b, c) in self.buckets.iter().zip(self.counts.iter()) {
            out.push_str(&format!("{name}_bucket{{{labels}le=\"{b}\"}} {c}\n"));
        }
        out.push_str(&format!(
            "{name}_bucket{{{labels}le=\"+Inf\"}} {}\n",
            self.count
        ));
        out.push_str(&format!("{name}_sum{{{labels}}} {}\n", self.sum));
        out.push_str(&format!("{name}_count{{{labels}}} {}\n", self.count));
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Gauges {
    l_inf: f64,
    caos_plus: f64,
    sr: f64,
    g: f64,
    delta_linf: f64,
}

#[derive(Default)]
struct Counters {
    gate_actions: HashMap<String, u64>,
    ethics_violations: HashMap<String, u64>,
    requests: HashMap<(String, String), u64>,
    latency: HashMap<String, Histogram>,
    cost: Option<Histogram>,
}

#[derive(Default)]
pub struct Telemetry {
    gauges: Mutex<Gauges>,
    counters: Mutex<Counters>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the score gauges from the post-cycle state.
    pub fn set_score_gauges(&self, st: &EngineState) {
        let mut g = self.gauges.lock().unwrap_or_else(|e| e.into_inner());
        g.l_inf = st.l_inf;
        g.caos_plus = st.caos_plus;
        g.sr = st.sr_score;
        g.g = st.g_score;
        g.delta_linf = st.delta_linf;
    }

    /// Count a cycle outcome: PROMOTE, ROLLBACK or BLOCK.
    pub fn inc_gate_action(&self, action: &str) {
        let mut c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        *c.gate_actions.entry(action.to_string()).or_insert(0) += 1;
    }

    pub fn gate_action_count(&self, action: &str) -> u64 {
        let c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        c.gate_actions.get(action).copied().unwrap_or(0)
    }

    pub fn inc_ethics_violation(&self, gate: &str) {
        let mut c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        *c.ethics_violations.entry(gate.to_string()).or_insert(0) += 1;
    }

    pub fn observe_request(&self, provider: &str, status: &str) {
        let mut c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        *c.requests
            .entry((provider.to_string(), status.to_string()))
            .or_insert(0) += 1;
    }

    pub fn observe_latency(&self, provider: &str, seconds: f64) {
        let mut c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        c.latency
            .entry(provider.to_string())
            .or_insert_with(|| Histogram::new(&LATENCY_BUCKETS))
            .observe(seconds);
    }

    pub fn observe_cost(&self, usd: f64) {
        let mut c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        c.cost
            .get_or_insert_with(|| Histogram::new(&COST_BUCKETS))
            .observe(usd);
    }

    /// Mean observed latency for a provider, if any, in seconds.
    pub fn mean_latency(&self, provider: &str) -> Option<f64> {
        let c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let h = c.latency.get(provider)?;
        if h.count == 0 {
            return None;
        }
        Some(h.sum / h.count as f64)
    }

    /// Prometheus text exposition of gauges, counters and histograms.
    pub fn render_prometheus(&self, budget: Option<&BudgetTracker>) -> String {
        let mut out = String::new();
        let g = *self.gauges.lock().unwrap_or_else(|e| e.into_inner());
        out.push_str(&format!("evoloop_linf {}\n", g.l_inf));
        out.push_str(&format!("evoloop_caos_plus {}\n", g.caos_plus));
        out.push_str(&format!("evoloop_sr {}\n", g.sr));
        out.push_str(&format!("evoloop_g {}\n", g.g));
        out.push_str(&format!("evoloop_delta_linf {}\n", g.delta_linf));

        if let Some(budget) = budget {
            let usage = budget.usage();
            out.push_str(&format!(
                "evoloop_daily_spend_usd {}\n",
                usage.spend_today_usd
            ));
            out.push_str(&format!(
                "evoloop_daily_remaining_usd {}\n",
                usage.remaining_usd
            ));
            out.push_str(&format!(
                "evoloop_budget_usage_percent {}\n",
                usage.usage_pct
            ));
            for (provider, stats) in budget.provider_breakdown() {
                out.push_str(&format!(
                    "evoloop_provider_requests_total{{provider=\"{provider}\"}} {}\n",
                    stats.requests_total
                ));
                out.push_str(&format!(
                    "evoloop_provider_cost_usd{{provider=\"{provider}\"}} {}\n",
                    stats.cost_total_usd
                ));
                out.push_str(&format!(
                    "evoloop_provider_success_rate{{provider=\"{provider}\"}} {}\n",
                    stats.success_rate()
                ));
            }
        }

        let c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        for (action, count) in &c.gate_actions {
            out.push_str(&format!(
                "evoloop_gate_outcomes_total{{action=\"{action}\"}} {count}\n"
            ));
        }
        for (gate, count) in &c.ethics_violations {
            out.push_str(&format!(
                "evoloop_ethics_violations_total{{gate=\"{gate}\"}} {count}\n"
            ));
        }
        for ((provider, status), count) in &c.requests {
            out.push_str(&format!(
                "evoloop_requests_total{{provider=\"{provider}\",status=\"{status}\"}} {count}\n"
            ));
        }
        for (provider, hist) in &c.latency {
            hist.render(
                "evoloop_request_latency_seconds",
                &format!("provider=\"{provider}\","),
                &mut out,
            );
        }
        if let Some(cost) = &c.cost {
            cost.render("evoloop_request_cost_usd", "", &mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_cumulative_buckets() {
        let mut h = Histogram::new(&[1.0, 5.0, 10.0]);
        h.observe(0.5);
        h.observe(3.0);
        h.observe(7.0);
        h.observe(100.0);
        assert_eq!(h.counts, vec![1, 2, 3]);
        assert_eq!(h.count, 4);
        assert!((h.sum - 110.5).abs() < 1e-9);
    }

    #[test]
    fn test_gate_action_counter() {
        let t = Telemetry::new();
        t.inc_gate_action("PROMOTE");
        t.inc_gate_action("PROMOTE");
        t.inc_gate_action("ROLLBACK");
        assert_eq!(t.gate_action_count("PROMOTE"), 2);
        assert_eq!(t.gate_action_count("ROLLBACK"), 1);
        assert_eq!(t.gate_action_count("BLOCK"), 0);
    }

    #[test]
    fn test_render_contains_expected_series() {
        let t = Telemetry::new();
        let st = EngineState::new();
        t.set_score_gauges(&st);
        t.observe_request("openai", "success");
        t.observe_latency("openai", 0.3);
        t.observe_cost(0.002);
        let text = t.render_prometheus(None);
        assert!(text.contains("evoloop_linf"));
        assert!(text.contains("evoloop_requests_total{provider=\"openai\",status=\"success\"} 1"));
        assert!(text.contains("evoloop_request_latency_seconds_bucket"));
        assert!(text.contains("evoloop_request_cost_usd_count"));
    }

    #[test]
    fn test_mean_latency() {
        let t = Telemetry::new();
        assert!(t.mean_latency("x").is_none());
        t.observe_latency("x", 1.0);
        t.observe_latency("x", 3.0);
        assert_eq!(t.mean_latency("x"), Some(2.0));
    }
}
