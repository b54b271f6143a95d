//! Non-compensatory safety gates.
//!
//! Every gate produces a structured outcome; the verdict is PASS only when
//! every gate passes. No weighting or averaging is ever applied, so a single
//! failing gate fails the whole evaluation no matter how far the others
//! exceed their thresholds.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::EngineConfig;
use crate::state::EngineState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateOutcome {
    pub gate: String,
    pub value: Value,
    pub threshold: Value,
    pub passed: bool,
    pub message: String,
}

impl GateOutcome {
    fn numeric(gate: &str, value: f64, threshold: f64, passed: bool, op: &str) -> Self {
        Self {
            gate: gate.to_string(),
            value: json!(value),
            threshold: json!(threshold),
            passed,
            message: format!("{gate}={value:.4} {op} {threshold}"),
        }
    }

    fn flag(gate: &str, value: bool, passed: bool) -> Self {
        Self {
            gate: gate.to_string(),
            value: json!(value),
            threshold: json!(true),
            passed,
            message: format!("{gate}={value}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardEvaluation {
    pub verdict: Verdict,
    pub gates: Vec<GateOutcome>,
    pub failed_gates: Vec<String>,
}

impl GuardEvaluation {
    fn from_gates(gates: Vec<GateOutcome>) -> Self {
        let failed_gates: Vec<String> = gates
            .iter()
            .filter(|g| !g.passed)
            .map(|g| g.gate.clone())
            .collect();
        let verdict = if failed_gates.is_empty() {
            Verdict::Pass
        } else {
            Verdict::Fail
        };
        Self {
            verdict,
            gates,
            failed_gates,
        }
    }
}

pub struct SigmaGuard {
    cfg: EngineConfig,
}

impl SigmaGuard {
    pub fn new(cfg: EngineConfig) -> Self {
        Self { cfg }
    }

    fn gate_contractivity(&self, st: &EngineState) -> GateOutcome {
        let passed = st.rho < self.cfg.iric.rho_max;
        GateOutcome::numeric(
            "contractivity",
            st.rho,
            self.cfg.iric.rho_max,
            passed,
            if passed { "<" } else { ">=" },
        )
    }

    fn gate_calibration(&self, st: &EngineState) -> GateOutcome {
        let passed = st.ece <= self.cfg.ethics.ece_max;
        GateOutcome::numeric(
            "calibration",
            st.ece,
            self.cfg.ethics.ece_max,
            passed,
            if passed { "<=" } else { ">" },
        )
    }

    fn gate_bias(&self, st: &EngineState) -> GateOutcome {
        let passed = st.bias <= self.cfg.ethics.rho_bias_max;
        GateOutcome::numeric(
            "bias",
            st.bias,
            self.cfg.ethics.rho_bias_max,
            passed,
            if passed { "<=" } else { ">" },
        )
    }

    fn gate_reflexivity(&self, st: &EngineState) -> GateOutcome {
        let passed = st.sr_score >= self.cfg.sr_omega.tau_sr;
        GateOutcome::numeric(
            "reflexivity",
            st.sr_score,
            self.cfg.sr_omega.tau_sr,
            passed,
            if passed { ">=" } else { "<" },
        )
    }

    fn gate_coherence(&self, st: &EngineState) -> GateOutcome {
        let passed = st.g_score >= self.cfg.omega_sigma.tau_g;
        GateOutcome::numeric(
            "coherence",
            st.g_score,
            self.cfg.omega_sigma.tau_g,
            passed,
            if passed { ">=" } else { "<" },
        )
    }

    fn gate_improvement(&self, st: &EngineState) -> GateOutcome {
        let passed = st.delta_linf >= self.cfg.thresholds.beta_min;
        GateOutcome::numeric(
            "improvement",
            st.delta_linf,
            self.cfg.thresholds.beta_min,
            passed,
            if passed { ">=" } else { "<" },
        )
    }

    fn gate_cost(&self, st: &EngineState) -> GateOutcome {
        let limit = 1.10 * self.cfg.thresholds.cost_budget;
        let passed = st.cost <= limit;
        GateOutcome::numeric("cost", st.cost, limit, passed, if passed { "<=" } else { ">" })
    }

    fn gate_kappa(&self) -> GateOutcome {
        let passed = self.cfg.caos_plus.kappa >= 20.0;
        GateOutcome::numeric(
            "kappa",
            self.cfg.caos_plus.kappa,
            20.0,
            passed,
            if passed { ">=" } else { "<" },
        )
    }

    fn gate_consent(&self, st: &EngineState) -> GateOutcome {
        let passed = !self.cfg.ethics.consent_required || st.consent;
        GateOutcome::flag("consent", st.consent, passed)
    }

    fn gate_ecological(&self, st: &EngineState) -> GateOutcome {
        let passed = !self.cfg.ethics.eco_ok_required || st.eco;
        GateOutcome::flag("ecological", st.eco, passed)
    }

    fn gate_uncertainty(&self, st: &EngineState) -> GateOutcome {
        let passed = st.uncertainty < 0.9;
        GateOutcome::numeric(
            "uncertainty",
            st.uncertainty,
            0.9,
            passed,
            if passed { "<" } else { ">=" },
        )
    }

    fn gate_cpu(&self, st: &EngineState) -> GateOutcome {
        let passed = st.cpu < 0.95;
        GateOutcome::numeric("cpu", st.cpu, 0.95, passed, if passed { "<" } else { ">=" })
    }

    fn gate_mem(&self, st: &EngineState) -> GateOutcome {
        let passed = st.mem < 0.95;
        GateOutcome::numeric("mem", st.mem, 0.95, passed, if passed { "<" } else { ">=" })
    }

    /// The full ten-gate stack in its fixed order.
    pub fn evaluate(&self, st: &EngineState) -> GuardEvaluation {
        GuardEvaluation::from_gates(vec![
            self.gate_contractivity(st),
            self.gate_calibration(st),
            self.gate_bias(st),
            self.gate_reflexivity(st),
            self.gate_coherence(st),
            self.gate_improvement(st),
            self.gate_cost(st),
            self.gate_kappa(),
            self.gate_consent(st),
            self.gate_ecological(st),
        ])
    }

    /// Ethics sub-gate checked before any score computation: calibration,
    /// bias, consent, ecological, contractivity.
    pub fn ethics_subgate(&self, st: &EngineState) -> GuardEvaluation {
        GuardEvaluation::from_gates(vec![
            self.gate_calibration(st),
            self.gate_bias(st),
            self.gate_consent(st),
            self.gate_ecological(st),
            self.gate_contractivity(st),
        ])
    }

    /// Risk/resource sub-gate: contractivity, uncertainty, cpu, mem.
    pub fn risk_subgate(&self, st: &EngineState) -> GuardEvaluation {
        GuardEvaluation::from_gates(vec![
            self.gate_contractivity(st),
            self.gate_uncertainty(st),
            self.gate_cpu(st),
            self.gate_mem(st),
        ])
    }

    /// Gates evaluated after scoring, before an evolution step is applied:
    /// the stack entries not already covered by the ethics and risk
    /// sub-gates, in stack order.
    pub fn promotion_gates(&self, st: &EngineState) -> GuardEvaluation {
        GuardEvaluation::from_gates(vec![
            self.gate_reflexivity(st),
            self.gate_coherence(st),
            self.gate_improvement(st),
            self.gate_cost(st),
            self.gate_kappa(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passing_state() -> EngineState {
        let mut st = EngineState::new();
        st.rho = 0.5;
        st.ece = 0.005;
        st.bias = 1.0;
        st.sr_score = 0.9;
        st.g_score = 0.9;
        st.oci_score = 0.95;
        st.caos_plus = 1.5;
        st.delta_linf = 0.05;
        st.cost = 0.2;
        st.consent = true;
        st.eco = true;
        st
    }

    #[test]
    fn test_all_gates_pass() {
        let guard = SigmaGuard::new(EngineConfig::default());
        let eval = guard.evaluate(&passing_state());
        assert_eq!(eval.verdict, Verdict::Pass);
        assert_eq!(eval.gates.len(), 10);
        assert!(eval.failed_gates.is_empty());
    }

    #[test]
    fn test_single_failure_fails_verdict() {
        let guard = SigmaGuard::new(EngineConfig::default());
        let mut st = passing_state();
        // Every other gate passes with margin; one failure is enough.
        st.sr_score = 1.0;
        st.g_score = 1.0;
        st.ece = 0.5;
        let eval = guard.evaluate(&st);
        assert_eq!(eval.verdict, Verdict::Fail);
        assert_eq!(eval.failed_gates, vec!["calibration".to_string()]);
    }

    #[test]
    fn test_gate_order_is_fixed() {
        let guard = SigmaGuard::new(EngineConfig::default());
        let names: Vec<String> = guard
            .evaluate(&passing_state())
            .gates
            .into_iter()
            .map(|g| g.gate)
            .collect();
        assert_eq!(
            names,
            vec![
                "contractivity",
                "calibration",
                "bias",
                "reflexivity",
                "coherence",
                "improvement",
                "cost",
                "kappa",
                "consent",
                "ecological"
            ]
        );
    }

    #[test]
    fn test_contractivity_boundary_is_exclusive() {
        let guard = SigmaGuard::new(EngineConfig::default());
        let mut st = passing_state();
        st.rho = 0.95;
        let eval = guard.evaluate(&st);
        assert!(eval.failed_gates.contains(&"contractivity".to_string()));
    }

    #[test]
    fn test_consent_not_required_passes_when_false() {
        let mut cfg = EngineConfig::default();
        cfg.ethics.consent_required = false;
        let guard = SigmaGuard::new(cfg);
        let mut st = passing_state();
        st.consent = false;
        assert_eq!(guard.evaluate(&st).verdict, Verdict::Pass);
    }

    #[test]
    fn test_risk_subgate_fail_closed_resources() {
        let guard = SigmaGuard::new(EngineConfig::default());
        let mut st = passing_state();
        st.cpu = 0.99;
        st.mem = 0.99;
        let eval = guard.risk_subgate(&st);
        assert_eq!(eval.verdict, Verdict::Fail);
        assert!(eval.failed_gates.contains(&"cpu".to_string()));
        assert!(eval.failed_gates.contains(&"mem".to_string()));
    }

    #[test]
    fn test_uncertainty_guard() {
        let guard = SigmaGuard::new(EngineConfig::default());
        let mut st = passing_state();
        st.uncertainty = 0.9;
        assert_eq!(guard.risk_subgate(&st).verdict, Verdict::Fail);
    }

    #[test]
    fn test_ethics_subgate_trips_on_bias() {
        let guard = SigmaGuard::new(EngineConfig::default());
        let mut st = passing_state();
        st.bias = 1.2;
        let eval = guard.ethics_subgate(&st);
        assert_eq!(eval.verdict, Verdict::Fail);
        assert_eq!(eval.failed_gates, vec!["bias".to_string()]);
    }

    #[test]
    fn test_promotion_gates_cover_remaining_stack() {
        let guard = SigmaGuard::new(EngineConfig::default());
        let names: Vec<String> = guard
            .promotion_gates(&passing_state())
            .gates
            .into_iter()
            .map(|g| g.gate)
            .collect();
        // Exactly the stack entries the ethics and risk sub-gates skip.
        assert_eq!(
            names,
            vec!["reflexivity", "coherence", "improvement", "cost", "kappa"]
        );
    }

    #[test]
    fn test_kappa_gate_reads_config() {
        let mut cfg = EngineConfig::default();
        cfg.caos_plus.kappa = 10.0;
        let guard = SigmaGuard::new(cfg);
        let eval = guard.promotion_gates(&passing_state());
        assert!(eval.failed_gates.contains(&"kappa".to_string()));
    }
}
