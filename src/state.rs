//! The evolving operating point of the engine.
//!
//! The state is exclusively owned by the cycle driver; every other component
//! sees an immutable view taken once per cycle. All fields declared as unit
//! interval are re-clamped on every write path, and the state hash excludes
//! the timestamp so replays of the same logical step hash identically.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineState {
    // Identity and time
    pub cycle: u64,
    pub ts: f64,

    // Headline score and its history
    pub l_inf: f64,
    pub l_inf_prev: f64,
    pub delta_linf: f64,

    // L∞ sub-metrics
    pub rsi: f64,
    pub synergy: f64,
    pub novelty: f64,
    pub stability: f64,
    pub viability: f64,
    pub cost: f64,

    // CAOS⁺ components and outputs
    pub c: f64,
    pub a: f64,
    pub o: f64,
    pub s: f64,
    pub caos_plus: f64,
    pub caos_harmony: f64,
    pub pattern_score: f64,
    pub pattern_stable: bool,

    // Reflexivity
    pub sr_score: f64,
    pub c_cal: f64,
    pub e_ok: f64,
    pub m: f64,
    pub a_eff: f64,

    // Coherence
    pub g_score: f64,
    pub modules: Vec<f64>,
    pub oci_score: f64,
    pub memory: f64,
    pub flow: f64,
    pub policy: f64,
    pub feedback: f64,

    // Ethical flags
    pub sigma_ok: bool,
    pub ece: f64,
    pub bias: f64,
    pub consent: bool,
    pub eco: bool,

    // Risk and resources
    pub rho: f64,
    pub uncertainty: f64,
    pub cpu: f64,
    pub mem: f64,

    // Telemetry
    pub throughput: f64,
    pub latency_ms: f64,

    // Control
    pub alpha_0: f64,
    pub alpha_omega: f64,
    pub trust_radius: f64,
    pub kill_switch: bool,
    pub fib_optimizations: u64,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            cycle: 0,
            ts: 0.0,
            l_inf: 0.0,
            l_inf_prev: 0.0,
            delta_linf: 0.0,
            rsi: 0.6,
            synergy: 0.6,
            novelty: 0.5,
            stability: 0.7,
            viability: 0.8,
            cost: 0.2,
            c: 0.6,
            a: 0.6,
            o: 0.6,
            s: 0.6,
            caos_plus: 1.0,
            caos_harmony: 1.0,
            pattern_score: 0.0,
            pattern_stable: false,
            sr_score: 1.0,
            c_cal: 0.8,
            e_ok: 1.0,
            m: 0.7,
            a_eff: 0.6,
            g_score: 1.0,
            modules: vec![0.7; 8],
            oci_score: 1.0,
            memory: 0.8,
            flow: 0.7,
            policy: 0.9,
            feedback: 0.6,
            sigma_ok: true,
            ece: 0.0,
            bias: 1.0,
            consent: true,
            eco: true,
            rho: 0.5,
            uncertainty: 0.3,
            cpu: 0.0,
            mem: 0.0,
            throughput: 0.0,
            latency_ms: 0.0,
            alpha_0: 0.1,
            alpha_omega: 0.0,
            trust_radius: 0.1,
            kill_switch: false,
            fib_optimizations: 0,
        }
    }
}

impl EngineState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge external metrics into the working state. Only known keys are
    /// applied; unknown keys are ignored. Unit-interval fields are clamped.
    pub fn merge_external(&mut self, metrics: &HashMap<String, f64>) {
        for (key, &v) in metrics {
            match key.as_str() {
                "rsi" => self.rsi = clamp01(v),
                "synergy" => self.synergy = clamp01(v),
                "novelty" => self.novelty = clamp01(v),
                "stability" => self.stability = clamp01(v),
                "viability" => self.viability = clamp01(v),
                "cost" => self.cost = clamp01(v),
                "c" => self.c = clamp01(v),
                "a" => self.a = clamp01(v),
                "o" => self.o = clamp01(v),
                "s" => self.s = clamp01(v),
                "c_cal" => self.c_cal = clamp01(v),
                "e_ok" => self.e_ok = clamp01(v),
                "m" => self.m = clamp01(v),
                "a_eff" => self.a_eff = clamp01(v),
                "memory" => self.memory = clamp01(v),
                "flow" => self.flow = clamp01(v),
                "policy" => self.policy = clamp01(v),
                "feedback" => self.feedback = clamp01(v),
                "ece" => self.ece = v.max(0.0),
                "bias" => self.bias = v.max(1.0),
                "rho" => self.rho = v.clamp(0.0, 0.999_999),
                "uncertainty" => self.uncertainty = clamp01(v),
                "consent" => self.consent = v != 0.0,
                "eco" => self.eco = v != 0.0,
                k if k.starts_with("module_") => {
                    if let Ok(idx) = k["module_".len()..].parse::<usize>() {
                        if idx < self.modules.len() {
                            self.modules[idx] = clamp01(v);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Re-clamp every unit-interval field after a mutation pass.
    pub fn clamp_unit_fields(&mut self) {
        self.rsi = clamp01(self.rsi);
        self.synergy = clamp01(self.synergy);
        self.novelty = clamp01(self.novelty);
        self.stability = clamp01(self.stability);
        self.viability = clamp01(self.viability);
        self.cost = clamp01(self.cost);
        self.c = clamp01(self.c);
        self.a = clamp01(self.a);
        self.o = clamp01(self.o);
        self.s = clamp01(self.s);
        self.c_cal = clamp01(self.c_cal);
        self.e_ok = clamp01(self.e_ok);
        self.m = clamp01(self.m);
        self.a_eff = clamp01(self.a_eff);
        self.memory = clamp01(self.memory);
        self.flow = clamp01(self.flow);
        self.policy = clamp01(self.policy);
        self.feedback = clamp01(self.feedback);
        self.uncertainty = clamp01(self.uncertainty);
        self.cpu = clamp01(self.cpu);
        self.mem = clamp01(self.mem);
        for m in &mut self.modules {
            *m = clamp01(*m);
        }
    }

    /// SHA-256 of the sorted-key JSON with the timestamp removed, so the
    /// same logical state hashes identically across replays.
    pub fn compute_hash(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.remove("ts");
        }
        let mut h = Sha256::new();
        h.update(value.to_string().as_bytes());
        hex::encode(h.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_known_keys_only() {
        let mut st = EngineState::new();
        let mut metrics = HashMap::new();
        metrics.insert("rsi".to_string(), 0.9);
        metrics.insert("bogus_key".to_string(), 123.0);
        st.merge_external(&metrics);
        assert_eq!(st.rsi, 0.9);
    }

    #[test]
    fn test_merge_clamps_unit_fields() {
        let mut st = EngineState::new();
        let mut metrics = HashMap::new();
        metrics.insert("synergy".to_string(), 4.2);
        metrics.insert("uncertainty".to_string(), -0.3);
        st.merge_external(&metrics);
        assert_eq!(st.synergy, 1.0);
        assert_eq!(st.uncertainty, 0.0);
    }

    #[test]
    fn test_merge_module_scores() {
        let mut st = EngineState::new();
        let mut metrics = HashMap::new();
        metrics.insert("module_0".to_string(), 0.95);
        metrics.insert("module_7".to_string(), 0.85);
        metrics.insert("module_9".to_string(), 0.5); // out of range, ignored
        st.merge_external(&metrics);
        assert_eq!(st.modules[0], 0.95);
        assert_eq!(st.modules[7], 0.85);
    }

    #[test]
    fn test_merge_bool_flags() {
        let mut st = EngineState::new();
        let mut metrics = HashMap::new();
        metrics.insert("consent".to_string(), 0.0);
        st.merge_external(&metrics);
        assert!(!st.consent);
    }

    #[test]
    fn test_hash_excludes_timestamp() {
        let mut a = EngineState::new();
        let mut b = EngineState::new();
        a.ts = 100.0;
        b.ts = 200.0;
        assert_eq!(a.compute_hash(), b.compute_hash());
    }

    #[test]
    fn test_hash_reflects_content() {
        let a = EngineState::new();
        let mut b = EngineState::new();
        b.rsi = 0.99;
        assert_ne!(a.compute_hash(), b.compute_hash());
        assert_eq!(a.compute_hash().len(), 64);
    }

    #[test]
    fn test_clamp_unit_fields() {
        let mut st = EngineState::new();
        st.rsi = 1.7;
        st.cost = -0.2;
        st.clamp_unit_fields();
        assert_eq!(st.rsi, 1.0);
        assert_eq!(st.cost, 0.0);
    }
}
