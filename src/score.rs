//! Deterministic score engine: the composite quality score and its
//! subcomponents, computed in a fixed order from a state view.
//!
//! Harmonic aggregation is used throughout so a single weak component drags
//! the aggregate down; no component can compensate for another.

use crate::config::{CaosPlusConfig, LinfConfig, OciConfig, OmegaSigmaConfig, SrOmegaConfig};
use crate::fibonacci::FibToolkit;
use crate::rng::DeterministicRng;
use crate::state::EngineState;

const EPS: f64 = 1e-6;

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

fn harmonic(components: &[(f64, f64)]) -> f64 {
    let denom: f64 = components.iter().map(|(v, w)| w / v.max(EPS)).sum();
    1.0 / denom.max(EPS)
}

/// Exponentially weighted moving average with a variance estimate, used to
/// decide whether the golden-ratio pattern signal has settled.
pub struct EwmaTracker {
    alpha: f64,
    min_samples: u32,
    value: Option<f64>,
    variance: f64,
    count: u32,
}

impl EwmaTracker {
    pub fn new(alpha: f64, min_samples: u32) -> Self {
        Self {
            alpha,
            min_samples,
            value: None,
            variance: 0.0,
            count: 0,
        }
    }

    pub fn update(&mut self, new_value: f64) {
        self.count += 1;
        match self.value {
            None => {
                self.value = Some(new_value);
                self.variance = 0.0;
            }
            Some(v) => {
                let delta = new_value - v;
                self.value = Some(v + self.alpha * delta);
                self.variance = (1.0 - self.alpha) * (self.variance + self.alpha * delta * delta);
            }
        }
    }

    pub fn is_stable(&self, threshold: f64) -> bool {
        self.count >= self.min_samples && self.variance < threshold
    }

    pub fn value(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }

    pub fn variance(&self) -> f64 {
        self.variance
    }
}

/// Bounded aggregate quality score, cost-penalised and zeroed when the
/// ethics or risk indicators fail.
pub struct LinfScorer {
    cfg: LinfConfig,
    rho_max: f64,
}

impl LinfScorer {
    pub fn new(cfg: LinfConfig, rho_max: f64) -> Self {
        Self { cfg, rho_max }
    }

    pub fn compute(&self, st: &mut EngineState) -> f64 {
        let w = &self.cfg;
        let base = harmonic(&[
            (st.rsi, w.w_rsi),
            (st.synergy, w.w_synergy),
            (st.novelty, w.w_novelty),
            (st.stability, w.w_stability),
            (st.viability, w.w_viability),
            (1.0 - st.cost, w.w_cost),
        ]);
        let penalty = (-w.lambda_c * st.cost).exp();
        let eth_gate = if st.sigma_ok { 1.0 } else { 0.0 };
        let risk_gate = if st.rho < self.rho_max { 1.0 } else { 0.0 };
        st.l_inf_prev = st.l_inf;
        st.l_inf = base * penalty * eth_gate * risk_gate;
        st.delta_linf = st.l_inf - st.l_inf_prev;
        st.l_inf
    }
}

/// `(1 + κ·C·A)^(O·S)` amplifier with a controlled chaos perturbation and an
/// EWMA-gated golden-ratio boost. The chaos draw is the only randomness in
/// the score engine and always consumes from the deterministic source.
pub struct CaosEngine {
    cfg: CaosPlusConfig,
    tracker: EwmaTracker,
}

impl CaosEngine {
    pub fn new(cfg: CaosPlusConfig) -> Self {
        let tracker = EwmaTracker::new(cfg.ewma_alpha, cfg.min_stability_cycles);
        Self { cfg, tracker }
    }

    pub fn compute(
        &mut self,
        st: &mut EngineState,
        toolkit: &FibToolkit,
        rng: &mut DeterministicRng,
    ) -> f64 {
        if rng.random() < self.cfg.chaos_probability {
            let fac = rng.uniform(0.9, 1.1);
            st.c *= fac;
            st.a *= fac;
            st.o *= fac;
            st.s *= fac;
        }

        let (c, a, o, s) = (
            st.c.max(0.0),
            st.a.max(0.0),
            st.o.max(0.0),
            st.s.max(0.0),
        );
        let base = 1.0 + self.cfg.kappa * c * a;
        let exponent = (o * s).clamp(self.cfg.pmin, self.cfg.pmax);
        let mut val = base.powf(exponent);

        let patt = toolkit.analyze_patterns(&[c, a, o, s]);
        self.tracker.update(patt.pattern_strength);

        // The boost is applied only once the pattern tracker reports stable,
        // and is hard-capped regardless of pattern strength.
        if self.tracker.is_stable(0.01) {
            val *= 1.0 + self.cfg.max_boost.min(0.1 * patt.pattern_strength);
            st.pattern_stable = true;
        } else {
            st.pattern_stable = false;
        }

        st.pattern_score = patt.pattern_strength;
        st.caos_plus = val;
        let os_sum = o + s;
        st.caos_harmony = (c + a) / if os_sum > 1e-9 { os_sum } else { 1.0 };
        val
    }
}

/// Reflexivity: weighted harmonic mean of calibration, ethical okness,
/// meta-awareness and autocorrection.
pub struct SrEngine {
    cfg: SrOmegaConfig,
}

impl SrEngine {
    pub fn new(cfg: SrOmegaConfig) -> Self {
        Self { cfg }
    }

    pub fn compute(&self, st: &mut EngineState) -> f64 {
        st.sr_score = harmonic(&[
            (st.c_cal, self.cfg.w_calibration),
            (st.e_ok, self.cfg.w_ethics),
            (st.m, self.cfg.w_meta),
            (st.a_eff, self.cfg.w_autocorrection),
        ]);
        st.sr_score
    }
}

/// Global coherence over the module score vector. A non-positive module
/// score zeroes the aggregate outright.
pub struct CoherenceEngine {
    cfg: OmegaSigmaConfig,
}

impl CoherenceEngine {
    pub fn new(cfg: OmegaSigmaConfig) -> Self {
        Self { cfg }
    }

    pub fn compute(&self, st: &mut EngineState) -> f64 {
        if st.modules.len() != self.cfg.weights.len() {
            st.modules = vec![0.7; self.cfg.weights.len()];
        }
        let mut denom = 0.0;
        for (w, s) in self.cfg.weights.iter().zip(st.modules.iter()) {
            if *s <= 0.0 {
                st.g_score = 0.0;
                return 0.0;
            }
            denom += w / s;
        }
        st.g_score = 1.0 / denom.max(EPS);
        st.g_score
    }
}

/// Organisational coherence over memory, flow, policy and feedback.
pub struct OciEngine {
    cfg: OciConfig,
}

impl OciEngine {
    pub fn new(cfg: OciConfig) -> Self {
        Self { cfg }
    }

    pub fn compute(&self, st: &mut EngineState) -> f64 {
        st.oci_score = harmonic(&[
            (st.memory, self.cfg.weights[0]),
            (st.flow, self.cfg.weights[1]),
            (st.policy, self.cfg.weights[2]),
            (st.feedback, self.cfg.weights[3]),
        ]);
        st.oci_score
    }
}

/// Effective step: base rate modulated by logistic-normalised gate scores,
/// clamped to [0, 1].
pub fn compute_alpha(
    st: &mut EngineState,
    alpha_0: f64,
    tau_sr: f64,
    tau_g: f64,
    tau_oci: f64,
) -> f64 {
    let caos_comp = sigmoid(2.0 * (st.caos_plus - 1.0));
    let sr_comp = sigmoid(5.0 * (st.sr_score - tau_sr));
    let g_comp = sigmoid(5.0 * (st.g_score - tau_g));
    let oci_comp = sigmoid(5.0 * (st.oci_score - tau_oci));
    st.alpha_omega = (alpha_0 * caos_comp * sr_comp * g_comp * oci_comp).clamp(0.0, 1.0);
    st.alpha_omega
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn engine_parts() -> (LinfScorer, CaosEngine, SrEngine, CoherenceEngine, OciEngine) {
        let cfg = EngineConfig::default();
        (
            LinfScorer::new(cfg.linf_placar.clone(), cfg.iric.rho_max),
            CaosEngine::new(cfg.caos_plus.clone()),
            SrEngine::new(cfg.sr_omega.clone()),
            CoherenceEngine::new(cfg.omega_sigma.clone()),
            OciEngine::new(cfg.oci.clone()),
        )
    }

    #[test]
    fn test_linf_in_unit_interval_and_publishes_delta() {
        let (linf, ..) = engine_parts();
        let mut st = EngineState::new();
        let v1 = linf.compute(&mut st);
        assert!((0.0..=1.0).contains(&v1));
        assert_eq!(st.delta_linf, v1);
        st.rsi = 0.9;
        let v2 = linf.compute(&mut st);
        assert_eq!(st.l_inf_prev, v1);
        assert!((st.delta_linf - (v2 - v1)).abs() < 1e-12);
    }

    #[test]
    fn test_linf_zeroed_when_ethics_fail() {
        let (linf, ..) = engine_parts();
        let mut st = EngineState::new();
        st.sigma_ok = false;
        assert_eq!(linf.compute(&mut st), 0.0);
    }

    #[test]
    fn test_linf_zeroed_when_risk_breached() {
        let (linf, ..) = engine_parts();
        let mut st = EngineState::new();
        st.rho = 0.96;
        assert_eq!(linf.compute(&mut st), 0.0);
    }

    #[test]
    fn test_caos_all_zero_is_one() {
        let mut cfg = EngineConfig::default().caos_plus;
        cfg.chaos_probability = 0.0;
        let mut caos = CaosEngine::new(cfg);
        let mut st = EngineState::new();
        st.c = 0.0;
        st.a = 0.0;
        st.o = 0.0;
        st.s = 0.0;
        let toolkit = FibToolkit::new();
        let mut rng = DeterministicRng::new(1);
        let v = caos.compute(&mut st, &toolkit, &mut rng);
        assert!((v - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_caos_all_one_kappa_twenty_is_twenty_one() {
        let mut cfg = EngineConfig::default().caos_plus;
        cfg.chaos_probability = 0.0;
        cfg.kappa = 20.0;
        let mut caos = CaosEngine::new(cfg);
        let mut st = EngineState::new();
        st.c = 1.0;
        st.a = 1.0;
        st.o = 1.0;
        st.s = 1.0;
        let toolkit = FibToolkit::new();
        let mut rng = DeterministicRng::new(1);
        let v = caos.compute(&mut st, &toolkit, &mut rng);
        assert!((v - 21.0).abs() < 1e-9, "got {v}");
    }

    #[test]
    fn test_caos_boost_requires_stability_window() {
        let mut cfg = EngineConfig::default().caos_plus;
        cfg.chaos_probability = 0.0;
        cfg.min_stability_cycles = 3;
        let mut caos = CaosEngine::new(cfg.clone());
        let toolkit = FibToolkit::new();
        let mut rng = DeterministicRng::new(1);
        let mut st = EngineState::new();

        // First calls: tracker not warm, no boost.
        caos.compute(&mut st, &toolkit, &mut rng);
        assert!(!st.pattern_stable);
        caos.compute(&mut st, &toolkit, &mut rng);
        caos.compute(&mut st, &toolkit, &mut rng);
        // Constant inputs give zero EWMA variance, so the window is the only
        // thing that was holding the boost back.
        assert!(st.pattern_stable);
        assert!(st.caos_plus > 0.0);
    }

    #[test]
    fn test_caos_boost_capped() {
        let mut cfg = EngineConfig::default().caos_plus;
        cfg.chaos_probability = 0.0;
        cfg.min_stability_cycles = 3;
        let mut caos = CaosEngine::new(cfg.clone());
        let toolkit = FibToolkit::new();
        let mut rng = DeterministicRng::new(1);
        let mut st = EngineState::new();
        let mut unboosted = 0.0;
        for _ in 0..5 {
            let base = 1.0 + cfg.kappa * st.c * st.a;
            unboosted = base.powf((st.o * st.s).clamp(cfg.pmin, cfg.pmax));
            caos.compute(&mut st, &toolkit, &mut rng);
        }
        assert!(st.pattern_stable);
        assert!(st.caos_plus <= unboosted * (1.0 + cfg.max_boost) + 1e-9);
    }

    #[test]
    fn test_chaos_perturbation_consumes_rng() {
        let mut cfg = EngineConfig::default().caos_plus;
        cfg.chaos_probability = 0.1;
        let mut caos = CaosEngine::new(cfg);
        let toolkit = FibToolkit::new();
        let mut rng = DeterministicRng::new(1);
        let mut st = EngineState::new();
        caos.compute(&mut st, &toolkit, &mut rng);
        assert!(rng.call_count() >= 1);
    }

    #[test]
    fn test_sr_is_harmonic_not_arithmetic() {
        let (_, _, sr, ..) = engine_parts();
        let mut st = EngineState::new();
        st.c_cal = 1.0;
        st.e_ok = 1.0;
        st.m = 1.0;
        st.a_eff = 0.01;
        let v = sr.compute(&mut st);
        // Harmonic mean punishes the weak component far below the 0.9
        // arithmetic mean would give.
        assert!(v < 0.5, "got {v}");
    }

    #[test]
    fn test_coherence_zeroed_by_dead_module() {
        let (.., gc, _) = engine_parts();
        let mut st = EngineState::new();
        st.modules[3] = 0.0;
        assert_eq!(gc.compute(&mut st), 0.0);
    }

    #[test]
    fn test_oci_uniform_inputs_equal_output() {
        let (.., oci) = engine_parts();
        let mut st = EngineState::new();
        st.memory = 0.8;
        st.flow = 0.8;
        st.policy = 0.8;
        st.feedback = 0.8;
        let v = oci.compute(&mut st);
        assert!((v - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_alpha_bounded_and_monotone_in_scores() {
        let mut st = EngineState::new();
        st.caos_plus = 1.5;
        st.sr_score = 0.9;
        st.g_score = 0.9;
        st.oci_score = 0.95;
        let hi = compute_alpha(&mut st, 0.1, 0.8, 0.85, 0.9);
        st.sr_score = 0.5;
        let lo = compute_alpha(&mut st, 0.1, 0.8, 0.85, 0.9);
        assert!((0.0..=1.0).contains(&hi));
        assert!(lo < hi);
    }

    #[test]
    fn test_ewma_tracker_stability() {
        let mut t = EwmaTracker::new(0.2, 3);
        t.update(0.5);
        assert!(!t.is_stable(0.01));
        t.update(0.5);
        t.update(0.5);
        assert!(t.is_stable(0.01));
        t.update(5.0);
        assert!(!t.is_stable(0.01));
    }
}
