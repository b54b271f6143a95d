//! Validated engine configuration.
//!
//! Every group is range-checked and every weight vector must sum to 1.0
//! within ±0.01. A violation is fatal at startup and surfaces as a single
//! structured [`ConfigError`] naming the group, key and violated bound.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{group}.{key}={value} outside [{min}, {max}]")]
    Range {
        group: &'static str,
        key: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("{group} weights sum to {total}, expected 1.0 ± 0.01")]
    WeightSum { group: &'static str, total: f64 },
    #[error("config parse error: {0}")]
    Parse(String),
}

fn check_range(
    group: &'static str,
    key: &'static str,
    value: f64,
    min: f64,
    max: f64,
) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::Range {
            group,
            key,
            value,
            min,
            max,
        });
    }
    Ok(())
}

fn check_weight_sum(group: &'static str, weights: &[f64]) -> Result<(), ConfigError> {
    let total: f64 = weights.iter().sum();
    if (total - 1.0).abs() > 0.01 {
        return Err(ConfigError::WeightSum { group, total });
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EthicsConfig {
    pub ece_max: f64,
    pub rho_bias_max: f64,
    pub consent_required: bool,
    pub eco_ok_required: bool,
}

impl Default for EthicsConfig {
    fn default() -> Self {
        Self {
            ece_max: 0.01,
            rho_bias_max: 1.05,
            consent_required: true,
            eco_ok_required: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IricConfig {
    pub rho_max: f64,
    pub contraction_factor: f64,
}

impl Default for IricConfig {
    fn default() -> Self {
        Self {
            rho_max: 0.95,
            contraction_factor: 0.98,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaosPlusConfig {
    pub kappa: f64,
    pub pmin: f64,
    pub pmax: f64,
    pub chaos_probability: f64,
    pub max_boost: f64,
    pub ewma_alpha: f64,
    pub min_stability_cycles: u32,
}

impl Default for CaosPlusConfig {
    fn default() -> Self {
        Self {
            kappa: 20.0,
            pmin: 0.05,
            pmax: 2.0,
            chaos_probability: 0.01,
            max_boost: 0.05,
            ewma_alpha: 0.2,
            min_stability_cycles: 5,
        }
    }
}

/// Weights over {calibration, ethical okness, meta-awareness, autocorrection}.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SrOmegaConfig {
    pub w_calibration: f64,
    pub w_ethics: f64,
    pub w_meta: f64,
    pub w_autocorrection: f64,
    pub tau_sr: f64,
}

impl Default for SrOmegaConfig {
    fn default() -> Self {
        Self {
            w_calibration: 0.2,
            w_ethics: 0.4,
            w_meta: 0.3,
            w_autocorrection: 0.1,
            tau_sr: 0.80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OmegaSigmaConfig {
    pub weights: Vec<f64>,
    pub tau_g: f64,
}

impl Default for OmegaSigmaConfig {
    fn default() -> Self {
        Self {
            weights: vec![1.0 / 8.0; 8],
            tau_g: 0.85,
        }
    }
}

/// Weights over {memory, flow, policy, feedback}.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OciConfig {
    pub weights: Vec<f64>,
    pub tau_oci: f64,
}

impl Default for OciConfig {
    fn default() -> Self {
        Self {
            weights: vec![0.25; 4],
            tau_oci: 0.9,
        }
    }
}

/// Weights over {rsi, synergy, novelty, stability, viability, cost}.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinfConfig {
    pub w_rsi: f64,
    pub w_synergy: f64,
    pub w_novelty: f64,
    pub w_stability: f64,
    pub w_viability: f64,
    pub w_cost: f64,
    pub lambda_c: f64,
}

impl Default for LinfConfig {
    fn default() -> Self {
        Self {
            w_rsi: 0.2,
            w_synergy: 0.2,
            w_novelty: 0.2,
            w_stability: 0.2,
            w_viability: 0.15,
            w_cost: 0.05,
            lambda_c: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMethod {
    Fibonacci,
    Golden,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FibonacciConfig {
    pub enabled: bool,
    pub cache: bool,
    pub trust_region: bool,
    pub l1_ttl_base: f64,
    pub l2_ttl_base: f64,
    pub max_interval_s: f64,
    pub trust_growth: Option<f64>,
    pub trust_shrink: Option<f64>,
    pub search_method: SearchMethod,
}

impl Default for FibonacciConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cache: true,
            trust_region: true,
            l1_ttl_base: 1.0,
            l2_ttl_base: 60.0,
            max_interval_s: 300.0,
            trust_growth: None,
            trust_shrink: None,
            search_method: SearchMethod::Fibonacci,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdsConfig {
    pub tau_caos: f64,
    pub beta_min: f64,
    /// Normalized cost budget the cost gate compares against (×1.10 slack).
    pub cost_budget: f64,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            tau_caos: 0.7,
            beta_min: 0.01,
            cost_budget: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    pub alpha_0: f64,
    pub seed: Option<u64>,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            alpha_0: 0.1,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub ethics: EthicsConfig,
    pub iric: IricConfig,
    pub caos_plus: CaosPlusConfig,
    pub sr_omega: SrOmegaConfig,
    pub omega_sigma: OmegaSigmaConfig,
    pub oci: OciConfig,
    pub linf_placar: LinfConfig,
    pub fibonacci: FibonacciConfig,
    pub thresholds: ThresholdsConfig,
    pub evolution: EvolutionConfig,
}

impl EngineConfig {
    /// Parse from a JSON document and validate. Missing groups and keys
    /// fall back to defaults.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let cfg: EngineConfig =
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from `EVOLOOP_CONFIG` (a JSON file path) when set, defaults
    /// otherwise; `EVOLOOP_SEED` overrides the configured seed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = match std::env::var("EVOLOOP_CONFIG") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| ConfigError::Parse(format!("{path}: {e}")))?;
                Self::from_json(&raw)?
            }
            Err(_) => Self::default(),
        };
        if let Ok(seed) = std::env::var("EVOLOOP_SEED") {
            cfg.evolution.seed = seed.parse().ok();
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let e = &self.ethics;
        check_range("ethics", "ece_max", e.ece_max, 0.0, 1.0)?;
        check_range("ethics", "rho_bias_max", e.rho_bias_max, 1.0, 2.0)?;

        let i = &self.iric;
        check_range("iric", "rho_max", i.rho_max, 0.0, 1.0)?;
        check_range("iric", "contraction_factor", i.contraction_factor, 0.5, 1.0)?;

        let c = &self.caos_plus;
        check_range("caos_plus", "kappa", c.kappa, 0.0, 50.0)?;
        check_range("caos_plus", "pmin", c.pmin, 0.0, 1.0)?;
        check_range("caos_plus", "pmax", c.pmax, 1.0, 10.0)?;
        check_range("caos_plus", "chaos_probability", c.chaos_probability, 0.0, 0.1)?;
        check_range("caos_plus", "max_boost", c.max_boost, 0.0, 0.1)?;
        check_range("caos_plus", "ewma_alpha", c.ewma_alpha, 0.1, 0.5)?;
        check_range(
            "caos_plus",
            "min_stability_cycles",
            c.min_stability_cycles as f64,
            3.0,
            20.0,
        )?;

        let sr = &self.sr_omega;
        check_weight_sum(
            "sr_omega",
            &[sr.w_calibration, sr.w_ethics, sr.w_meta, sr.w_autocorrection],
        )?;
        check_range("sr_omega", "tau_sr", sr.tau_sr, 0.0, 1.0)?;

        let os = &self.omega_sigma;
        if os.weights.len() != 8 {
            return Err(ConfigError::Parse(format!(
                "omega_sigma.weights must have 8 entries, got {}",
                os.weights.len()
            )));
        }
        check_weight_sum("omega_sigma", &os.weights)?;
        check_range("omega_sigma", "tau_g", os.tau_g, 0.0, 1.0)?;

        let oc = &self.oci;
        if oc.weights.len() != 4 {
            return Err(ConfigError::Parse(format!(
                "oci.weights must have 4 entries, got {}",
                oc.weights.len()
            )));
        }
        check_weight_sum("oci", &oc.weights)?;
        check_range("oci", "tau_oci", oc.tau_oci, 0.0, 1.0)?;

        let l = &self.linf_placar;
        check_weight_sum(
            "linf_placar",
            &[l.w_rsi, l.w_synergy, l.w_novelty, l.w_stability, l.w_viability, l.w_cost],
        )?;
        check_range("linf_placar", "lambda_c", l.lambda_c, 0.0, 1.0)?;

        let f = &self.fibonacci;
        check_range("fibonacci", "l1_ttl_base", f.l1_ttl_base, 0.1, 60.0)?;
        check_range("fibonacci", "l2_ttl_base", f.l2_ttl_base, 1.0, 3600.0)?;
        check_range("fibonacci", "max_interval_s", f.max_interval_s, 60.0, 3600.0)?;
        if let Some(g) = f.trust_growth {
            check_range("fibonacci", "trust_growth", g, 1.0, 2.0)?;
        }
        if let Some(s) = f.trust_shrink {
            check_range("fibonacci", "trust_shrink", s, 0.5, 1.0)?;
        }

        let t = &self.thresholds;
        check_range("thresholds", "tau_caos", t.tau_caos, 0.0, 1.0)?;
        check_range("thresholds", "beta_min", t.beta_min, 0.0, 0.1)?;
        check_range("thresholds", "cost_budget", t.cost_budget, 0.0, 1.0)?;

        let ev = &self.evolution;
        check_range("evolution", "alpha_0", ev.alpha_0, 0.01, 1.0)?;

        Ok(())
    }

    /// Short hash identifying this configuration in attestation records.
    pub fn config_hash(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or_default();
        let mut h = Sha256::new();
        h.update(value.to_string().as_bytes());
        hex::encode(h.finalize())[..16].to_string()
    }
}

/// Root directory for ledger, snapshots and cache files.
pub fn root_dir() -> std::path::PathBuf {
    match std::env::var("EVOLOOP_ROOT") {
        Ok(p) => std::path::PathBuf::from(p),
        Err(_) => std::path::PathBuf::from("./evoloop_data"),
    }
}
