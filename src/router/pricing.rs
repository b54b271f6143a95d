//! Static per-model pricing (USD per 1k tokens) and baseline quality
//! estimates used by the selection strategies.

/// (input, output) USD per 1k tokens. Unknown models price at zero so a
/// stub or local model never counts against the budget.
pub fn rates(model: &str) -> (f64, f64) {
    match model {
        "gpt-4o" => (0.005, 0.015),
        "gpt-4o-mini" => (0.001, 0.003),
        "deepseek-chat" => (0.00014, 0.00028),
        "mistral-large-latest" => (0.002, 0.006),
        "grok-2-latest" => (0.002, 0.010),
        _ => (0.0, 0.0),
    }
}

pub fn estimate_cost(model: &str, tokens_in: u64, tokens_out: u64) -> f64 {
    let (rin, rout) = rates(model);
    (tokens_in as f64 / 1000.0) * rin + (tokens_out as f64 / 1000.0) * rout
}

/// Blended per-1k rate used when ranking providers before token counts are
/// known. Assumes a 3:1 input:output mix.
pub fn blended_rate(model: &str) -> f64 {
    let (rin, rout) = rates(model);
    0.75 * rin + 0.25 * rout
}

/// Baseline answer-quality estimate in [0, 1].
pub fn baseline_quality(provider: &str) -> f64 {
    match provider {
        "openai" => 0.9,
        "grok" => 0.8,
        "mistral" => 0.75,
        "deepseek" => 0.7,
        _ => 0.5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_model_cost() {
        // 1000 in + 1000 out on gpt-4o = 0.005 + 0.015
        let c = estimate_cost("gpt-4o", 1000, 1000);
        assert!((c - 0.020).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_model_is_free() {
        assert_eq!(estimate_cost("local-stub", 5000, 5000), 0.0);
    }

    #[test]
    fn test_blended_rate_ordering() {
        assert!(blended_rate("gpt-4o") > blended_rate("gpt-4o-mini"));
        assert!(blended_rate("gpt-4o-mini") > blended_rate("deepseek-chat"));
    }
}
