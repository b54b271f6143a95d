//! Host resource sampling for the risk sub-gate.
//!
//! Returns `None` whenever a reading cannot be obtained; the caller must
//! treat that as the worst case (fail-closed), never as "no load".

/// Normalized (cpu, mem) in [0, 1], or `None` if unavailable.
pub fn sample() -> Option<(f64, f64)> {
    Some((sample_cpu()?, sample_mem()?))
}

#[cfg(target_os = "linux")]
fn sample_cpu() -> Option<f64> {
    let raw = std::fs::read_to_string("/proc/loadavg").ok()?;
    let load1: f64 = raw.split_whitespace().next()?.parse().ok()?;
    let cores = num_cpus::get().max(1) as f64;
    Some((load1 / cores).clamp(0.0, 1.0))
}

#[cfg(target_os = "linux")]
fn sample_mem() -> Option<f64> {
    let raw = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total: Option<f64> = None;
    let mut available: Option<f64> = None;
    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = rest.trim().split_whitespace().next()?.parse().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = rest.trim().split_whitespace().next()?.parse().ok();
        }
    }
    let (total, available) = (total?, available?);
    if total <= 0.0 {
        return None;
    }
    Some((1.0 - available / total).clamp(0.0, 1.0))
}

#[cfg(not(target_os = "linux"))]
fn sample_cpu() -> Option<f64> {
    None
}

#[cfg(not(target_os = "linux"))]
fn sample_mem() -> Option<f64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_values_are_normalized() {
        if let Some((cpu, mem)) = sample() {
            assert!((0.0..=1.0).contains(&cpu));
            assert!((0.0..=1.0).contains(&mem));
        }
    }
}
