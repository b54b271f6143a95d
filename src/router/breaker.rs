//! Per-provider circuit breakers.
//!
//! Three states with lazy transitions recomputed on read:
//! CLOSED → OPEN after N consecutive failures, OPEN → HALF_OPEN once the
//! timeout elapses, HALF_OPEN → CLOSED on a probe success and back to OPEN
//! on a probe failure. Readers observing the same instant see a monotone
//! state because transitions only ever happen under the map lock.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::logging::{json_log, obj, v_num, v_str, Domain};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    cfg: BreakerConfig,
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    opened_at: Option<Instant>,
    half_open_calls: u32,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            half_open_calls: 0,
        }
    }

    fn refresh(&mut self) {
        if self.state == CircuitState::Open {
            if let Some(opened) = self.opened_at {
                if opened.elapsed() >= self.cfg.timeout {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_calls = 0;
                    self.failure_count = 0;
                }
            }
        }
    }

    pub fn state(&mut self) -> CircuitState {
        self.refresh();
        self.state
    }

    /// Whether a request may be dispatched. Half-open probes count against
    /// the probe quota as soon as they are admitted.
    pub fn can_execute(&mut self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if self.half_open_calls < self.cfg.half_open_max_calls {
                    self.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.success_count += 1;
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.failure_count = 0;
                self.opened_at = None;
                self.half_open_calls = 0;
            }
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = Some(Instant::now());
                self.half_open_calls = 0;
            }
            CircuitState::Closed => {
                if self.failure_count >= self.cfg.failure_threshold {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(Instant::now());
                    self.half_open_calls = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    #[cfg(test)]
    fn backdate_open(&mut self, by: Duration) {
        if let Some(opened) = self.opened_at {
            self.opened_at = Some(opened - by);
        }
    }
}

/// One breaker per provider, created on first use.
pub struct BreakerMap {
    cfg: BreakerConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl BreakerMap {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn with_breaker<R>(&self, provider: &str, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        let mut map = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let breaker = map
            .entry(provider.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.cfg.clone()));
        f(breaker)
    }

    pub fn can_execute(&self, provider: &str) -> bool {
        self.with_breaker(provider, |b| b.can_execute())
    }

    pub fn state(&self, provider: &str) -> CircuitState {
        self.with_breaker(provider, |b| b.state())
    }

    pub fn record_success(&self, provider: &str) {
        self.with_breaker(provider, |b| b.record_success());
    }

    pub fn record_failure(&self, provider: &str) {
        let (state, failures) = self.with_breaker(provider, |b| {
            b.record_failure();
            (b.state, b.failure_count)
        });
        if state == CircuitState::Open {
            json_log(
                Domain::Breaker,
                "open",
                obj(&[
                    ("provider", v_str(provider)),
                    ("failures", v_num(failures as f64)),
                ]),
            );
        }
    }

    pub fn all_states(&self) -> HashMap<String, &'static str> {
        let mut map = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        map.iter_mut()
            .map(|(k, b)| (k.clone(), b.state().as_str()))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn backdate_open(&self, provider: &str, by: Duration) {
        self.with_breaker(provider, |b| b.backdate_open(by));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_cfg() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            timeout: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let mut b = CircuitBreaker::new(fast_cfg());
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.can_execute());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mut b = CircuitBreaker::new(fast_cfg());
        b.record_failure();
        b.record_failure();
        b.record_success();
        assert_eq!(b.failure_count(), 0);
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_transitions_to_half_open_after_timeout() {
        let mut b = CircuitBreaker::new(fast_cfg());
        for _ in 0..3 {
            b.record_failure();
        }
        assert_eq!(b.state(), CircuitState::Open);
        b.backdate_open(Duration::from_secs(61));
        assert_eq!(b.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_probe_quota() {
        let mut b = CircuitBreaker::new(fast_cfg());
        for _ in 0..3 {
            b.record_failure();
        }
        b.backdate_open(Duration::from_secs(61));
        assert!(b.can_execute()); // the single probe
        assert!(!b.can_execute()); // quota exhausted
    }

    #[test]
    fn test_probe_success_closes() {
        let mut b = CircuitBreaker::new(fast_cfg());
        for _ in 0..3 {
            b.record_failure();
        }
        b.backdate_open(Duration::from_secs(61));
        assert!(b.can_execute());
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
        assert!(b.can_execute());
    }

    #[test]
    fn test_probe_failure_reopens() {
        let mut b = CircuitBreaker::new(fast_cfg());
        for _ in 0..3 {
            b.record_failure();
        }
        b.backdate_open(Duration::from_secs(61));
        assert!(b.can_execute());
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.can_execute());
    }

    #[test]
    fn test_map_isolates_providers() {
        let map = BreakerMap::new(fast_cfg());
        for _ in 0..3 {
            map.record_failure("flaky");
        }
        assert!(!map.can_execute("flaky"));
        assert!(map.can_execute("healthy"));
        assert_eq!(map.state("flaky"), CircuitState::Open);
        assert_eq!(map.all_states()["flaky"], "open");
    }
}
