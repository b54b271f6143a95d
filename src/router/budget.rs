//! Daily USD budget governance.
//!
//! Tracks spend, tokens and request counts per UTC day with a per-provider
//! breakdown and a bounded audit trail. The soft limit warns once per day;
//! the hard limit blocks. Counters reset lazily when the YYYYMMDD stamp of
//! "now" changes.

use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::logging::{json_log, obj, v_num, Domain};

const AUDIT_CAP: usize = 1000;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderStats {
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_failed: u64,
    pub tokens_total: u64,
    pub cost_total_usd: f64,
}

impl ProviderStats {
    pub fn success_rate(&self) -> f64 {
        if self.requests_total == 0 {
            return 0.0;
        }
        self.requests_success as f64 / self.requests_total as f64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub ts: String,
    pub provider: String,
    pub tokens: u64,
    pub cost_usd: f64,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetUsage {
    pub spend_today_usd: f64,
    pub daily_limit_usd: f64,
    pub remaining_usd: f64,
    pub usage_pct: f64,
    pub tokens: u64,
    pub requests: u64,
    pub soft_limit_reached: bool,
    pub hard_limit_reached: bool,
}

struct Inner {
    day_stamp: u32,
    spend_today_usd: f64,
    tokens_consumed: u64,
    requests_count: u64,
    provider_stats: HashMap<String, ProviderStats>,
    history: VecDeque<RequestRecord>,
    soft_triggered: bool,
    hard_triggered: bool,
}

pub struct BudgetTracker {
    daily_limit_usd: f64,
    soft_ratio: f64,
    inner: Mutex<Inner>,
}

fn current_day_utc() -> u32 {
    Utc::now()
        .format("%Y%m%d")
        .to_string()
        .parse()
        .unwrap_or(0)
}

impl BudgetTracker {
    pub fn new(daily_limit_usd: f64, soft_ratio: f64) -> anyhow::Result<Self> {
        anyhow::ensure!(daily_limit_usd > 0.0, "daily_limit_usd must be positive");
        anyhow::ensure!(
            soft_ratio > 0.0 && soft_ratio < 1.0,
            "soft_ratio must be in (0, 1)"
        );
        Ok(Self {
            daily_limit_usd,
            soft_ratio,
            inner: Mutex::new(Inner {
                day_stamp: current_day_utc(),
                spend_today_usd: 0.0,
                tokens_consumed: 0,
                requests_count: 0,
                provider_stats: HashMap::new(),
                history: VecDeque::new(),
                soft_triggered: false,
                hard_triggered: false,
            }),
        })
    }

    pub fn daily_limit_usd(&self) -> f64 {
        self.daily_limit_usd
    }

    fn roll_if_new_day(inner: &mut Inner) {
        let today = current_day_utc();
        if today != inner.day_stamp {
            json_log(
                Domain::Budget,
                "daily_reset",
                obj(&[
                    ("prev_day", v_num(inner.day_stamp as f64)),
                    ("day", v_num(today as f64)),
                    ("spent_usd", v_num(inner.spend_today_usd)),
                ]),
            );
            inner.day_stamp = today;
            inner.spend_today_usd = 0.0;
            inner.tokens_consumed = 0;
            inner.requests_count = 0;
            inner.provider_stats.clear();
            // The audit ring survives the reset; the cap alone bounds it.
            inner.soft_triggered = false;
            inner.hard_triggered = false;
        }
    }

    /// Whether a request with the given estimated cost may proceed. Crossing
    /// the soft limit warns once; exceeding the hard limit blocks.
    pub fn can_proceed(&self, cost_usd: f64) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::roll_if_new_day(&mut inner);

        let projected = inner.spend_today_usd + cost_usd;
        if projected > self.daily_limit_usd {
            if !inner.hard_triggered {
                json_log(
                    Domain::Budget,
                    "hard_limit",
                    obj(&[
                        ("spend_usd", v_num(inner.spend_today_usd)),
                        ("cost_usd", v_num(cost_usd)),
                        ("limit_usd", v_num(self.daily_limit_usd)),
                    ]),
                );
                inner.hard_triggered = true;
            }
            return false;
        }

        let soft_limit = self.daily_limit_usd * self.soft_ratio;
        if projected > soft_limit && !inner.soft_triggered {
            json_log(
                Domain::Budget,
                "soft_limit",
                obj(&[
                    ("projected_usd", v_num(projected)),
                    ("soft_limit_usd", v_num(soft_limit)),
                ]),
            );
            inner.soft_triggered = true;
        }
        true
    }

    pub fn record_request(&self, provider: &str, cost_usd: f64, tokens: u64, success: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::roll_if_new_day(&mut inner);

        inner.spend_today_usd += cost_usd;
        inner.tokens_consumed += tokens;
        inner.requests_count += 1;

        let stats = inner.provider_stats.entry(provider.to_string()).or_default();
        stats.requests_total += 1;
        if success {
            stats.requests_success += 1;
        } else {
            stats.requests_failed += 1;
        }
        stats.tokens_total += tokens;
        stats.cost_total_usd += cost_usd;

        inner.history.push_back(RequestRecord {
            ts: crate::logging::ts_now(),
            provider: provider.to_string(),
            tokens,
            cost_usd,
            success,
        });
        while inner.history.len() > AUDIT_CAP {
            inner.history.pop_front();
        }
    }

    pub fn is_hard_limit_reached(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::roll_if_new_day(&mut inner);
        inner.spend_today_usd >= self.daily_limit_usd
    }

    pub fn is_soft_limit_reached(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::roll_if_new_day(&mut inner);
        inner.spend_today_usd >= self.daily_limit_usd * self.soft_ratio
    }

    pub fn remaining_usd(&self) -> f64 {
        self.usage().remaining_usd
    }

    pub fn usage(&self) -> BudgetUsage {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::roll_if_new_day(&mut inner);
        BudgetUsage {
            spend_today_usd: inner.spend_today_usd,
            daily_limit_usd: self.daily_limit_usd,
            remaining_usd: (self.daily_limit_usd - inner.spend_today_usd).max(0.0),
            usage_pct: (inner.spend_today_usd / self.daily_limit_usd).min(1.0) * 100.0,
            tokens: inner.tokens_consumed,
            requests: inner.requests_count,
            soft_limit_reached: inner.spend_today_usd >= self.daily_limit_usd * self.soft_ratio,
            hard_limit_reached: inner.spend_today_usd >= self.daily_limit_usd,
        }
    }

    pub fn provider_breakdown(&self) -> HashMap<String, ProviderStats> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::roll_if_new_day(&mut inner);
        inner.provider_stats.clone()
    }

    pub fn audit_trail(&self) -> Vec<RequestRecord> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.history.iter().cloned().collect()
    }

    /// Manual reset (the lazy daily reset calls this path internally).
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.day_stamp = current_day_utc();
        inner.spend_today_usd = 0.0;
        inner.tokens_consumed = 0;
        inner.requests_count = 0;
        inner.provider_stats.clear();
        inner.history.clear();
        inner.soft_triggered = false;
        inner.hard_triggered = false;
    }

    #[cfg(test)]
    fn force_day_stamp(&self, stamp: u32) {
        self.inner.lock().unwrap().day_stamp = stamp;
    }
}
