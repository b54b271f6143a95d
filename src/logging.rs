//! Structured JSON logging for the evolution engine.
//!
//! One object per line on stdout, filterable by level (`LOG_LEVEL`) and
//! domain (`LOG_DOMAINS`, comma-separated or "all"). Every line carries a
//! monotone sequence number so interleaved readers can re-establish order.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

/// Log domains, used for filtering via `LOG_DOMAINS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Cycle,   // cycle lifecycle, decisions
    Gate,    // gate outcomes
    Score,   // score computations
    Router,  // provider selection, dispatch
    Budget,  // budget governance
    Breaker, // circuit breaker transitions
    Cache,   // cache hits/misses/integrity
    Ledger,  // ledger appends, verification
    System,  // startup, shutdown, snapshots
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Cycle => "cycle",
            Domain::Gate => "gate",
            Domain::Score => "score",
            Domain::Router => "router",
            Domain::Budget => "budget",
            Domain::Breaker => "breaker",
            Domain::Cache => "cache",
            Domain::Ledger => "ledger",
            Domain::System => "system",
        }
    }

    pub fn is_enabled(&self) -> bool {
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    let redacted = Value::String("[REDACTED]".to_string());
    for key in ["api_key", "authorization", "Authorization", "hmac_secret"] {
        if fields.contains_key(key) {
            fields.insert(key.to_string(), redacted.clone());
        }
    }
    fields
}

/// Emit a structured log entry.
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if level < Level::from_env() || !domain.is_enabled() {
        return;
    }

    let fields = sanitize_fields(fields);
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str()));
    entry.insert("domain".to_string(), json!(domain.as_str()));
    entry.insert("event".to_string(), json!(event));
    entry.insert("data".to_string(), Value::Object(fields));

    println!("{}", Value::Object(entry));
}

/// Info-level shorthand used by most call sites.
pub fn json_log(domain: Domain, event: &str, fields: Map<String, Value>) {
    log(Level::Info, domain, event, fields);
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

pub fn v_bool(b: bool) -> Value {
    Value::Bool(b)
}

pub fn v_int(n: u64) -> Value {
    json!(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Warn < Level::Error);
    }

    #[test]
    fn test_obj_builds_map() {
        let m = obj(&[("a", v_num(1.0)), ("b", v_str("x"))]);
        assert_eq!(m.len(), 2);
        assert_eq!(m["b"], Value::String("x".to_string()));
    }

    #[test]
    fn test_sanitize_redacts_secrets() {
        let m = sanitize_fields(obj(&[("api_key", v_str("sk-123")), ("x", v_num(1.0))]));
        assert_eq!(m["api_key"], Value::String("[REDACTED]".to_string()));
        assert_eq!(m["x"], json!(1.0));
    }
}
