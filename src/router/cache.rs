//! Two-level response cache with optional HMAC-SHA256 integrity tags.
//!
//! L1 is an in-process LRU with TTL; L2 is an optional SQLite tier with the
//! same contract. Writes go to both; reads try L1 then L2 and backfill L1
//! on an L2 hit. A failed integrity check drops the entry and reports a
//! miss, never an error. Tag computation happens outside the level locks.

use hmac::{Hmac, Mac};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::logging::{json_log, obj, v_str, Domain};

type HmacSha256 = Hmac<Sha256>;

fn compute_tag(secret: &[u8], key: &str, value: &Value) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(key.as_bytes());
    mac.update(b":");
    mac.update(value.to_string().as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

fn verify_tag(secret: &[u8], key: &str, value: &Value, tag: &str) -> bool {
    let raw = match hex::decode(tag) {
        Ok(r) => r,
        Err(_) => return false,
    };
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(key.as_bytes());
    mac.update(b":");
    mac.update(value.to_string().as_bytes());
    mac.verify_slice(&raw).is_ok()
}

/// Secret for integrity tags, taken from `CACHE_HMAC_SECRET`. Absent means
/// entries are stored untagged.
pub fn secret_from_env() -> Option<Vec<u8>> {
    std::env::var("CACHE_HMAC_SECRET")
        .ok()
        .filter(|s| !s.is_empty())
        .map(|s| s.into_bytes())
}

struct L1Entry {
    value: Value,
    tag: Option<String>,
    created: Instant,
    accessed: Instant,
    access_count: u64,
    ttl: Duration,
}

struct L1Tier {
    max_size: usize,
    default_ttl: Mutex<Duration>,
    map: Mutex<HashMap<String, L1Entry>>,
}

impl L1Tier {
    fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            max_size,
            default_ttl: Mutex::new(default_ttl),
            map: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, key: &str) -> Option<(Value, Option<String>)> {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        let expired = match map.get(key) {
            Some(entry) => entry.created.elapsed() > entry.ttl,
            None => return None,
        };
        if expired {
            map.remove(key);
            return None;
        }
        let entry = map.get_mut(key)?;
        entry.accessed = Instant::now();
        entry.access_count += 1;
        Some((entry.value.clone(), entry.tag.clone()))
    }

    fn put(&self, key: &str, value: Value, tag: Option<String>, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or_else(|| *self.default_ttl.lock().unwrap_or_else(|e| e.into_inner()));
        let now = Instant::now();
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(
            key.to_string(),
            L1Entry {
                value,
                tag,
                created: now,
                accessed: now,
                access_count: 0,
                ttl,
            },
        );
        while map.len() > self.max_size {
            // Evict the least recently used entry.
            let victim = map
                .iter()
                .min_by_key(|(_, e)| e.accessed)
                .map(|(k, _)| k.clone());
            match victim {
                Some(k) => map.remove(&k),
                None => break,
            };
        }
    }

    fn remove(&self, key: &str) {
        self.map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    fn len(&self) -> usize {
        self.map.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn clear(&self) {
        self.map.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

struct L2Tier {
    conn: Mutex<Connection>,
    default_ttl: Mutex<f64>,
}

impl L2Tier {
    fn open<P: AsRef<Path>>(path: P, default_ttl: Duration) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;
             CREATE TABLE IF NOT EXISTS cache (
                 key TEXT PRIMARY KEY,
                 value TEXT NOT NULL,
                 tag TEXT,
                 created_at REAL NOT NULL,
                 ttl REAL NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            default_ttl: Mutex::new(default_ttl.as_secs_f64()),
        })
    }

    fn now_epoch() -> f64 {
        chrono::Utc::now().timestamp_millis() as f64 / 1000.0
    }

    fn get(&self, key: &str) -> Option<(Value, Option<String>)> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row: Option<(String, Option<String>, f64, f64)> = conn
            .query_row(
                "SELECT value, tag, created_at, ttl FROM cache WHERE key = ?1",
                params![key],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()
            .ok()
            .flatten();
        let (raw, tag, created_at, ttl) = row?;
        if Self::now_epoch() - created_at > ttl {
            let _ = conn.execute("DELETE FROM cache WHERE key = ?1", params![key]);
            return None;
        }
        let value: Value = serde_json::from_str(&raw).ok()?;
        Some((value, tag))
    }

    fn put(&self, key: &str, value: &Value, tag: Option<&str>, ttl: Option<Duration>) {
        let ttl = ttl
            .map(|t| t.as_secs_f64())
            .unwrap_or_else(|| *self.default_ttl.lock().unwrap_or_else(|e| e.into_inner()));
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let _ = conn.execute(
            "INSERT OR REPLACE INTO cache (key, value, tag, created_at, ttl)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![key, value.to_string(), tag, Self::now_epoch(), ttl],
        );
    }

    fn remove(&self, key: &str) {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let _ = conn.execute("DELETE FROM cache WHERE key = ?1", params![key]);
    }

    fn clear(&self) {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let _ = conn.execute("DELETE FROM cache", []);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub l1_size: usize,
}

pub struct TieredCache {
    l1: L1Tier,
    l2: Option<L2Tier>,
    secret: Option<Vec<u8>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TieredCache {
    pub fn new(
        l1_size: usize,
        l1_ttl: Duration,
        l2_path: Option<std::path::PathBuf>,
        l2_ttl: Duration,
        secret: Option<Vec<u8>>,
    ) -> anyhow::Result<Self> {
        let l2 = match l2_path {
            Some(path) => Some(L2Tier::open(path, l2_ttl)?),
            None => None,
        };
        Ok(Self {
            l1: L1Tier::new(l1_size, l1_ttl),
            l2,
            secret,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub fn memory_only(l1_size: usize, l1_ttl: Duration, secret: Option<Vec<u8>>) -> Self {
        Self {
            l1: L1Tier::new(l1_size, l1_ttl),
            l2: None,
            secret,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn check(&self, key: &str, value: &Value, tag: Option<&str>) -> bool {
        match (&self.secret, tag) {
            (Some(secret), Some(tag)) => verify_tag(secret, key, value, tag),
            // Untagged entries (or no secret configured) pass through.
            _ => true,
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        if let Some((value, tag)) = self.l1.get(key) {
            if self.check(key, &value, tag.as_deref()) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(value);
            }
            json_log(Domain::Cache, "integrity_drop", obj(&[("tier", v_str("l1"))]));
            self.l1.remove(key);
        }

        if let Some(l2) = &self.l2 {
            if let Some((value, tag)) = l2.get(key) {
                if self.check(key, &value, tag.as_deref()) {
                    let backfill_tag = tag.clone();
                    self.l1.put(key, value.clone(), backfill_tag, None);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(value);
                }
                json_log(Domain::Cache, "integrity_drop", obj(&[("tier", v_str("l2"))]));
                l2.remove(key);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn put(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let tag = self
            .secret
            .as_deref()
            .and_then(|s| compute_tag(s, key, &value));
        if let Some(l2) = &self.l2 {
            l2.put(key, &value, tag.as_deref(), ttl);
        }
        self.l1.put(key, value, tag, ttl);
    }

    /// Replace the default TTLs on both tiers (used by the Fibonacci TTL
    /// ladder). Existing entries keep the TTL they were written with.
    pub fn set_default_ttls(&self, l1_ttl: Duration, l2_ttl: Duration) {
        *self
            .l1
            .default_ttl
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = l1_ttl;
        if let Some(l2) = &self.l2 {
            *l2.default_ttl.lock().unwrap_or_else(|e| e.into_inner()) = l2_ttl.as_secs_f64();
        }
    }

    pub fn clear(&self) {
        self.l1.clear();
        if let Some(l2) = &self.l2 {
            l2.clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            l1_size: self.l1.len(),
        }
    }

    /// Corrupt the stored value of an entry in place, leaving its tag
    /// untouched. Test hook for the integrity contract.
    #[cfg(test)]
    pub(crate) fn tamper(&self, key: &str, new_value: Value) {
        let mut map = self.l1.map.lock().unwrap();
        if let Some(entry) = map.get_mut(key) {
            entry.value = new_value.clone();
        }
        drop(map);
        if let Some(l2) = &self.l2 {
            let conn = l2.conn.lock().unwrap();
            let _ = conn.execute(
                "UPDATE cache SET value = ?2 WHERE key = ?1",
                params![key, new_value.to_string()],
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn secret() -> Option<Vec<u8>> {
        Some(b"test-secret-0123456789abcdef".to_vec())
    }

    #[test]
    fn test_roundtrip_unmodified() {
        let cache = TieredCache::memory_only(10, Duration::from_secs(60), secret());
        cache.put("k", json!({"answer": 42}), None);
        assert_eq!(cache.get("k"), Some(json!({"answer": 42})));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_tampered_value_is_a_miss_not_an_error() {
        let cache = TieredCache::memory_only(10, Duration::from_secs(60), secret());
        cache.put("k", json!({"answer": 42}), None);
        cache.tamper("k", json!({"answer": 666}));
        assert_eq!(cache.get("k"), None);
        // Entry was dropped, a later get is still just a miss.
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = TieredCache::memory_only(10, Duration::from_millis(0), secret());
        cache.put("k", json!(1), Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = TieredCache::memory_only(2, Duration::from_secs(60), None);
        cache.put("a", json!(1), None);
        cache.put("b", json!(2), None);
        // Touch "a" so "b" is the least recently used.
        std::thread::sleep(Duration::from_millis(2));
        let _ = cache.get("a");
        std::thread::sleep(Duration::from_millis(2));
        cache.put("c", json!(3), None);
        assert_eq!(cache.stats().l1_size, 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert!(cache.get("b").is_none());
    }

    #[test]
    fn test_l2_backfills_l1() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::new(
            10,
            Duration::from_secs(60),
            Some(dir.path().join("l2.db")),
            Duration::from_secs(120),
            secret(),
        )
        .unwrap();
        cache.put("k", json!("v"), None);
        cache.l1.clear();
        assert_eq!(cache.get("k"), Some(json!("v")));
        // Now present in L1 again.
        assert_eq!(cache.l1.len(), 1);
    }

    #[test]
    fn test_l2_tamper_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::new(
            10,
            Duration::from_secs(60),
            Some(dir.path().join("l2.db")),
            Duration::from_secs(120),
            secret(),
        )
        .unwrap();
        cache.put("k", json!("v"), None);
        cache.tamper("k", json!("evil"));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_no_secret_means_no_verification() {
        let cache = TieredCache::memory_only(10, Duration::from_secs(60), None);
        cache.put("k", json!(1), None);
        cache.tamper("k", json!(2));
        // Without a secret there is nothing to verify against.
        assert_eq!(cache.get("k"), Some(json!(2)));
    }
}
