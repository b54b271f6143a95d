//! Append-only hash-chained attestation ledger on SQLite.
//!
//! Single writer, many readers. Every append acquires the process-wide
//! mutex, computes the canonical payload `{data, etype, prev, ts}` as
//! sorted-key JSON, hashes it with SHA-256 and links it to the previous
//! row. The first row links to the literal string "genesis". Holders of
//! the mutex never perform network I/O.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;

use crate::clock::EngineClock;
use crate::gates::GateOutcome;
use crate::rng::RngState;
use crate::state::EngineState;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("ledger mutex poisoned")]
    Poisoned,
}

/// Event types recorded in the ledger. Writers use these names exactly;
/// readers treat unknown names in existing files as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Boot,
    CycleStart,
    CycleAbort,
    PromoteAttest,
    Rollback,
    MasterEq,
    FibonacciTick,
    FibonacciOpt,
    Snapshot,
    Shutdown,
    LlmQuery,
    SeedSet,
    GateFail,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Boot => "BOOT",
            EventType::CycleStart => "CYCLE_START",
            EventType::CycleAbort => "CYCLE_ABORT",
            EventType::PromoteAttest => "PROMOTE_ATTEST",
            EventType::Rollback => "ROLLBACK",
            EventType::MasterEq => "MASTER_EQ",
            EventType::FibonacciTick => "FIBONACCI_TICK",
            EventType::FibonacciOpt => "FIBONACCI_OPT",
            EventType::Snapshot => "SNAPSHOT",
            EventType::Shutdown => "SHUTDOWN",
            EventType::LlmQuery => "LLM_QUERY",
            EventType::SeedSet => "SEED_SET",
            EventType::GateFail => "GATE_FAIL",
        }
    }
}

/// Optional columns attached to a record.
#[derive(Default)]
pub struct RecordOpts<'a> {
    pub state_for_tag: Option<&'a EngineState>,
    pub seed_state: Option<&'a RngState>,
    pub pre_hash: Option<String>,
    pub post_hash: Option<String>,
    pub gate_trace: Option<&'a [GateOutcome]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainStatus {
    Valid { rows: u64 },
    Broken { row: u64, reason: String },
}

#[derive(Debug, Clone)]
pub struct LedgerRow {
    pub id: u64,
    pub etype: String,
    pub data: Value,
    pub ts: String,
    pub prev: String,
    pub hash: String,
    pub pre_hash: Option<String>,
    pub post_hash: Option<String>,
    pub gate_trace: Option<Value>,
}

struct Inner {
    conn: Connection,
    tail: String,
}

pub struct WormLedger {
    inner: Mutex<Inner>,
    clock: EngineClock,
}

fn canonical_hash(etype: &str, data: &Value, ts: &str, prev: &str) -> String {
    let payload = json!({
        "data": data,
        "etype": etype,
        "prev": prev,
        "ts": ts,
    });
    let mut h = Sha256::new();
    h.update(payload.to_string().as_bytes());
    hex::encode(h.finalize())
}

fn zeckendorf_tag(st: &EngineState) -> String {
    let mix = (st.delta_linf.abs() * 1e6) as u64 + (st.caos_plus.abs() * 1e6) as u64 + st.cycle;
    crate::fibonacci::Zeckendorf::encode_string(mix)
}

impl WormLedger {
    pub fn open<P: AsRef<Path>>(path: P, clock: EngineClock) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;
             CREATE TABLE IF NOT EXISTS events (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 etype TEXT NOT NULL,
                 data TEXT NOT NULL,
                 ts TEXT NOT NULL,
                 prev TEXT NOT NULL,
                 hash TEXT NOT NULL,
                 zeck TEXT,
                 seed_state TEXT,
                 pre_hash TEXT,
                 post_hash TEXT,
                 gate_trace TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_ts ON events(ts);
             CREATE INDEX IF NOT EXISTS idx_etype ON events(etype);",
        )?;
        let tail: String = conn
            .query_row("SELECT hash FROM events ORDER BY id DESC LIMIT 1", [], |r| {
                r.get(0)
            })
            .optional()?
            .unwrap_or_else(|| "genesis".to_string());
        Ok(Self {
            inner: Mutex::new(Inner { conn, tail }),
            clock,
        })
    }

    pub fn tail_hash(&self) -> Result<String, LedgerError> {
        let inner = self.inner.lock().map_err(|_| LedgerError::Poisoned)?;
        Ok(inner.tail.clone())
    }

    /// Append one record and publish the new tail hash.
    pub fn record(
        &self,
        etype: EventType,
        data: Value,
        opts: RecordOpts<'_>,
    ) -> Result<String, LedgerError> {
        let mut inner = self.inner.lock().map_err(|_| LedgerError::Poisoned)?;
        let ts = self.clock.now_rfc3339();
        let prev = inner.tail.clone();
        let hash = canonical_hash(etype.as_str(), &data, &ts, &prev);
        let zeck = opts.state_for_tag.map(zeckendorf_tag);
        let seed_state = match opts.seed_state {
            Some(s) => Some(serde_json::to_string(s)?),
            None => None,
        };
        let gate_trace = match opts.gate_trace {
            Some(t) => Some(serde_json::to_string(t)?),
            None => None,
        };
        inner.conn.execute(
            "INSERT INTO events (etype, data, ts, prev, hash, zeck, seed_state, pre_hash, post_hash, gate_trace)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                etype.as_str(),
                data.to_string(),
                ts,
                prev,
                hash,
                zeck,
                seed_state,
                opts.pre_hash,
                opts.post_hash,
                gate_trace,
            ],
        )?;
        inner.tail = hash.clone();
        Ok(hash)
    }

    /// The single atomic record proving a promotion: pre/post state hashes
    /// (timestamps excluded), RNG state, config hash and the gate trace.
    pub fn record_promote_attest(
        &self,
        pre_state: &EngineState,
        post_state: &EngineState,
        gate_trace: &[GateOutcome],
        rng_state: &RngState,
        config_hash: &str,
        step: f64,
    ) -> Result<String, LedgerError> {
        let data = json!({
            "step": step,
            "alpha": post_state.alpha_omega,
            "delta_linf": post_state.delta_linf,
            "config_hash": config_hash,
            "cycle": post_state.cycle,
        });
        self.record(
            EventType::PromoteAttest,
            data,
            RecordOpts {
                state_for_tag: Some(post_state),
                seed_state: Some(rng_state),
                pre_hash: Some(pre_state.compute_hash()),
                post_hash: Some(post_state.compute_hash()),
                gate_trace: Some(gate_trace),
            },
        )
    }

    /// Re-walk the whole chain; returns the first inconsistency, if any.
    pub fn verify_chain(&self) -> Result<ChainStatus, LedgerError> {
        let inner = self.inner.lock().map_err(|_| LedgerError::Poisoned)?;
        let mut stmt = inner
            .conn
            .prepare("SELECT etype, data, ts, prev, hash FROM events ORDER BY id")?;
        let mut rows = stmt.query([])?;
        let mut prev = "genesis".to_string();
        let mut n: u64 = 0;
        while let Some(row) = rows.next()? {
            n += 1;
            let etype: String = row.get(0)?;
            let data_raw: String = row.get(1)?;
            let ts: String = row.get(2)?;
            let stored_prev: String = row.get(3)?;
            let stored_hash: String = row.get(4)?;
            if stored_prev != prev {
                return Ok(ChainStatus::Broken {
                    row: n,
                    reason: "chain break".to_string(),
                });
            }
            let data: Value = match serde_json::from_str(&data_raw) {
                Ok(v) => v,
                Err(_) => {
                    return Ok(ChainStatus::Broken {
                        row: n,
                        reason: "unparseable data".to_string(),
                    })
                }
            };
            let calc = canonical_hash(&etype, &data, &ts, &stored_prev);
            if calc != stored_hash {
                return Ok(ChainStatus::Broken {
                    row: n,
                    reason: "hash mismatch".to_string(),
                });
            }
            prev = stored_hash;
        }
        Ok(ChainStatus::Valid { rows: n })
    }

    /// Read rows back, optionally filtered by event type.
    pub fn rows(&self, etype: Option<&str>) -> Result<Vec<LedgerRow>, LedgerError> {
        let inner = self.inner.lock().map_err(|_| LedgerError::Poisoned)?;
        let sql = match etype {
            Some(_) => {
                "SELECT id, etype, data, ts, prev, hash, pre_hash, post_hash, gate_trace
                 FROM events WHERE etype = ?1 ORDER BY id"
            }
            None => {
                "SELECT id, etype, data, ts, prev, hash, pre_hash, post_hash, gate_trace
                 FROM events ORDER BY id"
            }
        };
        let mut stmt = inner.conn.prepare(sql)?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<LedgerRow> {
            let data_raw: String = row.get(2)?;
            let trace_raw: Option<String> = row.get(8)?;
            Ok(LedgerRow {
                id: row.get(0)?,
                etype: row.get(1)?,
                data: serde_json::from_str(&data_raw).unwrap_or(Value::Null),
                ts: row.get(3)?,
                prev: row.get(4)?,
                hash: row.get(5)?,
                pre_hash: row.get(6)?,
                post_hash: row.get(7)?,
                gate_trace: trace_raw.and_then(|t| serde_json::from_str(&t).ok()),
            })
        };
        let rows = match etype {
            Some(e) => stmt
                .query_map(params![e], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map([], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        Ok(rows)
    }

    pub fn len(&self) -> Result<u64, LedgerError> {
        let inner = self.inner.lock().map_err(|_| LedgerError::Poisoned)?;
        let n: u64 = inner
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?;
        Ok(n)
    }

    pub fn is_empty(&self) -> Result<bool, LedgerError> {
        Ok(self.len()? == 0)
    }
}
