//! Durable Engine Storage
//!
//! SQLite backend for everything that must survive a restart:
//! - Dimension versions (append-only history, expire updates `valid_to`)
//! - Fact records (append-only)
//! - Watermarks per source stream
//! - Deferred and unresolvable facts
//! - Batch log

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::config::EngineConfig;
use super::fact_binder::{DeferredFact, UnresolvableFact};
use super::types::{DimensionVersion, FactKey, FactRecord, RawEventRecord, SurrogateKey, Timestamp};

// =============================================================================
// Storage Schema
// =============================================================================

const PRAGMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -16000;
PRAGMA temp_store = MEMORY;
"#;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS dimension_versions (
    surrogate_key INTEGER PRIMARY KEY,
    business_key TEXT NOT NULL,
    attributes_json TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    valid_from INTEGER NOT NULL,
    valid_to INTEGER NOT NULL,
    is_current INTEGER NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

-- Interval lookups per key
CREATE INDEX IF NOT EXISTS idx_dimension_versions_key_from
    ON dimension_versions(business_key, valid_from);

-- At most one current version per key
CREATE UNIQUE INDEX IF NOT EXISTS idx_dimension_versions_current
    ON dimension_versions(business_key) WHERE is_current = 1;

CREATE TABLE IF NOT EXISTS fact_records (
    fact_key INTEGER PRIMARY KEY,
    event_key TEXT NOT NULL UNIQUE,
    dimension_key INTEGER NOT NULL,
    event_ts INTEGER NOT NULL,
    measures_json TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_fact_records_dimension
    ON fact_records(dimension_key, event_ts);

CREATE TABLE IF NOT EXISTS watermarks (
    stream TEXT PRIMARY KEY,
    position INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS deferred_facts (
    event_key TEXT PRIMARY KEY,
    event_json TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    first_deferred_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS unresolvable_facts (
    event_key TEXT PRIMARY KEY,
    event_json TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    reason TEXT NOT NULL,
    surfaced_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS batch_log (
    batch_id TEXT PRIMARY KEY,
    stream TEXT NOT NULL,
    passed INTEGER NOT NULL,
    report_json TEXT NOT NULL,
    finished_at INTEGER NOT NULL
) WITHOUT ROWID;
"#;

const VERSION_COLUMNS: &str =
    "surrogate_key, business_key, attributes_json, fingerprint, valid_from, valid_to, is_current";

// =============================================================================
// Storage Implementation
// =============================================================================

/// Persistent storage for the dimension and fact stores.
pub struct ScdStorage {
    conn: Arc<Mutex<Connection>>,
    db_path: String,
}

impl ScdStorage {
    /// Open or create storage at `config.db_path`.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let path = Path::new(&config.db_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(&config.db_path, flags)
            .with_context(|| format!("Failed to open database: {}", config.db_path))?;

        if config.wal_mode {
            conn.execute_batch(PRAGMA_SQL)
                .context("Failed to apply database pragmas")?;

            let journal_mode: String = conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .unwrap_or_default();
            if journal_mode.to_lowercase() != "wal" {
                warn!("WAL mode not active, journal_mode = {}", journal_mode);
            }
        }

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        info!(path = %config.db_path, "dimflow storage opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: config.db_path.clone(),
        })
    }

    /// Open in-memory storage (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: ":memory:".to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.db_path
    }

    // -------------------------------------------------------------------------
    // Dimension versions
    // -------------------------------------------------------------------------

    /// Insert the first version of a key.
    pub fn insert_version(&self, version: &DimensionVersion) -> Result<()> {
        let conn = self.conn.lock();
        insert_version_row(&conn, version)
    }

    /// Expire `expired` at `valid_to` and insert `inserted`, in one transaction.
    pub fn expire_and_insert(
        &self,
        expired: SurrogateKey,
        valid_to: Timestamp,
        inserted: &DimensionVersion,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let updated = tx.execute(
            "UPDATE dimension_versions SET valid_to = ?1, is_current = 0
             WHERE surrogate_key = ?2 AND is_current = 1",
            params![valid_to, expired.0 as i64],
        )?;
        if updated != 1 {
            anyhow::bail!(
                "expected to expire exactly one current version {}, matched {}",
                expired,
                updated
            );
        }

        insert_version_row(&tx, inserted)?;
        tx.commit().context("Failed to commit expire-and-insert")?;
        Ok(())
    }

    /// Load every version, ordered by surrogate key.
    pub fn load_versions(&self) -> Result<Vec<DimensionVersion>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM dimension_versions ORDER BY surrogate_key ASC",
            VERSION_COLUMNS
        ))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(sk, business_key, attrs, fingerprint, valid_from, valid_to, is_current)| {
                Ok(DimensionVersion {
                    surrogate_key: SurrogateKey(sk as u64),
                    attributes: serde_json::from_str(&attrs).with_context(|| {
                        format!("Corrupt attributes_json for surrogate key {}", sk)
                    })?,
                    business_key,
                    fingerprint,
                    valid_from,
                    valid_to,
                    is_current: is_current != 0,
                })
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Facts
    // -------------------------------------------------------------------------

    /// Append facts in a single transaction.
    pub fn append_facts(&self, facts: &[FactRecord]) -> Result<usize> {
        if facts.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO fact_records (fact_key, event_key, dimension_key, event_ts, measures_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for fact in facts {
                stmt.execute(params![
                    fact.fact_key.0 as i64,
                    fact.event_key,
                    fact.dimension_key.0 as i64,
                    fact.event_ts,
                    serde_json::to_string(&fact.measures)?,
                ])
                .with_context(|| format!("Failed to append fact {}", fact.event_key))?;
            }
        }
        tx.commit()?;

        debug!(count = facts.len(), "facts appended");
        Ok(facts.len())
    }

    /// Load every fact, ordered by fact key.
    pub fn load_facts(&self) -> Result<Vec<FactRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT fact_key, event_key, dimension_key, event_ts, measures_json
             FROM fact_records ORDER BY fact_key ASC",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(fk, event_key, dk, event_ts, measures)| {
                Ok(FactRecord {
                    fact_key: FactKey(fk as u64),
                    measures: serde_json::from_str(&measures)
                        .with_context(|| format!("Corrupt measures_json for fact {}", fk))?,
                    event_key,
                    dimension_key: SurrogateKey(dk as u64),
                    event_ts,
                })
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Watermarks
    // -------------------------------------------------------------------------

    pub fn get_watermark(&self, stream: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let position = conn
            .query_row(
                "SELECT position FROM watermarks WHERE stream = ?1",
                params![stream],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(position)
    }

    pub fn set_watermark(&self, stream: &str, position: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO watermarks (stream, position, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(stream) DO UPDATE SET
                position = excluded.position,
                updated_at = excluded.updated_at",
            params![stream, position, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    pub fn load_watermarks(&self) -> Result<Vec<(String, i64, i64)>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT stream, position, updated_at FROM watermarks ORDER BY stream")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Deferred / unresolvable facts
    // -------------------------------------------------------------------------

    /// Replace the persisted deferred queue and unresolvable set.
    pub fn save_fact_queues(
        &self,
        deferred: &[DeferredFact],
        unresolvable: &[UnresolvableFact],
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute("DELETE FROM deferred_facts", [])?;
        tx.execute("DELETE FROM unresolvable_facts", [])?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO deferred_facts (event_key, event_json, attempts, first_deferred_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for d in deferred {
                stmt.execute(params![
                    d.event_key,
                    serde_json::to_string(&d.event)?,
                    d.attempts,
                    d.first_deferred_at,
                ])?;
            }
        }
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO unresolvable_facts
                    (event_key, event_json, attempts, reason, surfaced_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for u in unresolvable {
                stmt.execute(params![
                    u.event_key,
                    serde_json::to_string(&u.event)?,
                    u.attempts,
                    u.reason,
                    u.surfaced_at,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    pub fn load_deferred(&self) -> Result<Vec<DeferredFact>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT event_key, event_json, attempts, first_deferred_at
             FROM deferred_facts ORDER BY first_deferred_at, event_key",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(event_key, json, attempts, first_deferred_at)| {
                let event: RawEventRecord = serde_json::from_str(&json)
                    .with_context(|| format!("Corrupt deferred event {}", event_key))?;
                Ok(DeferredFact {
                    event_key,
                    event,
                    attempts,
                    first_deferred_at,
                })
            })
            .collect()
    }

    pub fn load_unresolvable(&self) -> Result<Vec<UnresolvableFact>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT event_key, event_json, attempts, reason, surfaced_at
             FROM unresolvable_facts ORDER BY surfaced_at, event_key",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(event_key, json, attempts, reason, surfaced_at)| {
                let event: RawEventRecord = serde_json::from_str(&json)
                    .with_context(|| format!("Corrupt unresolvable event {}", event_key))?;
                Ok(UnresolvableFact {
                    event_key,
                    event,
                    attempts,
                    reason,
                    surfaced_at,
                })
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Batch log
    // -------------------------------------------------------------------------

    pub fn record_batch(&self, batch_id: &str, stream: &str, passed: bool, report_json: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO batch_log (batch_id, stream, passed, report_json, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                batch_id,
                stream,
                passed as i32,
                report_json,
                Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    pub fn batch_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row("SELECT COUNT(*) FROM batch_log", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn insert_version_row(conn: &Connection, version: &DimensionVersion) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO dimension_versions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            VERSION_COLUMNS
        ),
        params![
            version.surrogate_key.0 as i64,
            version.business_key,
            serde_json::to_string(&version.attributes)?,
            version.fingerprint,
            version.valid_from,
            version.valid_to,
            version.is_current as i32,
        ],
    )
    .with_context(|| {
        format!(
            "Failed to insert version {} for {}",
            version.surrogate_key, version.business_key
        )
    })?;
    Ok(())
}
