//! Embedded libSQL KnowledgeStore.
//!
//! [`KnowledgeStore`] is a versioned key-value store with one namespace per
//! session (`session/{id}/*`) and two global namespaces (`envelopes/*`,
//! `knowledge/*`), plus the session table and the progress event log.
//!
//! **Consistency rules:**
//! - Versioned values are never updated in place. A write inserts a new
//!   version row and swaps the `kv_current` pointer in one transaction;
//!   reads resolve pointer and row in a single statement, so a reader sees
//!   either the old or the new version, never a mix.
//! - Knowledge entries are append-only.
//! - Writers are serialized through one lock; readers never take it.
//!   Write transactions begin `IMMEDIATE` so writers in other processes
//!   queue on the database lock instead of racing.
//! - A session row that reached a terminal status is never overwritten.

mod migrations;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, TransactionBehavior, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use siteport_shared::{
    CapabilityEnvelope, EventStatus, JobSession, KnowledgeEntry, Phase, ProgressEvent, Result,
    SessionId, SessionStatus, SiteportError,
};
use tokio::sync::Mutex;

/// Key under `envelopes/` recording when the last full probe sweep finished.
const LAST_PROBE_KEY: &str = "_last_probe";

/// How long a connection waits on a lock held by another process.
const BUSY_TIMEOUT_MS: u32 = 5_000;

fn db_err(e: libsql::Error) -> SiteportError {
    SiteportError::Storage(e.to_string())
}

async fn set_busy_timeout(conn: &Connection) -> Result<()> {
    conn.query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), params![])
        .await
        .map_err(db_err)?;
    Ok(())
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SiteportError::Storage(format!("bad timestamp '{raw}': {e}")))
}

// ---------------------------------------------------------------------------
// Namespaces
// ---------------------------------------------------------------------------

/// Declared owner scope of a stored key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// Written only by the owning session's pipeline.
    Session(SessionId),
    /// Written only by the probe controller.
    Envelopes,
    /// Written only by the knowledge writer.
    Knowledge,
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session(id) => write!(f, "session/{id}"),
            Self::Envelopes => f.write_str("envelopes"),
            Self::Knowledge => f.write_str("knowledge"),
        }
    }
}

/// A value read back together with the version it was stored under.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

// ---------------------------------------------------------------------------
// KnowledgeStore
// ---------------------------------------------------------------------------

/// Primary storage handle wrapping a libSQL database.
pub struct KnowledgeStore {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    write_lock: Mutex<()>,
}

impl KnowledgeStore {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SiteportError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;
        set_busy_timeout(&conn).await?;

        let store = Self {
            db,
            conn,
            readonly: false,
            write_lock: Mutex::new(()),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Open an existing database at `path` for inspection only.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SiteportError::NotFound(format!(
                "knowledge store {}",
                path.display()
            )));
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;
        set_busy_timeout(&conn).await?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            write_lock: Mutex::new(()),
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        SiteportError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(SiteportError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Versioned key-value
    // -----------------------------------------------------------------------

    /// Insert the next version of `ns/key` and move the current pointer to it.
    ///
    /// `render` receives the assigned version and returns the JSON to store,
    /// so values that embed their own version stay in step with the row.
    /// With `expected` set, the write only happens while the current version
    /// is still `expected`; otherwise it fails with [`SiteportError::Conflict`].
    async fn write_version<F>(
        &self,
        ns: &Namespace,
        key: &str,
        expected: Option<u64>,
        render: F,
    ) -> Result<u64>
    where
        F: FnOnce(u64) -> Result<String>,
    {
        self.check_writable()?;
        let ns = ns.to_string();
        let _guard = self.write_lock.lock().await;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(db_err)?;

        let mut rows = tx
            .query(
                "SELECT COALESCE(MAX(version), 0) FROM kv_entries WHERE namespace = ?1 AND key = ?2",
                params![ns.as_str(), key],
            )
            .await
            .map_err(db_err)?;
        let latest = match rows.next().await.map_err(db_err)? {
            Some(row) => row.get::<i64>(0).map_err(db_err)?,
            None => 0,
        };
        drop(rows);

        if let Some(expected) = expected {
            if latest as u64 != expected {
                tx.rollback().await.map_err(db_err)?;
                return Err(SiteportError::Conflict(format!(
                    "{ns}/{key} is at version {latest}, expected {expected}"
                )));
            }
        }

        let version = latest as u64 + 1;
        let json = render(version)?;
        let now = Utc::now().to_rfc3339();

        tx.execute(
            "INSERT INTO kv_entries (namespace, key, version, value_json, written_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![ns.as_str(), key, version as i64, json, now],
        )
        .await
        .map_err(db_err)?;

        tx.execute(
            "INSERT INTO kv_current (namespace, key, version) VALUES (?1, ?2, ?3)
             ON CONFLICT(namespace, key) DO UPDATE SET version = excluded.version",
            params![ns.as_str(), key, version as i64],
        )
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        tracing::trace!(namespace = %ns, key, version, "stored new version");
        Ok(version)
    }

    /// Store `value` as the next version of `ns/key`. Returns the version.
    pub async fn put<T: Serialize>(&self, ns: &Namespace, key: &str, value: &T) -> Result<u64> {
        let json = serde_json::to_string(value)?;
        self.write_version(ns, key, None, move |_| Ok(json)).await
    }

    /// Store `value` only if `ns/key` is still at version `expected`.
    pub async fn put_if_version<T: Serialize>(
        &self,
        ns: &Namespace,
        key: &str,
        expected: u64,
        value: &T,
    ) -> Result<u64> {
        let json = serde_json::to_string(value)?;
        self.write_version(ns, key, Some(expected), move |_| Ok(json))
            .await
    }

    /// Read the current version of `ns/key`.
    pub async fn get<T: DeserializeOwned>(
        &self,
        ns: &Namespace,
        key: &str,
    ) -> Result<Option<Versioned<T>>> {
        let ns = ns.to_string();
        let mut rows = self
            .conn
            .query(
                "SELECT e.version, e.value_json
                 FROM kv_current c
                 JOIN kv_entries e
                   ON e.namespace = c.namespace AND e.key = c.key AND e.version = c.version
                 WHERE c.namespace = ?1 AND c.key = ?2",
                params![ns.as_str(), key],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => {
                let version = row.get::<i64>(0).map_err(db_err)? as u64;
                let json = row.get::<String>(1).map_err(db_err)?;
                Ok(Some(Versioned {
                    version,
                    value: serde_json::from_str(&json)?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Read a specific historical version of `ns/key`.
    pub async fn get_version<T: DeserializeOwned>(
        &self,
        ns: &Namespace,
        key: &str,
        version: u64,
    ) -> Result<Option<T>> {
        let ns = ns.to_string();
        let mut rows = self
            .conn
            .query(
                "SELECT value_json FROM kv_entries
                 WHERE namespace = ?1 AND key = ?2 AND version = ?3",
                params![ns.as_str(), key, version as i64],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => {
                let json = row.get::<String>(0).map_err(db_err)?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    /// All stored versions of `ns/key`, ascending.
    pub async fn list_versions(&self, ns: &Namespace, key: &str) -> Result<Vec<u64>> {
        let ns = ns.to_string();
        let mut rows = self
            .conn
            .query(
                "SELECT version FROM kv_entries WHERE namespace = ?1 AND key = ?2 ORDER BY version",
                params![ns.as_str(), key],
            )
            .await
            .map_err(db_err)?;

        let mut versions = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            versions.push(row.get::<i64>(0).map_err(db_err)? as u64);
        }
        Ok(versions)
    }

    /// Keys with a current version in `ns`, sorted.
    pub async fn list_keys(&self, ns: &Namespace) -> Result<Vec<String>> {
        let ns = ns.to_string();
        let mut rows = self
            .conn
            .query(
                "SELECT key FROM kv_current WHERE namespace = ?1 ORDER BY key",
                params![ns.as_str()],
            )
            .await
            .map_err(db_err)?;

        let mut keys = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            keys.push(row.get::<String>(0).map_err(db_err)?);
        }
        Ok(keys)
    }

    // -----------------------------------------------------------------------
    // Envelopes (global, written by the probe controller)
    // -----------------------------------------------------------------------

    /// Supersede the component's envelope. The store assigns the version.
    pub async fn put_envelope(
        &self,
        mut envelope: CapabilityEnvelope,
    ) -> Result<CapabilityEnvelope> {
        let component = envelope.component_id.clone();
        let version = self
            .write_version(&Namespace::Envelopes, &component, None, |v| {
                envelope.version = v;
                Ok(serde_json::to_string(&envelope)?)
            })
            .await?;
        envelope.version = version;
        Ok(envelope)
    }

    /// Current envelope for a component, if it was ever probed.
    pub async fn current_envelope(&self, component_id: &str) -> Result<Option<CapabilityEnvelope>> {
        Ok(self
            .get::<CapabilityEnvelope>(&Namespace::Envelopes, component_id)
            .await?
            .map(|v| v.value))
    }

    /// Current envelope of every probed component.
    pub async fn current_envelopes(&self) -> Result<BTreeMap<String, CapabilityEnvelope>> {
        let mut out = BTreeMap::new();
        for key in self.list_keys(&Namespace::Envelopes).await? {
            if key.starts_with('_') {
                continue;
            }
            if let Some(env) = self.current_envelope(&key).await? {
                out.insert(key, env);
            }
        }
        Ok(out)
    }

    /// Every retained version of a component's envelope, oldest first.
    pub async fn envelope_history(&self, component_id: &str) -> Result<Vec<CapabilityEnvelope>> {
        let mut history = Vec::new();
        for version in self.list_versions(&Namespace::Envelopes, component_id).await? {
            if let Some(env) = self
                .get_version(&Namespace::Envelopes, component_id, version)
                .await?
            {
                history.push(env);
            }
        }
        Ok(history)
    }

    /// Record the completion time of a full probe sweep.
    pub async fn set_last_probe(&self, at: DateTime<Utc>) -> Result<()> {
        self.put(&Namespace::Envelopes, LAST_PROBE_KEY, &at).await?;
        Ok(())
    }

    pub async fn last_probe(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .get::<DateTime<Utc>>(&Namespace::Envelopes, LAST_PROBE_KEY)
            .await?
            .map(|v| v.value))
    }

    // -----------------------------------------------------------------------
    // Knowledge (global, append-only)
    // -----------------------------------------------------------------------

    /// Append learnings in one transaction.
    pub async fn append_knowledge(&self, entries: &[KnowledgeEntry]) -> Result<usize> {
        self.check_writable()?;
        if entries.is_empty() {
            return Ok(0);
        }
        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await.map_err(db_err)?;

        for entry in entries {
            let tags = serde_json::to_string(&entry.context_tags)?;
            tx.execute(
                "INSERT INTO knowledge_entries
                   (pattern_key, successful_component, context_tags_json, fidelity_observed, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.pattern_key.as_str(),
                    entry.successful_component.as_str(),
                    tags,
                    entry.fidelity_observed,
                    entry.recorded_at.to_rfc3339()
                ],
            )
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        tracing::debug!(
            count = entries.len(),
            namespace = %Namespace::Knowledge,
            "appended knowledge"
        );
        Ok(entries.len())
    }

    /// All knowledge entries in insertion order.
    pub async fn knowledge_entries(&self) -> Result<Vec<KnowledgeEntry>> {
        let rows = self
            .conn
            .query(
                "SELECT pattern_key, successful_component, context_tags_json, fidelity_observed, recorded_at
                 FROM knowledge_entries ORDER BY id",
                params![],
            )
            .await
            .map_err(db_err)?;
        collect_knowledge(rows).await
    }

    /// Knowledge entries recorded for one pattern key.
    pub async fn knowledge_for_pattern(&self, pattern_key: &str) -> Result<Vec<KnowledgeEntry>> {
        let rows = self
            .conn
            .query(
                "SELECT pattern_key, successful_component, context_tags_json, fidelity_observed, recorded_at
                 FROM knowledge_entries WHERE pattern_key = ?1 ORDER BY id",
                params![pattern_key],
            )
            .await
            .map_err(db_err)?;
        collect_knowledge(rows).await
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Insert or replace a session record. A stored record that is already
    /// done, failed or cancelled is left untouched.
    pub async fn save_session(&self, session: &JobSession) -> Result<()> {
        self.check_writable()?;
        let json = serde_json::to_string(session)?;
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO sessions (id, source, phase, status, created_at, updated_at, session_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                   phase = excluded.phase,
                   status = excluded.status,
                   updated_at = excluded.updated_at,
                   session_json = excluded.session_json
                 WHERE sessions.status NOT IN ('done', 'failed', 'cancelled')",
                params![
                    session.id.to_string(),
                    session.source.as_str(),
                    session.phase.as_str(),
                    session.status.as_str(),
                    session.created_at.to_rfc3339(),
                    session.updated_at.to_rfc3339(),
                    json
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn load_session(&self, id: SessionId) -> Result<Option<JobSession>> {
        let mut rows = self
            .conn
            .query(
                "SELECT session_json FROM sessions WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => {
                let json = row.get::<String>(0).map_err(db_err)?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    /// Stored status of a session, without decoding the full record.
    pub async fn session_status(&self, id: SessionId) -> Result<Option<SessionStatus>> {
        let mut rows = self
            .conn
            .query(
                "SELECT status FROM sessions WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row.get::<String>(0).map_err(db_err)?.parse()?)),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Driver leases
    // -----------------------------------------------------------------------

    /// Claim or renew the right to drive session `id` for `ttl`.
    ///
    /// Returns `false` while another owner holds an unexpired lease.
    pub async fn acquire_lease(&self, id: SessionId, owner: &str, ttl: Duration) -> Result<bool> {
        self.check_writable()?;
        let now = Utc::now().timestamp_millis();
        let expires_at = now.saturating_add(ttl.as_millis() as i64);
        let _guard = self.write_lock.lock().await;
        let changed = self
            .conn
            .execute(
                "INSERT INTO session_leases (session_id, owner, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(session_id) DO UPDATE SET
                   owner = excluded.owner,
                   expires_at = excluded.expires_at
                 WHERE session_leases.owner = excluded.owner OR session_leases.expires_at < ?4",
                params![id.to_string(), owner, expires_at, now],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Drop a lease held by `owner`. Leases held by others are kept.
    pub async fn release_lease(&self, id: SessionId, owner: &str) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "DELETE FROM session_leases WHERE session_id = ?1 AND owner = ?2",
                params![id.to_string(), owner],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Owner of the unexpired lease on session `id`, if any.
    pub async fn lease_holder(&self, id: SessionId) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT owner FROM session_leases WHERE session_id = ?1 AND expires_at >= ?2",
                params![id.to_string(), Utc::now().timestamp_millis()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row.get::<String>(0).map_err(db_err)?)),
            None => Ok(None),
        }
    }

    /// All sessions, newest first.
    pub async fn list_sessions(&self) -> Result<Vec<JobSession>> {
        let mut rows = self
            .conn
            .query(
                "SELECT session_json FROM sessions ORDER BY created_at DESC, id DESC",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut sessions = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let json = row.get::<String>(0).map_err(db_err)?;
            sessions.push(serde_json::from_str(&json)?);
        }
        Ok(sessions)
    }

    // -----------------------------------------------------------------------
    // Session-scoped phase outputs
    // -----------------------------------------------------------------------

    /// Persist a phase output under `session/{id}/{name}`.
    pub async fn put_session_output<T: Serialize>(
        &self,
        id: SessionId,
        name: &str,
        value: &T,
    ) -> Result<u64> {
        self.put(&Namespace::Session(id), name, value).await
    }

    pub async fn session_output<T: DeserializeOwned>(
        &self,
        id: SessionId,
        name: &str,
    ) -> Result<Option<T>> {
        Ok(self
            .get::<T>(&Namespace::Session(id), name)
            .await?
            .map(|v| v.value))
    }

    /// Read a phase output together with its version, for conditional updates.
    pub async fn session_output_versioned<T: DeserializeOwned>(
        &self,
        id: SessionId,
        name: &str,
    ) -> Result<Option<Versioned<T>>> {
        self.get(&Namespace::Session(id), name).await
    }

    /// Replace a phase output only if it is still at version `expected`.
    pub async fn put_session_output_if<T: Serialize>(
        &self,
        id: SessionId,
        name: &str,
        expected: u64,
        value: &T,
    ) -> Result<u64> {
        self.put_if_version(&Namespace::Session(id), name, expected, value)
            .await
    }

    // -----------------------------------------------------------------------
    // Progress events
    // -----------------------------------------------------------------------

    /// Append an event and return the sequence number the store assigned.
    /// `event.seq` is ignored; numbering is gap-free per session across all
    /// writers of the database.
    pub async fn append_event(&self, event: &ProgressEvent) -> Result<u64> {
        self.check_writable()?;
        let session_id = event.session_id.to_string();
        let _guard = self.write_lock.lock().await;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(db_err)?;

        let mut rows = tx
            .query(
                "SELECT COALESCE(MAX(seq), 0) FROM progress_events WHERE session_id = ?1",
                params![session_id.as_str()],
            )
            .await
            .map_err(db_err)?;
        let last = match rows.next().await.map_err(db_err)? {
            Some(row) => row.get::<i64>(0).map_err(db_err)?,
            None => 0,
        };
        drop(rows);

        let seq = last + 1;
        tx.execute(
            "INSERT INTO progress_events (session_id, seq, phase, status, detail, at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session_id.as_str(),
                seq,
                event.phase.as_str(),
                event.status.as_str(),
                event.detail.as_str(),
                event.at.to_rfc3339()
            ],
        )
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(seq as u64)
    }

    /// Events of a session with `seq > after`, in order.
    pub async fn events_since(&self, id: SessionId, after: u64) -> Result<Vec<ProgressEvent>> {
        let mut rows = self
            .conn
            .query(
                "SELECT seq, phase, status, detail, at FROM progress_events
                 WHERE session_id = ?1 AND seq > ?2 ORDER BY seq",
                params![id.to_string(), after as i64],
            )
            .await
            .map_err(db_err)?;

        let mut events = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let phase: Phase = row.get::<String>(1).map_err(db_err)?.parse()?;
            let status: EventStatus = row.get::<String>(2).map_err(db_err)?.parse()?;
            events.push(ProgressEvent {
                session_id: id,
                seq: row.get::<i64>(0).map_err(db_err)? as u64,
                phase,
                status,
                detail: row.get::<String>(3).map_err(db_err)?,
                at: parse_ts(&row.get::<String>(4).map_err(db_err)?)?,
            });
        }
        Ok(events)
    }
}

async fn collect_knowledge(mut rows: libsql::Rows) -> Result<Vec<KnowledgeEntry>> {
    let mut entries = Vec::new();
    while let Some(row) = rows.next().await.map_err(db_err)? {
        let tags_json = row.get::<String>(2).map_err(db_err)?;
        entries.push(KnowledgeEntry {
            pattern_key: row.get::<String>(0).map_err(db_err)?,
            successful_component: row.get::<String>(1).map_err(db_err)?,
            context_tags: serde_json::from_str(&tags_json)?,
            fidelity_observed: row.get::<f64>(3).map_err(db_err)?,
            recorded_at: parse_ts(&row.get::<String>(4).map_err(db_err)?)?,
        });
    }
    Ok(entries)
}
