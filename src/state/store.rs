// src/state/store.rs

//! SQLite-backed state store.
//!
//! One connection behind a mutex; every method is a short critical section.
//! Snapshot replacement runs in a single transaction so a crash can never
//! leave a scope half-updated — later diffs always compare against a
//! complete cycle.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::diff::ChangeEvent;
use crate::directory::EntrySnapshot;
use crate::errors::Result;
use crate::exec::{ExecOutcome, ExecStatus, ExecutionRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS snapshots (
    scope_key  TEXT NOT NULL,
    dn         TEXT NOT NULL,
    entry_dn   TEXT NOT NULL,
    entry_uuid TEXT,
    attrs_json TEXT NOT NULL,
    attr_hash  TEXT NOT NULL,
    modify_ts  TEXT,
    PRIMARY KEY (scope_key, dn)
);

CREATE TABLE IF NOT EXISTS watermarks (
    scope_key TEXT PRIMARY KEY,
    watermark TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS changes (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    detected_at_ms INTEGER NOT NULL,
    scope_key      TEXT NOT NULL,
    dn             TEXT NOT NULL,
    kind           TEXT NOT NULL,
    detail         TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS executions (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    rule           TEXT NOT NULL,
    attempt        INTEGER NOT NULL,
    started_at_ms  INTEGER,
    finished_at_ms INTEGER,
    exit_code      INTEGER,
    outcome        TEXT,
    status         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_executions_rule ON executions (rule, id);
";

pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = ?path.as_ref(), "state store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests and `--dry-run` style usage.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("state store mutex poisoned").into())
    }

    // ---- snapshots -----------------------------------------------------

    /// Load the last committed snapshot set for a scope, keyed by
    /// normalized DN.
    pub fn load_snapshots(&self, scope_key: &str) -> Result<BTreeMap<String, EntrySnapshot>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT dn, entry_dn, entry_uuid, attrs_json, modify_ts
             FROM snapshots WHERE scope_key = ?1",
        )?;

        let rows = stmt.query_map(params![scope_key], |row| {
            let key: String = row.get(0)?;
            let entry_dn: String = row.get(1)?;
            let entry_uuid: Option<String> = row.get(2)?;
            let attrs_json: String = row.get(3)?;
            let modify_ts: Option<String> = row.get(4)?;
            Ok((key, entry_dn, entry_uuid, attrs_json, modify_ts))
        })?;

        let mut snapshots = BTreeMap::new();
        for row in rows {
            let (key, entry_dn, entry_uuid, attrs_json, modify_ts) = row?;
            let attributes: BTreeMap<String, Vec<String>> = serde_json::from_str(&attrs_json)
                .map_err(|e| anyhow!("corrupt snapshot attributes for '{key}': {e}"))?;
            snapshots.insert(
                key,
                EntrySnapshot::new(entry_dn, entry_uuid, attributes, modify_ts),
            );
        }
        Ok(snapshots)
    }

    /// Atomically replace a scope's snapshot set with the new cycle's.
    pub fn replace_snapshots(
        &self,
        scope_key: &str,
        snapshots: &BTreeMap<String, EntrySnapshot>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM snapshots WHERE scope_key = ?1", params![scope_key])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO snapshots
                 (scope_key, dn, entry_dn, entry_uuid, attrs_json, attr_hash, modify_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for (key, snap) in snapshots {
                let attrs_json = serde_json::to_string(&snap.attributes)
                    .map_err(|e| anyhow!("serializing snapshot attributes: {e}"))?;
                stmt.execute(params![
                    scope_key,
                    key,
                    snap.dn,
                    snap.entry_uuid,
                    attrs_json,
                    snap.attr_hash(),
                    snap.modify_ts,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    // ---- watermarks ----------------------------------------------------

    /// `None` means this scope has never completed a cycle (baseline).
    pub fn watermark(&self, scope_key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let wm = conn
            .query_row(
                "SELECT watermark FROM watermarks WHERE scope_key = ?1",
                params![scope_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(wm)
    }

    pub fn set_watermark(&self, scope_key: &str, watermark: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO watermarks (scope_key, watermark) VALUES (?1, ?2)
             ON CONFLICT (scope_key) DO UPDATE SET watermark = excluded.watermark",
            params![scope_key, watermark],
        )?;
        Ok(())
    }

    /// Drop persisted state for scopes that are no longer configured
    /// (rules removed or rewritten on reload).
    pub fn prune_scopes(&self, active: &[&str]) -> Result<usize> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT DISTINCT scope_key FROM snapshots")?;
        let known: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<_, _>>()?;
        drop(stmt);

        let mut pruned = 0;
        for scope in known {
            if !active.contains(&scope.as_str()) {
                conn.execute("DELETE FROM snapshots WHERE scope_key = ?1", params![scope])?;
                conn.execute("DELETE FROM watermarks WHERE scope_key = ?1", params![scope])?;
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!(pruned, "pruned stale scope state");
        }
        Ok(pruned)
    }

    // ---- audit trail ---------------------------------------------------

    pub fn append_change(&self, scope_key: &str, event: &ChangeEvent) -> Result<()> {
        let detail = serde_json::to_string(&event.changes)
            .map_err(|e| anyhow!("serializing change detail: {e}"))?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO changes (detected_at_ms, scope_key, dn, kind, detail)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                to_millis(Some(event.detected_at)),
                scope_key,
                event.dn,
                kind_str(event),
                detail,
            ],
        )?;
        Ok(())
    }

    // ---- execution log -------------------------------------------------

    pub fn append_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO executions
             (rule, attempt, started_at_ms, finished_at_ms, exit_code, outcome, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.rule,
                record.attempt,
                to_millis(record.started_at),
                to_millis(record.finished_at),
                record.exit_code,
                record.outcome.map(|o| o.as_str()),
                record.status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Latest execution log entry for a rule, if any.
    pub fn last_execution(&self, rule: &str) -> Result<Option<ExecutionRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT rule, attempt, started_at_ms, finished_at_ms, exit_code, outcome, status
                 FROM executions WHERE rule = ?1 ORDER BY id DESC LIMIT 1",
                params![rule],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// Full execution history for a rule, oldest first.
    pub fn executions(&self, rule: &str) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT rule, attempt, started_at_ms, finished_at_ms, exit_code, outcome, status
             FROM executions WHERE rule = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![rule], row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let outcome: Option<String> = row.get(5)?;
    let status: String = row.get(6)?;
    Ok(ExecutionRecord {
        rule: row.get(0)?,
        attempt: row.get(1)?,
        started_at: from_millis(row.get(2)?),
        finished_at: from_millis(row.get(3)?),
        exit_code: row.get(4)?,
        outcome: outcome.as_deref().and_then(ExecOutcome::from_str),
        status: ExecStatus::from_str(&status).unwrap_or(ExecStatus::Abandoned),
    })
}

fn kind_str(event: &ChangeEvent) -> &'static str {
    use crate::diff::ChangeKind;
    match event.kind {
        ChangeKind::Added => "added",
        ChangeKind::Modified => "modified",
        ChangeKind::Removed => "removed",
    }
}

fn to_millis(time: Option<SystemTime>) -> Option<i64> {
    time.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
}

fn from_millis(millis: Option<i64>) -> Option<SystemTime> {
    millis.map(|ms| UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{AttributeChange, ChangeKind};

    fn snap(dn: &str, uuid: Option<&str>, member: &[&str]) -> EntrySnapshot {
        EntrySnapshot::new(
            dn,
            uuid.map(str::to_string),
            BTreeMap::from([(
                "memberuid".to_string(),
                member.iter().map(|m| m.to_string()).collect(),
            )]),
            Some("20260101120000Z".to_string()),
        )
    }

    #[test]
    fn snapshots_round_trip_through_the_store() {
        let store = StateStore::open_in_memory().expect("open");

        let mut set = BTreeMap::new();
        set.insert(
            "cn=staff,ou=groups".to_string(),
            snap("cn=Staff,ou=Groups", Some("u-1"), &["alice", "bob"]),
        );
        store.replace_snapshots("scope-a", &set).expect("replace");

        let loaded = store.load_snapshots("scope-a").expect("load");
        assert_eq!(loaded.len(), 1);
        let entry = &loaded["cn=staff,ou=groups"];
        assert_eq!(entry.dn, "cn=Staff,ou=Groups");
        assert_eq!(entry.entry_uuid.as_deref(), Some("u-1"));
        assert_eq!(entry.attributes["memberuid"], vec!["alice", "bob"]);

        // A second replace supersedes the first wholesale.
        store
            .replace_snapshots("scope-a", &BTreeMap::new())
            .expect("replace empty");
        assert!(store.load_snapshots("scope-a").expect("load").is_empty());
    }

    #[test]
    fn snapshots_are_namespaced_by_scope() {
        let store = StateStore::open_in_memory().expect("open");
        let mut set = BTreeMap::new();
        set.insert("cn=a".to_string(), snap("cn=a", None, &["x"]));
        store.replace_snapshots("scope-a", &set).expect("replace");

        assert!(store.load_snapshots("scope-b").expect("load").is_empty());
    }

    #[test]
    fn watermark_round_trip_and_baseline() {
        let store = StateStore::open_in_memory().expect("open");
        assert_eq!(store.watermark("scope-a").expect("get"), None);

        store.set_watermark("scope-a", "20260101120000Z").expect("set");
        assert_eq!(
            store.watermark("scope-a").expect("get").as_deref(),
            Some("20260101120000Z")
        );

        store.set_watermark("scope-a", "20260202120000Z").expect("set");
        assert_eq!(
            store.watermark("scope-a").expect("get").as_deref(),
            Some("20260202120000Z")
        );
    }

    #[test]
    fn prune_drops_unconfigured_scopes() {
        let store = StateStore::open_in_memory().expect("open");
        let mut set = BTreeMap::new();
        set.insert("cn=a".to_string(), snap("cn=a", None, &["x"]));
        store.replace_snapshots("old", &set).expect("replace");
        store.set_watermark("old", "wm").expect("set");
        store.replace_snapshots("active", &set).expect("replace");

        let pruned = store.prune_scopes(&["active"]).expect("prune");
        assert_eq!(pruned, 1);
        assert!(store.load_snapshots("old").expect("load").is_empty());
        assert_eq!(store.load_snapshots("active").expect("load").len(), 1);
    }

    #[test]
    fn execution_log_is_append_only_and_ordered() {
        let store = StateStore::open_in_memory().expect("open");
        let started = SystemTime::UNIX_EPOCH + Duration::from_secs(100);

        store
            .append_execution(&ExecutionRecord {
                rule: "groups".into(),
                attempt: 1,
                started_at: Some(started),
                finished_at: None,
                exit_code: None,
                outcome: None,
                status: ExecStatus::Running,
            })
            .expect("append");
        store
            .append_execution(&ExecutionRecord {
                rule: "groups".into(),
                attempt: 1,
                started_at: Some(started),
                finished_at: Some(started + Duration::from_secs(5)),
                exit_code: Some(0),
                outcome: Some(ExecOutcome::Succeeded),
                status: ExecStatus::Succeeded,
            })
            .expect("append");

        let history = store.executions("groups").expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, ExecStatus::Running);
        assert_eq!(history[1].status, ExecStatus::Succeeded);
        assert_eq!(history[1].exit_code, Some(0));

        let last = store.last_execution("groups").expect("last").expect("some");
        assert_eq!(last.status, ExecStatus::Succeeded);
        assert_eq!(last.outcome, Some(ExecOutcome::Succeeded));

        assert!(store.last_execution("other").expect("last").is_none());
    }

    #[test]
    fn change_audit_rows_are_recorded() {
        let store = StateStore::open_in_memory().expect("open");
        store
            .append_change(
                "scope-a",
                &ChangeEvent {
                    dn: "cn=staff,ou=groups".into(),
                    entry_uuid: Some("u-1".into()),
                    kind: ChangeKind::Modified,
                    changes: vec![AttributeChange {
                        attribute: "memberuid".into(),
                        old: vec!["alice".into()],
                        new: vec!["alice".into(), "bob".into()],
                    }],
                    detected_at: SystemTime::UNIX_EPOCH + Duration::from_secs(42),
                },
            )
            .expect("append");
    }
}
