//! SQLite-backed reference implementation of the persistence port.
//!
//! One connection guarded by an async mutex; every port operation runs as
//! a single immediate transaction with bounded retry on lock contention
//! and duplicate-key tolerance for replayed events. Statements go through
//! the connection's prepared-statement cache.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tokio::sync::Mutex;
use tracing::warn;

use super::{Backing, Store, StoreError};
use crate::models::{join_access_modes, BackingKind, ContainerDesc};
use crate::observability::TrackerMetrics;
use crate::resources::{ResourceKind, PV_SCOPE};

/// Backoff between attempts when the database reports contention.
const RETRY_BACKOFF: Duration = Duration::from_millis(50);
/// Contention retry budget; exhaustion is surfaced as fatal.
const MAX_TX_ATTEMPTS: u32 = 5;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pod (
    uid TEXT PRIMARY KEY,
    name TEXT,
    namespace TEXT,
    create_time INTEGER,
    delete_time INTEGER,
    json TEXT
);
CREATE TABLE IF NOT EXISTS pv (
    uid TEXT PRIMARY KEY,
    name TEXT,
    create_time INTEGER,
    delete_time INTEGER,
    storage INTEGER,
    access_modes TEXT,
    json TEXT,
    nfs_id INTEGER,
    iscsi_id INTEGER
);
CREATE TABLE IF NOT EXISTS pvc (
    uid TEXT PRIMARY KEY,
    name TEXT,
    namespace TEXT,
    create_time INTEGER,
    delete_time INTEGER,
    bind_time INTEGER,
    pv_uid TEXT,
    storage INTEGER,
    access_modes TEXT,
    json TEXT
);
CREATE TABLE IF NOT EXISTS container (
    pod_uid TEXT,
    name TEXT,
    image TEXT,
    command TEXT,
    PRIMARY KEY (pod_uid, name)
);
CREATE TABLE IF NOT EXISTS nfs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ip_addr TEXT,
    path TEXT,
    UNIQUE (ip_addr, path)
);
CREATE TABLE IF NOT EXISTS iscsi (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    target_portal TEXT,
    iqn TEXT,
    lun INTEGER,
    fs_type TEXT,
    UNIQUE (target_portal, iqn, lun, fs_type)
);
CREATE TABLE IF NOT EXISTS pod_mount (
    pod_uid TEXT,
    pvc_uid TEXT,
    pvc_name TEXT,
    container_name TEXT,
    read_only INTEGER,
    PRIMARY KEY (pod_uid, pvc_name, container_name)
);
CREATE TABLE IF NOT EXISTS resource_version (
    resource TEXT,
    namespace TEXT,
    resource_version TEXT,
    PRIMARY KEY (resource, namespace)
);
CREATE INDEX IF NOT EXISTS pvc_name_create ON pvc (name, create_time);
";

/// Durable store backed by a single SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    metrics: TrackerMetrics,
}

impl SqliteStore {
    /// Opens (creating if necessary) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(map_sqlite_err)?;
        Self::init(conn)
    }

    /// Private database for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(map_sqlite_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "wal")
            .map_err(map_sqlite_err)?;
        conn.pragma_update(None, "synchronous", "normal")
            .map_err(map_sqlite_err)?;
        conn.execute_batch(SCHEMA).map_err(map_sqlite_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            metrics: TrackerMetrics::new(),
        })
    }

    /// Runs `f` inside a transaction, retrying on contention. A
    /// duplicate-key failure rolls the transaction back and is reported
    /// as success: it means the event was already applied before a
    /// resume.
    async fn run_tx<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: Fn(&rusqlite::Transaction<'_>) -> Result<(), StoreError>,
    {
        match self.run_tx_value(f).await {
            Ok(()) => Ok(()),
            Err(StoreError::Duplicate(detail)) => {
                warn!(detail = %detail, "Ignoring duplicate key from replayed event");
                self.metrics.inc_store_conflict();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Like [`run_tx`], but propagates duplicates and returns a value.
    async fn run_tx_value<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: Fn(&rusqlite::Transaction<'_>) -> Result<T, StoreError>,
    {
        let mut conn = self.conn.lock().await;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = (|| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(map_sqlite_err)?;
                let value = f(&tx)?;
                tx.commit().map_err(map_sqlite_err)?;
                Ok(value)
            })();
            match result {
                Err(StoreError::Busy(detail)) => {
                    if attempt >= MAX_TX_ATTEMPTS {
                        return Err(StoreError::RetryExhausted {
                            attempts: attempt,
                            detail,
                        });
                    }
                    self.metrics.inc_store_retry();
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                other => return other,
            }
        }
    }
}

fn map_sqlite_err(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                StoreError::Busy(e.to_string())
            }
            ErrorCode::ConstraintViolation => StoreError::Duplicate(e.to_string()),
            _ => StoreError::Backend(e.to_string()),
        },
        _ => StoreError::Backend(e.to_string()),
    }
}

fn micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

fn exec(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<usize, StoreError> {
    let mut stmt = conn.prepare_cached(sql).map_err(map_sqlite_err)?;
    stmt.execute(params).map_err(map_sqlite_err)
}

fn query_opt<T: rusqlite::types::FromSql>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Option<T>, StoreError> {
    let mut stmt = conn.prepare_cached(sql).map_err(map_sqlite_err)?;
    stmt.query_row(params, |row| row.get(0))
        .optional()
        .map_err(map_sqlite_err)
}

fn update_rv(
    tx: &rusqlite::Transaction<'_>,
    resource: ResourceKind,
    scope: &str,
    rv: &str,
) -> Result<(), StoreError> {
    exec(
        tx,
        "INSERT INTO resource_version (resource, namespace, resource_version) \
         VALUES (?1, ?2, ?3) \
         ON CONFLICT (resource, namespace) \
         DO UPDATE SET resource_version = excluded.resource_version",
        &[&resource.as_str(), &scope, &rv],
    )?;
    Ok(())
}

fn backing_ids(backing: Option<Backing>) -> (Option<i64>, Option<i64>) {
    match backing {
        Some(Backing {
            kind: BackingKind::Nfs,
            id,
        }) => (Some(id), None),
        Some(Backing {
            kind: BackingKind::Iscsi,
            id,
        }) => (None, Some(id)),
        None => (None, None),
    }
}

/// Picks the claim uid a mount edge should reference, given the pod's
/// creation time. First choice is the most recent claim alive at that
/// instant; failing that, the earliest claim created afterwards that was
/// not already gone (a speculative match, corrected at pod deletion).
fn resolve_claim_uid(
    tx: &rusqlite::Transaction<'_>,
    claim_name: &str,
    at: i64,
) -> Result<Option<String>, StoreError> {
    if let Some(uid) = query_opt::<String>(
        tx,
        "SELECT uid FROM pvc \
         WHERE name = ?1 AND create_time <= ?2 \
           AND (delete_time IS NULL OR delete_time >= ?2) \
         ORDER BY create_time DESC LIMIT 1",
        &[&claim_name, &at],
    )? {
        return Ok(Some(uid));
    }
    query_opt::<String>(
        tx,
        "SELECT uid FROM pvc \
         WHERE name = ?1 AND create_time >= ?2 \
           AND (delete_time IS NULL OR delete_time > ?2) \
         ORDER BY create_time ASC LIMIT 1",
        &[&claim_name, &at],
    )
}

#[async_trait]
impl Store for SqliteStore {
    async fn validate(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(map_sqlite_err)
    }

    async fn insert_pod(
        &self,
        uid: &str,
        name: &str,
        create_time: DateTime<Utc>,
        namespace: &str,
        containers: &[ContainerDesc],
        raw: &str,
        scope: &str,
        rv: &str,
    ) -> Result<(), StoreError> {
        let at = micros(create_time);
        self.run_tx(|tx| {
            exec(
                tx,
                "INSERT INTO pod (uid, name, namespace, create_time, json) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT (uid) DO UPDATE SET name = excluded.name, \
                 namespace = excluded.namespace, create_time = excluded.create_time, \
                 json = excluded.json",
                &[&uid, &name, &namespace, &at, &raw],
            )?;
            for container in containers {
                exec(
                    tx,
                    "INSERT OR REPLACE INTO container (pod_uid, name, image, command) \
                     VALUES (?1, ?2, ?3, ?4)",
                    &[&uid, &container.name, &container.image, &container.command],
                )?;
                for mount in &container.claim_mounts {
                    let pvc_uid = resolve_claim_uid(tx, &mount.claim_name, at)?;
                    exec(
                        tx,
                        "INSERT OR IGNORE INTO pod_mount \
                         (pod_uid, pvc_uid, pvc_name, container_name, read_only) \
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        &[
                            &uid,
                            &pvc_uid,
                            &mount.claim_name,
                            &container.name,
                            &mount.read_only,
                        ],
                    )?;
                }
            }
            update_rv(tx, ResourceKind::Pods, scope, rv)
        })
        .await
    }

    async fn insert_pv(
        &self,
        uid: &str,
        name: &str,
        create_time: DateTime<Utc>,
        backing: Option<Backing>,
        capacity: i64,
        access_modes: &[String],
        raw: &str,
        rv: &str,
    ) -> Result<(), StoreError> {
        let (nfs_id, iscsi_id) = backing_ids(backing);
        let modes = join_access_modes(access_modes);
        let at = micros(create_time);
        self.run_tx(|tx| {
            exec(
                tx,
                "INSERT INTO pv (uid, name, create_time, storage, access_modes, json, \
                 nfs_id, iscsi_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                 ON CONFLICT (uid) DO UPDATE SET name = excluded.name, \
                 create_time = excluded.create_time, storage = excluded.storage, \
                 access_modes = excluded.access_modes, json = excluded.json, \
                 nfs_id = excluded.nfs_id, iscsi_id = excluded.iscsi_id",
                &[&uid, &name, &at, &capacity, &modes, &raw, &nfs_id, &iscsi_id],
            )?;
            update_rv(tx, ResourceKind::PersistentVolumes, PV_SCOPE, rv)
        })
        .await
    }

    async fn insert_pvc(
        &self,
        uid: &str,
        name: &str,
        create_time: DateTime<Utc>,
        namespace: &str,
        capacity: i64,
        access_modes: &[String],
        raw: &str,
        scope: &str,
        rv: &str,
    ) -> Result<(), StoreError> {
        let modes = join_access_modes(access_modes);
        let at = micros(create_time);
        self.run_tx(|tx| {
            // The row may already exist as the target of an early bind;
            // bind fields are left untouched.
            exec(
                tx,
                "INSERT INTO pvc (uid, name, namespace, create_time, storage, \
                 access_modes, json) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT (uid) DO UPDATE SET name = excluded.name, \
                 namespace = excluded.namespace, create_time = excluded.create_time, \
                 storage = excluded.storage, access_modes = excluded.access_modes, \
                 json = excluded.json",
                &[&uid, &name, &namespace, &at, &capacity, &modes, &raw],
            )?;
            // Promote mount edges of this name for every pod still alive.
            // An edge that already carries a uid is re-pointed too; stale
            // matches self-correct as later claim events arrive.
            exec(
                tx,
                "UPDATE pod_mount SET pvc_uid = ?1 WHERE pvc_name = ?2 AND \
                 pod_uid IN (SELECT uid FROM pod WHERE delete_time IS NULL)",
                &[&uid, &name],
            )?;
            update_rv(tx, ResourceKind::PersistentVolumeClaims, scope, rv)
        })
        .await
    }

    async fn insert_nfs(&self, server: &str, path: &str) -> Result<i64, StoreError> {
        self.run_tx_value(|tx| {
            if let Some(id) = query_opt::<i64>(
                tx,
                "SELECT id FROM nfs WHERE ip_addr = ?1 AND path = ?2",
                &[&server, &path],
            )? {
                return Ok(id);
            }
            exec(
                tx,
                "INSERT OR IGNORE INTO nfs (ip_addr, path) VALUES (?1, ?2)",
                &[&server, &path],
            )?;
            query_opt::<i64>(
                tx,
                "SELECT id FROM nfs WHERE ip_addr = ?1 AND path = ?2",
                &[&server, &path],
            )?
            .ok_or_else(|| StoreError::Backend("interned NFS row not found".into()))
        })
        .await
    }

    async fn insert_iscsi(
        &self,
        target_portal: &str,
        iqn: &str,
        lun: i64,
        fs_type: &str,
    ) -> Result<i64, StoreError> {
        self.run_tx_value(|tx| {
            if let Some(id) = query_opt::<i64>(
                tx,
                "SELECT id FROM iscsi WHERE target_portal = ?1 AND iqn = ?2 \
                 AND lun = ?3 AND fs_type = ?4",
                &[&target_portal, &iqn, &lun, &fs_type],
            )? {
                return Ok(id);
            }
            exec(
                tx,
                "INSERT OR IGNORE INTO iscsi (target_portal, iqn, lun, fs_type) \
                 VALUES (?1, ?2, ?3, ?4)",
                &[&target_portal, &iqn, &lun, &fs_type],
            )?;
            query_opt::<i64>(
                tx,
                "SELECT id FROM iscsi WHERE target_portal = ?1 AND iqn = ?2 \
                 AND lun = ?3 AND fs_type = ?4",
                &[&target_portal, &iqn, &lun, &fs_type],
            )?
            .ok_or_else(|| StoreError::Backend("interned iSCSI row not found".into()))
        })
        .await
    }

    async fn bind_pvc(
        &self,
        pv_uid: &str,
        pvc_uid: &str,
        bind_time: DateTime<Utc>,
        rv: &str,
    ) -> Result<(), StoreError> {
        let at = micros(bind_time);
        self.run_tx(|tx| {
            exec(
                tx,
                "INSERT INTO pvc (uid, pv_uid, bind_time) VALUES (?1, ?2, ?3) \
                 ON CONFLICT (uid) DO UPDATE SET pv_uid = excluded.pv_uid, \
                 bind_time = excluded.bind_time",
                &[&pvc_uid, &pv_uid, &at],
            )?;
            // The resource version belongs to the PV feed, not the PVC.
            update_rv(tx, ResourceKind::PersistentVolumes, PV_SCOPE, rv)
        })
        .await
    }

    async fn update_pv(
        &self,
        uid: &str,
        backing: Option<Backing>,
        capacity: i64,
        access_modes: &[String],
        raw: &str,
        rv: &str,
    ) -> Result<(), StoreError> {
        let (nfs_id, iscsi_id) = backing_ids(backing);
        let modes = join_access_modes(access_modes);
        self.run_tx(|tx| {
            exec(
                tx,
                "UPDATE pv SET nfs_id = ?1, iscsi_id = ?2, storage = ?3, \
                 access_modes = ?4, json = ?5 WHERE uid = ?6",
                &[&nfs_id, &iscsi_id, &capacity, &modes, &raw, &uid],
            )?;
            update_rv(tx, ResourceKind::PersistentVolumes, PV_SCOPE, rv)
        })
        .await
    }

    async fn update_pvc(
        &self,
        uid: &str,
        capacity: i64,
        access_modes: &[String],
        raw: &str,
        scope: &str,
        rv: &str,
    ) -> Result<(), StoreError> {
        let modes = join_access_modes(access_modes);
        self.run_tx(|tx| {
            exec(
                tx,
                "UPDATE pvc SET storage = ?1, access_modes = ?2, json = ?3 \
                 WHERE uid = ?4",
                &[&capacity, &modes, &raw, &uid],
            )?;
            update_rv(tx, ResourceKind::PersistentVolumeClaims, scope, rv)
        })
        .await
    }

    async fn delete_pod(
        &self,
        uid: &str,
        delete_time: DateTime<Utc>,
        scope: &str,
        rv: &str,
    ) -> Result<(), StoreError> {
        let at = micros(delete_time);
        self.run_tx(|tx| {
            exec(
                tx,
                "UPDATE pod SET delete_time = ?1 WHERE uid = ?2 AND delete_time IS NULL",
                &[&at, &uid],
            )?;
            // Edges pointing at claims created after the pod died were
            // speculative mismatches. If any exist, the pod's real mount
            // history is unknowable, so every edge for the pod goes.
            let cleared = exec(
                tx,
                "DELETE FROM pod_mount WHERE pod_uid = ?1 AND pvc_uid IN \
                 (SELECT uid FROM pvc WHERE create_time > ?2)",
                &[&uid, &at],
            )?;
            if cleared > 0 {
                exec(tx, "DELETE FROM pod_mount WHERE pod_uid = ?1", &[&uid])?;
            }
            update_rv(tx, ResourceKind::Pods, scope, rv)
        })
        .await
    }

    async fn delete_pv(
        &self,
        uid: &str,
        delete_time: DateTime<Utc>,
        rv: &str,
    ) -> Result<(), StoreError> {
        let at = micros(delete_time);
        self.run_tx(|tx| {
            exec(
                tx,
                "UPDATE pv SET delete_time = ?1 WHERE uid = ?2 AND delete_time IS NULL",
                &[&at, &uid],
            )?;
            update_rv(tx, ResourceKind::PersistentVolumes, PV_SCOPE, rv)
        })
        .await
    }

    async fn delete_pvc(
        &self,
        uid: &str,
        delete_time: DateTime<Utc>,
        scope: &str,
        rv: &str,
    ) -> Result<(), StoreError> {
        let at = micros(delete_time);
        self.run_tx(|tx| {
            exec(
                tx,
                "UPDATE pvc SET delete_time = ?1 WHERE uid = ?2 AND delete_time IS NULL",
                &[&at, &uid],
            )?;
            update_rv(tx, ResourceKind::PersistentVolumeClaims, scope, rv)
        })
        .await
    }

    async fn checkpoint(
        &self,
        resource: ResourceKind,
        scope: &str,
    ) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().await;
        query_opt::<String>(
            &conn,
            "SELECT resource_version FROM resource_version \
             WHERE resource = ?1 AND namespace = ?2",
            &[&resource.as_str(), &scope],
        )
    }
}

impl SqliteStore {
    /// Test/debug helper: one scalar query against the underlying
    /// database.
    pub async fn query_scalar<T: rusqlite::types::FromSql>(
        &self,
        sql: &str,
    ) -> Result<Option<T>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(sql).map_err(map_sqlite_err)?;
        stmt.query_row([], |row| row.get(0))
            .optional()
            .map_err(map_sqlite_err)
    }
}
