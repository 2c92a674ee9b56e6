//! Persistence port for the storage-object history record.
//!
//! Every mutating operation is a single transaction; implementations must
//! be safe to share across the per-resource reconcilers. Checkpoints are
//! written inside the same transaction as the event they account for, so
//! the stored resume token always matches the last applied event.

mod memory;
mod sqlite;

pub use memory::{MemoryStore, MountRow, PodAttrs, PvAttrs, PvcAttrs};
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{BackingKind, ContainerDesc};
use crate::resources::ResourceKind;

/// Reference to an interned backing source row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backing {
    pub kind: BackingKind,
    pub id: i64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique-key violation. Expected when events replay after a resume;
    /// callers and implementations treat it as success.
    #[error("duplicate key: {0}")]
    Duplicate(String),
    /// Transient lock contention; retried internally with backoff.
    #[error("store busy: {0}")]
    Busy(String),
    /// Retry budget for lock contention exhausted.
    #[error("store busy after {attempts} attempts: {detail}")]
    RetryExhausted { attempts: u32, detail: String },
    /// Data that violates the store's expectations.
    #[error("invalid store operation: {0}")]
    Invalid(String),
    /// Any other backend failure; fatal to the calling reconciler.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Durable, transactional record of pods, volumes, claims, and the mount
/// edges between them.
#[async_trait]
pub trait Store: Send + Sync {
    /// Connectivity probe; fails fast if the backend is unusable.
    async fn validate(&self) -> Result<(), StoreError>;

    /// Upserts a pod with its containers and, per container, one mount
    /// edge per referenced claim name. Checkpoints (pods, scope) to `rv`
    /// in the same transaction.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<(), StoreError>;

    /// Upserts a persistent volume. `backing` references a previously
    /// interned NFS or iSCSI row. Checkpoints the PV sentinel scope.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<(), StoreError>;

    /// Upserts a claim. The row may already exist as the target of an
    /// early bind; non-key fields are overwritten while bind fields are
    /// preserved. Afterwards, every mount edge with this claim name whose
    /// pod is still alive is promoted to carry this uid.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<(), StoreError>;

    /// Interns an NFS backing source, returning its id. Idempotent.
    async fn insert_nfs(&self, server: &str, path: &str) -> Result<i64, StoreError>;

    /// Interns an iSCSI backing source, returning its id. Idempotent.
    async fn insert_iscsi(
        &self,
        target_portal: &str,
        iqn: &str,
        lun: i64,
        fs_type: &str,
    ) -> Result<i64, StoreError>;

    /// Records a PV↔PVC binding, creating a minimal claim row if none
    /// exists yet. Bind evidence arrives on the PV feed, so this
    /// checkpoints the PV resource.
    async fn bind_pvc(
        &self,
        pv_uid: &str,
        pvc_uid: &str,
        bind_time: DateTime<Utc>,
        rv: &str,
    ) -> Result<(), StoreError>;

    /// Replaces the mutable fields of an existing PV.
    async fn update_pv(
        &self,
        uid: &str,
        backing: Option<Backing>,
        capacity: i64,
        access_modes: &[String],
        raw: &str,
        rv: &str,
    ) -> Result<(), StoreError>;

    /// Replaces the mutable fields of an existing claim.
    async fn update_pvc(
        &self,
        uid: &str,
        capacity: i64,
        access_modes: &[String],
        raw: &str,
        scope: &str,
        rv: &str,
    ) -> Result<(), StoreError>;

    /// Stamps a pod's delete time (write-once) and clears mount edges
    /// that point at claims created after the pod died: such edges were
    /// speculative matches, and once one is found the pod's true mount
    /// history is unknowable, so all of its edges are dropped.
    async fn delete_pod(
        &self,
        uid: &str,
        delete_time: DateTime<Utc>,
        scope: &str,
        rv: &str,
    ) -> Result<(), StoreError>;

    /// Stamps a PV's delete time (write-once).
    async fn delete_pv(
        &self,
        uid: &str,
        delete_time: DateTime<Utc>,
        rv: &str,
    ) -> Result<(), StoreError>;

    /// Stamps a claim's delete time (write-once).
    async fn delete_pvc(
        &self,
        uid: &str,
        delete_time: DateTime<Utc>,
        scope: &str,
        rv: &str,
    ) -> Result<(), StoreError>;

    /// Last successfully applied resource version for (resource, scope),
    /// if any event has been applied.
    async fn checkpoint(
        &self,
        resource: ResourceKind,
        scope: &str,
    ) -> Result<Option<String>, StoreError>;
}
