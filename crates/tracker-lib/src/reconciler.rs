//! Per-resource reconciliation loop.
//!
//! One reconciler runs per watched (resource kind, scope). It resumes the
//! watch from the stored checkpoint, applies each frame to the persistence
//! port, and handles the three ways a stream ends: reconnect with the same
//! token on transport trouble, refresh from an empty token when the feed
//! has discarded history past the checkpoint, and terminate on shutdown.
//! Decode and persistence failures are fatal.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::event::{
    EventKind, PodObject, PvObject, PvcObject, ResourceObject, WatchEvent,
};
use crate::models::{join_command, BackingKind, ContainerDesc, MountRef};
use crate::observability::TrackerMetrics;
use crate::resources::{ResourceKind, PV_SCOPE};
use crate::store::{Backing, Store, StoreError};
use crate::watch::{ApiClient, WatchError, WatchFrame};

const PHASE_BOUND: &str = "Bound";
const PHASE_AVAILABLE: &str = "Available";
const PHASE_PENDING: &str = "Pending";

/// Storage capacity key in quantity maps.
const STORAGE_RESOURCE: &str = "storage";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("watch stream failed: {0}")]
    Decode(String),
    #[error("malformed event: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Pause before re-opening the watch after a transport error.
    pub connect_retry: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            connect_retry: Duration::from_secs(1),
        }
    }
}

/// Consumes one resource kind's watch feed and applies it to the store.
pub struct Reconciler {
    kind: ResourceKind,
    namespace: String,
    client: Arc<ApiClient>,
    store: Arc<dyn Store>,
    config: ReconcilerConfig,
    metrics: TrackerMetrics,
}

impl Reconciler {
    pub fn new(
        kind: ResourceKind,
        namespace: impl Into<String>,
        client: Arc<ApiClient>,
        store: Arc<dyn Store>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            client,
            store,
            config,
            metrics: TrackerMetrics::new(),
        }
    }

    /// Checkpoint scope for this reconciler: PVs are cluster-scoped and
    /// share a sentinel scope; everything else uses the watch namespace.
    fn scope(&self) -> &str {
        if self.kind == ResourceKind::PersistentVolumes {
            PV_SCOPE
        } else {
            &self.namespace
        }
    }

    async fn resume_token(&self, initialize: bool) -> Result<Option<String>, StoreError> {
        if initialize {
            return Ok(None);
        }
        let token = self.store.checkpoint(self.kind, self.scope()).await?;
        debug!(
            resource = %self.kind,
            scope = %self.scope(),
            token = token.as_deref().unwrap_or(""),
            "Resuming from stored checkpoint"
        );
        Ok(token)
    }

    /// Runs until shutdown fires or a fatal error occurs.
    pub async fn run(
        self,
        mut initialize: bool,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ReconcileError> {
        loop {
            let token = self.resume_token(initialize).await?;
            initialize = false;
            let mut last_rv = token.clone().unwrap_or_default();
            let mut stream = self
                .client
                .watch(self.kind, &self.namespace, token.as_deref());

            loop {
                let frame = tokio::select! {
                    frame = stream.recv() => frame,
                    _ = shutdown.recv() => {
                        info!(resource = %self.kind, "Stopping watch");
                        return Ok(());
                    }
                };
                match frame {
                    None => {
                        // EOF: the feed closed the stream; resume from
                        // the current token.
                        debug!(resource = %self.kind, "Watch stream ended; reconnecting");
                        self.metrics.inc_reconnect(self.kind);
                        break;
                    }
                    Some(WatchFrame::Event(event)) => {
                        let rv = event.object.resource_version();
                        if rv == last_rv {
                            debug!(
                                resource = %self.kind,
                                rv = %rv,
                                "Skipping duplicate resource version"
                            );
                            continue;
                        }
                        last_rv = rv.to_string();
                        self.apply(&event).await?;
                        self.metrics.inc_event(self.kind, event.kind);
                    }
                    Some(WatchFrame::Control(status)) => {
                        if status.is_horizon_lost() {
                            warn!(
                                resource = %self.kind,
                                "Resume token past feed horizon; refreshing from scratch"
                            );
                            self.metrics.inc_refresh(self.kind);
                            initialize = true;
                        } else {
                            warn!(
                                resource = %self.kind,
                                code = status.code,
                                message = %status.message,
                                "Feed reported status; reconnecting"
                            );
                        }
                        break;
                    }
                    Some(WatchFrame::Failed(WatchError::Io(detail))) => {
                        warn!(resource = %self.kind, error = %detail, "Watch I/O error");
                        self.metrics.inc_reconnect(self.kind);
                        tokio::select! {
                            _ = tokio::time::sleep(self.config.connect_retry) => {}
                            _ = shutdown.recv() => {
                                info!(resource = %self.kind, "Stopping watch");
                                return Ok(());
                            }
                        }
                        break;
                    }
                    Some(WatchFrame::Failed(WatchError::Decode(e))) => {
                        return Err(ReconcileError::Decode(e.to_string()));
                    }
                }
            }
        }
    }

    async fn apply(&self, event: &WatchEvent) -> Result<(), ReconcileError> {
        match &event.object {
            ResourceObject::Pod(pod) => self.apply_pod(event.kind, pod, &event.raw).await,
            ResourceObject::Pv(pv) => self.apply_pv(event.kind, pv, &event.raw).await,
            ResourceObject::Pvc(pvc) => self.apply_pvc(event.kind, pvc, &event.raw).await,
        }
    }

    async fn apply_pod(
        &self,
        kind: EventKind,
        pod: &PodObject,
        raw: &str,
    ) -> Result<(), ReconcileError> {
        let meta = &pod.metadata;
        match kind {
            EventKind::Added => {
                let containers = claim_mounts(pod);
                self.store
                    .insert_pod(
                        &meta.uid,
                        &meta.name,
                        meta.creation_timestamp.unwrap_or_else(Utc::now),
                        &meta.namespace,
                        &containers,
                        raw,
                        self.scope(),
                        &meta.resource_version,
                    )
                    .await?;
            }
            // Pod modifications carry nothing the record tracks.
            EventKind::Modified => {}
            EventKind::Deleted => {
                self.store
                    .delete_pod(
                        &meta.uid,
                        meta.deletion_timestamp.unwrap_or_else(Utc::now),
                        self.scope(),
                        &meta.resource_version,
                    )
                    .await?;
            }
            EventKind::Error => {}
        }
        Ok(())
    }

    async fn apply_pv(
        &self,
        kind: EventKind,
        pv: &PvObject,
        raw: &str,
    ) -> Result<(), ReconcileError> {
        let meta = &pv.metadata;
        match kind {
            EventKind::Added => {
                let backing = self.intern_backing(pv).await?;
                self.store
                    .insert_pv(
                        &meta.uid,
                        &meta.name,
                        meta.creation_timestamp.unwrap_or_else(Utc::now),
                        backing,
                        pv_capacity(pv),
                        &pv.spec.access_modes,
                        raw,
                        &meta.resource_version,
                    )
                    .await?;
                if let Some(claim) = &pv.spec.claim_ref {
                    self.store
                        .bind_pvc(&meta.uid, &claim.uid, Utc::now(), &meta.resource_version)
                        .await?;
                }
            }
            EventKind::Modified if pv.status.phase == PHASE_BOUND => {
                let claim = pv.spec.claim_ref.as_ref().ok_or_else(|| {
                    ReconcileError::Malformed(format!(
                        "bound volume {} carries no claim reference",
                        meta.uid
                    ))
                })?;
                // The feed supplies no timestamp for phase transitions;
                // observation time is the best available bind stamp.
                self.store
                    .bind_pvc(&meta.uid, &claim.uid, Utc::now(), &meta.resource_version)
                    .await?;
            }
            EventKind::Modified if pv.status.phase == PHASE_AVAILABLE => {
                let backing = self.intern_backing(pv).await?;
                self.store
                    .update_pv(
                        &meta.uid,
                        backing,
                        pv_capacity(pv),
                        &pv.spec.access_modes,
                        raw,
                        &meta.resource_version,
                    )
                    .await?;
            }
            EventKind::Modified => {}
            EventKind::Deleted => {
                self.store
                    .delete_pv(
                        &meta.uid,
                        meta.deletion_timestamp.unwrap_or_else(Utc::now),
                        &meta.resource_version,
                    )
                    .await?;
            }
            EventKind::Error => {}
        }
        Ok(())
    }

    async fn apply_pvc(
        &self,
        kind: EventKind,
        pvc: &PvcObject,
        raw: &str,
    ) -> Result<(), ReconcileError> {
        let meta = &pvc.metadata;
        match kind {
            EventKind::Added => {
                self.store
                    .insert_pvc(
                        &meta.uid,
                        &meta.name,
                        meta.creation_timestamp.unwrap_or_else(Utc::now),
                        &meta.namespace,
                        pvc_capacity(pvc),
                        &pvc.spec.access_modes,
                        raw,
                        self.scope(),
                        &meta.resource_version,
                    )
                    .await?;
            }
            EventKind::Modified if pvc.status.phase == PHASE_PENDING => {
                self.store
                    .update_pvc(
                        &meta.uid,
                        pvc_capacity(pvc),
                        &pvc.spec.access_modes,
                        raw,
                        self.scope(),
                        &meta.resource_version,
                    )
                    .await?;
            }
            EventKind::Modified => {}
            EventKind::Deleted => {
                self.store
                    .delete_pvc(
                        &meta.uid,
                        meta.deletion_timestamp.unwrap_or_else(Utc::now),
                        self.scope(),
                        &meta.resource_version,
                    )
                    .await?;
            }
            EventKind::Error => {}
        }
        Ok(())
    }

    /// Interns the volume's backing source, if it has one the record
    /// tracks.
    async fn intern_backing(&self, pv: &PvObject) -> Result<Option<Backing>, StoreError> {
        if let Some(nfs) = &pv.spec.nfs {
            let id = self.store.insert_nfs(&nfs.server, &nfs.path).await?;
            return Ok(Some(Backing {
                kind: BackingKind::Nfs,
                id,
            }));
        }
        if let Some(iscsi) = &pv.spec.iscsi {
            let id = self
                .store
                .insert_iscsi(&iscsi.target_portal, &iscsi.iqn, iscsi.lun, &iscsi.fs_type)
                .await?;
            return Ok(Some(Backing {
                kind: BackingKind::Iscsi,
                id,
            }));
        }
        Ok(None)
    }
}

fn pv_capacity(pv: &PvObject) -> i64 {
    pv.spec
        .capacity
        .get(STORAGE_RESOURCE)
        .and_then(|q| crate::models::parse_quantity(q))
        .unwrap_or(0)
}

fn pvc_capacity(pvc: &PvcObject) -> i64 {
    pvc.spec
        .resources
        .requests
        .get(STORAGE_RESOURCE)
        .and_then(|q| crate::models::parse_quantity(q))
        .unwrap_or(0)
}

/// Builds the container descriptions persisted for a pod: volumes that
/// reference claims are mapped by volume name, and each container mount
/// of such a volume becomes a claim mount.
pub fn claim_mounts(pod: &PodObject) -> Vec<ContainerDesc> {
    let claim_for_volume: std::collections::HashMap<&str, &str> = pod
        .spec
        .volumes
        .iter()
        .filter_map(|v| {
            v.persistent_volume_claim
                .as_ref()
                .map(|c| (v.name.as_str(), c.claim_name.as_str()))
        })
        .collect();

    pod.spec
        .containers
        .iter()
        .map(|container| {
            let mounts = container
                .volume_mounts
                .iter()
                .filter_map(|m| {
                    claim_for_volume.get(m.name.as_str()).map(|claim| MountRef {
                        claim_name: claim.to_string(),
                        read_only: m.read_only,
                    })
                })
                .collect();
            ContainerDesc {
                name: container.name.clone(),
                image: container.image.clone(),
                command: join_command(&container.command),
                claim_mounts: mounts,
            }
        })
        .collect()
}
