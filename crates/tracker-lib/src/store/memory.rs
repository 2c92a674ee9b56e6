//! In-memory implementation of the persistence port.
//!
//! Mirrors the relational adapter's semantics (upserts, bind merging,
//! mount matching, promotion, deletion cleanup) over plain maps so that
//! reconciler and supervisor tests can run without a database and inspect
//! the resulting state directly.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Backing, Store, StoreError};
use crate::models::ContainerDesc;
use crate::resources::ResourceKind;

#[derive(Debug, Clone)]
pub struct PodAttrs {
    pub name: String,
    pub namespace: String,
    pub create_time: DateTime<Utc>,
    pub delete_time: Option<DateTime<Utc>>,
    pub containers: Vec<ContainerDesc>,
}

#[derive(Debug, Clone)]
pub struct PvAttrs {
    pub name: String,
    pub create_time: DateTime<Utc>,
    pub delete_time: Option<DateTime<Utc>>,
    pub backing: Option<Backing>,
    pub capacity: i64,
    pub access_modes: Vec<String>,
}

/// Claim attributes. Identity fields are optional because a row may be
/// created by a bind before its ADDED event has been seen.
#[derive(Debug, Clone, Default)]
pub struct PvcAttrs {
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub create_time: Option<DateTime<Utc>>,
    pub delete_time: Option<DateTime<Utc>>,
    pub bind_time: Option<DateTime<Utc>>,
    pub pv_uid: Option<String>,
    pub capacity: Option<i64>,
    pub access_modes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MountRow {
    pub pod_uid: String,
    pub pvc_uid: Option<String>,
    pub pvc_name: String,
    pub container_name: String,
    pub read_only: bool,
}

#[derive(Default)]
struct Inner {
    pods: HashMap<String, PodAttrs>,
    pvs: HashMap<String, PvAttrs>,
    pvcs: HashMap<String, PvcAttrs>,
    mounts: Vec<MountRow>,
    nfs: HashMap<(String, String), i64>,
    iscsi: HashMap<(String, String, i64, String), i64>,
    next_backing_id: i64,
    checkpoints: HashMap<(ResourceKind, String), String>,
    deletions: u64,
    forced_checkpoint: Option<String>,
}

impl Inner {
    fn set_checkpoint(&mut self, resource: ResourceKind, scope: &str, rv: &str) {
        self.checkpoints
            .insert((resource, scope.to_string()), rv.to_string());
    }

    fn resolve_claim_uid(&self, claim_name: &str, at: DateTime<Utc>) -> Option<String> {
        // Most recent claim of this name alive at the pod's creation.
        let pre = self
            .pvcs
            .iter()
            .filter(|(_, c)| c.name.as_deref() == Some(claim_name))
            .filter(|(_, c)| c.create_time.is_some_and(|t| t <= at))
            .filter(|(_, c)| c.delete_time.map_or(true, |t| t >= at))
            .max_by_key(|(_, c)| c.create_time);
        if let Some((uid, _)) = pre {
            return Some(uid.clone());
        }
        // Speculative: earliest claim created afterwards that outlived
        // the pod's creation instant.
        self.pvcs
            .iter()
            .filter(|(_, c)| c.name.as_deref() == Some(claim_name))
            .filter(|(_, c)| c.create_time.is_some_and(|t| t >= at))
            .filter(|(_, c)| c.delete_time.map_or(true, |t| t > at))
            .min_by_key(|(_, c)| c.create_time)
            .map(|(uid, _)| uid.clone())
    }
}

/// Map-backed store for tests; state is inspectable through the
/// accessor methods.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pods(&self) -> HashMap<String, PodAttrs> {
        self.inner.lock().unwrap().pods.clone()
    }

    pub fn pvs(&self) -> HashMap<String, PvAttrs> {
        self.inner.lock().unwrap().pvs.clone()
    }

    pub fn pvcs(&self) -> HashMap<String, PvcAttrs> {
        self.inner.lock().unwrap().pvcs.clone()
    }

    pub fn mounts(&self) -> Vec<MountRow> {
        self.inner.lock().unwrap().mounts.clone()
    }

    pub fn deletions(&self) -> u64 {
        self.inner.lock().unwrap().deletions
    }

    /// Forces every checkpoint read to return `rv`, regardless of what
    /// has been written. Used to simulate a stale stored token.
    pub fn force_checkpoint(&self, rv: &str) {
        self.inner.lock().unwrap().forced_checkpoint = Some(rv.to_string());
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn validate(&self) -> Result<(), StoreError> {
        Ok(())
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
        let _ = raw;
        let mut inner = self.inner.lock().unwrap();
        // Replays must not resurrect an already-deleted pod.
        let delete_time = inner.pods.get(uid).and_then(|p| p.delete_time);
        inner.pods.insert(
            uid.to_string(),
            PodAttrs {
                name: name.to_string(),
                namespace: namespace.to_string(),
                create_time,
                delete_time,
                containers: containers.to_vec(),
            },
        );
        for container in containers {
            for mount in &container.claim_mounts {
                let exists = inner.mounts.iter().any(|m| {
                    m.pod_uid == uid
                        && m.pvc_name == mount.claim_name
                        && m.container_name == container.name
                });
                if exists {
                    continue;
                }
                let pvc_uid = inner.resolve_claim_uid(&mount.claim_name, create_time);
                inner.mounts.push(MountRow {
                    pod_uid: uid.to_string(),
                    pvc_uid,
                    pvc_name: mount.claim_name.clone(),
                    container_name: container.name.clone(),
                    read_only: mount.read_only,
                });
            }
        }
        inner.set_checkpoint(ResourceKind::Pods, scope, rv);
        Ok(())
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
        let _ = raw;
        let mut inner = self.inner.lock().unwrap();
        let delete_time = inner.pvs.get(uid).and_then(|p| p.delete_time);
        inner.pvs.insert(
            uid.to_string(),
            PvAttrs {
                name: name.to_string(),
                create_time,
                delete_time,
                backing,
                capacity,
                access_modes: access_modes.to_vec(),
            },
        );
        inner.set_checkpoint(
            ResourceKind::PersistentVolumes,
            crate::resources::PV_SCOPE,
            rv,
        );
        Ok(())
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
        let _ = raw;
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.pvcs.entry(uid.to_string()).or_default();
        entry.name = Some(name.to_string());
        entry.namespace = Some(namespace.to_string());
        entry.create_time = Some(create_time);
        entry.capacity = Some(capacity);
        entry.access_modes = access_modes.to_vec();
        let live_pods: Vec<String> = inner
            .pods
            .iter()
            .filter(|(_, p)| p.delete_time.is_none())
            .map(|(u, _)| u.clone())
            .collect();
        for mount in inner.mounts.iter_mut() {
            if mount.pvc_name == name && live_pods.contains(&mount.pod_uid) {
                mount.pvc_uid = Some(uid.to_string());
            }
        }
        inner.set_checkpoint(ResourceKind::PersistentVolumeClaims, scope, rv);
        Ok(())
    }

    async fn insert_nfs(&self, server: &str, path: &str) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (server.to_string(), path.to_string());
        if let Some(id) = inner.nfs.get(&key) {
            return Ok(*id);
        }
        inner.next_backing_id += 1;
        let id = inner.next_backing_id;
        inner.nfs.insert(key, id);
        Ok(id)
    }

    async fn insert_iscsi(
        &self,
        target_portal: &str,
        iqn: &str,
        lun: i64,
        fs_type: &str,
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (
            target_portal.to_string(),
            iqn.to_string(),
            lun,
            fs_type.to_string(),
        );
        if let Some(id) = inner.iscsi.get(&key) {
            return Ok(*id);
        }
        inner.next_backing_id += 1;
        let id = inner.next_backing_id;
        inner.iscsi.insert(key, id);
        Ok(id)
    }

    async fn bind_pvc(
        &self,
        pv_uid: &str,
        pvc_uid: &str,
        bind_time: DateTime<Utc>,
        rv: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.pvcs.entry(pvc_uid.to_string()).or_default();
        entry.pv_uid = Some(pv_uid.to_string());
        entry.bind_time = Some(bind_time);
        inner.set_checkpoint(
            ResourceKind::PersistentVolumes,
            crate::resources::PV_SCOPE,
            rv,
        );
        Ok(())
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
        let _ = raw;
        let mut inner = self.inner.lock().unwrap();
        if let Some(pv) = inner.pvs.get_mut(uid) {
            pv.backing = backing;
            pv.capacity = capacity;
            pv.access_modes = access_modes.to_vec();
        }
        inner.set_checkpoint(
            ResourceKind::PersistentVolumes,
            crate::resources::PV_SCOPE,
            rv,
        );
        Ok(())
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
        let _ = raw;
        let mut inner = self.inner.lock().unwrap();
        if let Some(pvc) = inner.pvcs.get_mut(uid) {
            pvc.capacity = Some(capacity);
            pvc.access_modes = access_modes.to_vec();
        }
        inner.set_checkpoint(ResourceKind::PersistentVolumeClaims, scope, rv);
        Ok(())
    }

    async fn delete_pod(
        &self,
        uid: &str,
        delete_time: DateTime<Utc>,
        scope: &str,
        rv: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pod) = inner.pods.get_mut(uid) {
            pod.delete_time.get_or_insert(delete_time);
        }
        let spurious = inner.mounts.iter().any(|m| {
            m.pod_uid == uid
                && m.pvc_uid.as_ref().is_some_and(|pvc_uid| {
                    inner
                        .pvcs
                        .get(pvc_uid)
                        .and_then(|c| c.create_time)
                        .is_some_and(|t| t > delete_time)
                })
        });
        if spurious {
            inner.mounts.retain(|m| m.pod_uid != uid);
        }
        inner.deletions += 1;
        inner.set_checkpoint(ResourceKind::Pods, scope, rv);
        Ok(())
    }

    async fn delete_pv(
        &self,
        uid: &str,
        delete_time: DateTime<Utc>,
        rv: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pv) = inner.pvs.get_mut(uid) {
            pv.delete_time.get_or_insert(delete_time);
        }
        inner.deletions += 1;
        inner.set_checkpoint(
            ResourceKind::PersistentVolumes,
            crate::resources::PV_SCOPE,
            rv,
        );
        Ok(())
    }

    async fn delete_pvc(
        &self,
        uid: &str,
        delete_time: DateTime<Utc>,
        scope: &str,
        rv: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pvc) = inner.pvcs.get_mut(uid) {
            pvc.delete_time.get_or_insert(delete_time);
        }
        inner.deletions += 1;
        inner.set_checkpoint(ResourceKind::PersistentVolumeClaims, scope, rv);
        Ok(())
    }

    async fn checkpoint(
        &self,
        resource: ResourceKind,
        scope: &str,
    ) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        if let Some(forced) = &inner.forced_checkpoint {
            return Ok(Some(forced.clone()));
        }
        Ok(inner
            .checkpoints
            .get(&(resource, scope.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MountRef;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn container_with_mount(claim: &str) -> Vec<ContainerDesc> {
        vec![ContainerDesc {
            name: "main".into(),
            image: "nginx".into(),
            command: String::new(),
            claim_mounts: vec![MountRef {
                claim_name: claim.into(),
                read_only: false,
            }],
        }]
    }

    #[tokio::test]
    async fn test_intern_ids_are_stable() {
        let store = MemoryStore::new();
        let a = store.insert_nfs("10.0.0.5", "/a").await.unwrap();
        assert_eq!(store.insert_nfs("10.0.0.5", "/a").await.unwrap(), a);
        assert_ne!(store.insert_nfs("10.0.0.5", "/b").await.unwrap(), a);
    }

    #[tokio::test]
    async fn test_bind_before_create_preserves_bind_fields() {
        let store = MemoryStore::new();
        store.bind_pvc("pv-1", "pvc-1", ts(50), "401").await.unwrap();
        store
            .insert_pvc("pvc-1", "claim", ts(10), "apps", 5, &[], "{}", "apps", "200")
            .await
            .unwrap();
        let pvc = &store.pvcs()["pvc-1"];
        assert_eq!(pvc.pv_uid.as_deref(), Some("pv-1"));
        assert_eq!(pvc.bind_time, Some(ts(50)));
        assert_eq!(pvc.name.as_deref(), Some("claim"));
        assert_eq!(pvc.create_time, Some(ts(10)));
    }

    #[tokio::test]
    async fn test_mount_promotion_on_late_claim() {
        let store = MemoryStore::new();
        store
            .insert_pod(
                "p1",
                "web",
                ts(20),
                "apps",
                &container_with_mount("data"),
                "{}",
                "apps",
                "1",
            )
            .await
            .unwrap();
        assert_eq!(store.mounts()[0].pvc_uid, None);
        store
            .insert_pvc("c1", "data", ts(10), "apps", 5, &[], "{}", "apps", "2")
            .await
            .unwrap();
        assert_eq!(store.mounts()[0].pvc_uid.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_delete_pod_clears_speculative_mounts() {
        let store = MemoryStore::new();
        store
            .insert_pvc("future", "data", ts(50), "apps", 5, &[], "{}", "apps", "1")
            .await
            .unwrap();
        store
            .insert_pod(
                "p1",
                "web",
                ts(20),
                "apps",
                &container_with_mount("data"),
                "{}",
                "apps",
                "2",
            )
            .await
            .unwrap();
        assert_eq!(store.mounts()[0].pvc_uid.as_deref(), Some("future"));
        store.delete_pod("p1", ts(30), "apps", "3").await.unwrap();
        assert!(store.mounts().is_empty());
    }
}
