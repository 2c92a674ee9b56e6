//! Contract tests for the SQLite persistence adapter.
//!
//! These exercise the temporal mount-matching rules, bind merging, and
//! checkpoint bookkeeping against a real database file.

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tracker_lib::{
    ContainerDesc, MountRef, ResourceKind, SqliteStore, Store, PV_SCOPE,
};

const NS: &str = "testns";

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

fn micros(secs: i64) -> i64 {
    ts(secs).timestamp_micros()
}

fn open_store(dir: &TempDir) -> SqliteStore {
    SqliteStore::open(dir.path().join("voltrack.db")).unwrap()
}

fn mount_container(claim: &str) -> Vec<ContainerDesc> {
    vec![ContainerDesc {
        name: "main".to_string(),
        image: "nginx".to_string(),
        command: "nginx -g daemon off;".to_string(),
        claim_mounts: vec![MountRef {
            claim_name: claim.to_string(),
            read_only: false,
        }],
    }]
}

async fn insert_claim(store: &SqliteStore, uid: &str, name: &str, at: i64, rv: &str) {
    store
        .insert_pvc(uid, name, ts(at), NS, 1 << 20, &[], "{}", NS, rv)
        .await
        .unwrap();
}

async fn mount_uid_for_pod(store: &SqliteStore, pod_uid: &str) -> Option<String> {
    store
        .query_scalar::<Option<String>>(&format!(
            "SELECT pvc_uid FROM pod_mount WHERE pod_uid = '{}'",
            pod_uid
        ))
        .await
        .unwrap()
        .flatten()
}

async fn mount_count_for_pod(store: &SqliteStore, pod_uid: &str) -> i64 {
    store
        .query_scalar::<i64>(&format!(
            "SELECT COUNT(*) FROM pod_mount WHERE pod_uid = '{}'",
            pod_uid
        ))
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_standard_bind_flow() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let id = store.insert_nfs("10.0.0.5", "/exports/a").await.unwrap();
    store
        .insert_pv(
            "pv-1",
            "vol",
            ts(10),
            Some(tracker_lib::Backing {
                kind: tracker_lib::BackingKind::Nfs,
                id,
            }),
            1 << 30,
            &["ReadWriteMany".to_string()],
            "{}",
            "700",
        )
        .await
        .unwrap();
    insert_claim(&store, "pvc-1", "claim", 11, "701").await;
    store.bind_pvc("pv-1", "pvc-1", ts(12), "702").await.unwrap();

    let bound_pv: Option<String> = store
        .query_scalar("SELECT pv_uid FROM pvc WHERE uid = 'pvc-1'")
        .await
        .unwrap();
    assert_eq!(bound_pv.as_deref(), Some("pv-1"));
    let bind_time: Option<i64> = store
        .query_scalar("SELECT bind_time FROM pvc WHERE uid = 'pvc-1'")
        .await
        .unwrap();
    assert_eq!(bind_time, Some(micros(12)));

    assert_eq!(
        store
            .checkpoint(ResourceKind::PersistentVolumes, PV_SCOPE)
            .await
            .unwrap()
            .as_deref(),
        Some("702")
    );
    assert_eq!(
        store
            .checkpoint(ResourceKind::PersistentVolumeClaims, NS)
            .await
            .unwrap()
            .as_deref(),
        Some("701")
    );
}

#[tokio::test]
async fn test_bind_before_claim_is_merged() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store
        .insert_pv("pv-1", "vol", ts(10), None, 1 << 30, &[], "{}", "400")
        .await
        .unwrap();
    // Bind arrives on the PV feed before the claim has been seen at all.
    store.bind_pvc("pv-1", "pvc-1", ts(11), "401").await.unwrap();

    let name = store
        .query_scalar::<Option<String>>("SELECT name FROM pvc WHERE uid = 'pvc-1'")
        .await
        .unwrap()
        .flatten();
    assert_eq!(name, None);
    let bound: Option<String> = store
        .query_scalar("SELECT pv_uid FROM pvc WHERE uid = 'pvc-1'")
        .await
        .unwrap();
    assert_eq!(bound.as_deref(), Some("pv-1"));

    // The claim's ADDED event fills in identity without losing the bind.
    insert_claim(&store, "pvc-1", "claim", 5, "200").await;
    let name = store
        .query_scalar::<Option<String>>("SELECT name FROM pvc WHERE uid = 'pvc-1'")
        .await
        .unwrap()
        .flatten();
    assert_eq!(name.as_deref(), Some("claim"));
    let bound: Option<String> = store
        .query_scalar("SELECT pv_uid FROM pvc WHERE uid = 'pvc-1'")
        .await
        .unwrap();
    assert_eq!(bound.as_deref(), Some("pv-1"));
    let bind_time: Option<i64> = store
        .query_scalar("SELECT bind_time FROM pvc WHERE uid = 'pvc-1'")
        .await
        .unwrap();
    assert_eq!(bind_time, Some(micros(11)));

    assert_eq!(
        store
            .checkpoint(ResourceKind::PersistentVolumes, PV_SCOPE)
            .await
            .unwrap()
            .as_deref(),
        Some("401")
    );
    assert_eq!(
        store
            .checkpoint(ResourceKind::PersistentVolumeClaims, NS)
            .await
            .unwrap()
            .as_deref(),
        Some("200")
    );
}

#[tokio::test]
async fn test_mount_matches_most_recent_live_claim() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    // Claims named "foo" at several points in time, plus decoys under
    // other names. The pod is created between "current" and "future".
    insert_claim(&store, "foo-old", "foo", 0, "5").await;
    insert_claim(&store, "foo-current", "foo", 1, "6").await;
    insert_claim(&store, "foo-future", "foo", 4, "7").await;
    insert_claim(&store, "bar-1", "bar", 1, "8").await;
    insert_claim(&store, "baz-1", "baz", 2, "9").await;

    store
        .insert_pod("pod-1", "web", ts(3), NS, &mount_container("foo"), "{}", NS, "132")
        .await
        .unwrap();

    assert_eq!(mount_count_for_pod(&store, "pod-1").await, 1);
    assert_eq!(
        mount_uid_for_pod(&store, "pod-1").await.as_deref(),
        Some("foo-current")
    );
}

#[tokio::test]
async fn test_mount_skips_claim_deleted_before_pod() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    // "foo" existed but died before the pod started; the only viable
    // claim is the one created afterwards.
    insert_claim(&store, "foo-old", "foo", 0, "5").await;
    store.delete_pvc("foo-old", ts(1), NS, "6").await.unwrap();
    insert_claim(&store, "foo-late", "foo", 3, "7").await;

    store
        .insert_pod("pod-1", "web", ts(2), NS, &mount_container("foo"), "{}", NS, "8")
        .await
        .unwrap();
    assert_eq!(
        mount_uid_for_pod(&store, "pod-1").await.as_deref(),
        Some("foo-late")
    );
}

#[tokio::test]
async fn test_mount_stub_promoted_when_claim_appears() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    // Pod first: no claim of that name exists, so a name-only stub row
    // is recorded.
    store
        .insert_pod("pod-1", "web", ts(2), NS, &mount_container("foo"), "{}", NS, "431")
        .await
        .unwrap();
    assert_eq!(mount_count_for_pod(&store, "pod-1").await, 1);
    assert_eq!(mount_uid_for_pod(&store, "pod-1").await, None);

    // Each arriving claim of the name re-points the edge while the pod
    // is alive; the latest one wins.
    insert_claim(&store, "foo-old", "foo", 0, "5").await;
    assert_eq!(
        mount_uid_for_pod(&store, "pod-1").await.as_deref(),
        Some("foo-old")
    );
    insert_claim(&store, "foo-current", "foo", 1, "6").await;
    insert_claim(&store, "other", "unrelated", 1, "7").await;
    assert_eq!(
        mount_uid_for_pod(&store, "pod-1").await.as_deref(),
        Some("foo-current")
    );
}

#[tokio::test]
async fn test_mount_stub_with_deleted_claim_history() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store
        .insert_pod("pod-1", "web", ts(2), NS, &mount_container("foo"), "{}", NS, "8")
        .await
        .unwrap();
    insert_claim(&store, "foo-old", "foo", 0, "5").await;
    store.delete_pvc("foo-old", ts(1), NS, "6").await.unwrap();
    insert_claim(&store, "foo-current", "foo", 3, "7").await;

    assert_eq!(
        mount_uid_for_pod(&store, "pod-1").await.as_deref(),
        Some("foo-current")
    );
}

#[tokio::test]
async fn test_pod_delete_clears_speculative_future_match() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    // Only a future claim exists when the pod is inserted, so the edge
    // is a speculative match against it.
    insert_claim(&store, "foo-future", "foo", 5, "1").await;
    store
        .insert_pod("pod-1", "web", ts(2), NS, &mount_container("foo"), "{}", NS, "2")
        .await
        .unwrap();
    assert_eq!(
        mount_uid_for_pod(&store, "pod-1").await.as_deref(),
        Some("foo-future")
    );

    // The pod died before that claim was created, so the match was
    // impossible; every edge for the pod is dropped.
    store.delete_pod("pod-1", ts(3), NS, "3").await.unwrap();
    assert_eq!(mount_count_for_pod(&store, "pod-1").await, 0);
    let delete_time: Option<i64> = store
        .query_scalar("SELECT delete_time FROM pod WHERE uid = 'pod-1'")
        .await
        .unwrap();
    assert_eq!(delete_time, Some(micros(3)));
}

#[tokio::test]
async fn test_pod_delete_after_late_promotion_clears_mounts() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    insert_claim(&store, "foo-old", "foo", 0, "1").await;
    store.delete_pvc("foo-old", ts(1), NS, "2").await.unwrap();
    store
        .insert_pod("pod-1", "web", ts(2), NS, &mount_container("foo"), "{}", NS, "3")
        .await
        .unwrap();
    // Stub: the only claim of the name was already deleted.
    assert_eq!(mount_uid_for_pod(&store, "pod-1").await, None);

    // A recreated claim promotes the stub while the pod is alive...
    insert_claim(&store, "foo-new", "foo", 5, "4").await;
    assert_eq!(
        mount_uid_for_pod(&store, "pod-1").await.as_deref(),
        Some("foo-new")
    );

    // ...but the out-of-order deletion reveals the claim postdates the
    // pod's death, so the edge cannot stand.
    store.delete_pod("pod-1", ts(3), NS, "5").await.unwrap();
    assert_eq!(mount_count_for_pod(&store, "pod-1").await, 0);
}

#[tokio::test]
async fn test_pod_delete_keeps_valid_mounts() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    insert_claim(&store, "foo-current", "foo", 1, "1").await;
    store
        .insert_pod("pod-1", "web", ts(2), NS, &mount_container("foo"), "{}", NS, "2")
        .await
        .unwrap();
    store.delete_pod("pod-1", ts(3), NS, "3").await.unwrap();

    assert_eq!(mount_count_for_pod(&store, "pod-1").await, 1);
    assert_eq!(
        mount_uid_for_pod(&store, "pod-1").await.as_deref(),
        Some("foo-current")
    );
}

#[tokio::test]
async fn test_promotion_skips_deleted_pods() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    store
        .insert_pod("pod-1", "web", ts(2), NS, &mount_container("foo"), "{}", NS, "1")
        .await
        .unwrap();
    store.delete_pod("pod-1", ts(3), NS, "2").await.unwrap();

    // The stub belongs to a dead pod; a new claim must not adopt it.
    insert_claim(&store, "foo-new", "foo", 10, "3").await;
    assert_eq!(mount_uid_for_pod(&store, "pod-1").await, None);
}

#[tokio::test]
async fn test_containers_are_recorded() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let containers = vec![
        ContainerDesc {
            name: "main".to_string(),
            image: "nginx".to_string(),
            command: "nginx -g daemon off;".to_string(),
            claim_mounts: vec![],
        },
        ContainerDesc {
            name: "sidecar".to_string(),
            image: "busybox".to_string(),
            command: "sleep 3600".to_string(),
            claim_mounts: vec![],
        },
    ];
    store
        .insert_pod("pod-1", "web", ts(2), NS, &containers, "{}", NS, "1")
        .await
        .unwrap();

    let count: Option<i64> = store
        .query_scalar("SELECT COUNT(*) FROM container WHERE pod_uid = 'pod-1'")
        .await
        .unwrap();
    assert_eq!(count, Some(2));
    let image: Option<String> = store
        .query_scalar(
            "SELECT image FROM container WHERE pod_uid = 'pod-1' AND name = 'sidecar'",
        )
        .await
        .unwrap();
    assert_eq!(image.as_deref(), Some("busybox"));
    // A pod without claim references produces no mount rows.
    assert_eq!(mount_count_for_pod(&store, "pod-1").await, 0);
}

#[tokio::test]
async fn test_update_pv_replaces_mutable_fields() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let nfs = store.insert_nfs("10.0.0.5", "/exports/a").await.unwrap();
    store
        .insert_pv(
            "pv-1",
            "vol",
            ts(10),
            Some(tracker_lib::Backing {
                kind: tracker_lib::BackingKind::Nfs,
                id: nfs,
            }),
            1 << 30,
            &["ReadWriteOnce".to_string()],
            "{}",
            "1",
        )
        .await
        .unwrap();

    store
        .update_pv(
            "pv-1",
            Some(tracker_lib::Backing {
                kind: tracker_lib::BackingKind::Nfs,
                id: nfs,
            }),
            5 << 30,
            &["ReadWriteOnce".to_string(), "ReadOnlyMany".to_string()],
            "{}",
            "2",
        )
        .await
        .unwrap();

    let storage: Option<i64> = store
        .query_scalar("SELECT storage FROM pv WHERE uid = 'pv-1'")
        .await
        .unwrap();
    assert_eq!(storage, Some(5 << 30));
    let modes: Option<String> = store
        .query_scalar("SELECT access_modes FROM pv WHERE uid = 'pv-1'")
        .await
        .unwrap();
    assert_eq!(modes.as_deref(), Some("ReadWriteOnce,ReadOnlyMany"));
    assert_eq!(
        store
            .checkpoint(ResourceKind::PersistentVolumes, PV_SCOPE)
            .await
            .unwrap()
            .as_deref(),
        Some("2")
    );
}

#[tokio::test]
async fn test_iscsi_backed_pv() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let id = store
        .insert_iscsi("10.0.0.9:3260", "iqn.2016-01.com.example:disk0", 0, "ext4")
        .await
        .unwrap();
    store
        .insert_pv(
            "pv-1",
            "vol",
            ts(10),
            Some(tracker_lib::Backing {
                kind: tracker_lib::BackingKind::Iscsi,
                id,
            }),
            1 << 30,
            &[],
            "{}",
            "1",
        )
        .await
        .unwrap();

    let iscsi_id: Option<i64> = store
        .query_scalar("SELECT iscsi_id FROM pv WHERE uid = 'pv-1'")
        .await
        .unwrap();
    assert_eq!(iscsi_id, Some(id));
    let nfs_id = store
        .query_scalar::<Option<i64>>("SELECT nfs_id FROM pv WHERE uid = 'pv-1'")
        .await
        .unwrap()
        .flatten();
    assert_eq!(nfs_id, None);
}

#[tokio::test]
async fn test_replaying_a_feed_reaches_a_fixed_point() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    for _pass in 0..2 {
        insert_claim(&store, "pvc-1", "foo", 1, "10").await;
        store
            .insert_pod("pod-1", "web", ts(2), NS, &mount_container("foo"), "{}", NS, "11")
            .await
            .unwrap();
        store.bind_pvc("pv-1", "pvc-1", ts(3), "12").await.unwrap();
        store.delete_pvc("pvc-1", ts(9), NS, "13").await.unwrap();
    }

    let pvcs: Option<i64> = store.query_scalar("SELECT COUNT(*) FROM pvc").await.unwrap();
    assert_eq!(pvcs, Some(1));
    let pods: Option<i64> = store.query_scalar("SELECT COUNT(*) FROM pod").await.unwrap();
    assert_eq!(pods, Some(1));
    assert_eq!(mount_count_for_pod(&store, "pod-1").await, 1);
    // The first delete's stamp survives the replay.
    let delete_time: Option<i64> = store
        .query_scalar("SELECT delete_time FROM pvc WHERE uid = 'pvc-1'")
        .await
        .unwrap();
    assert_eq!(delete_time, Some(micros(9)));
}
