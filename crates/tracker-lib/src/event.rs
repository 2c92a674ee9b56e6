//! Watch-feed frame decoding.
//!
//! Each feed line is either an object frame (`{"type": ..., "object": ...}`
//! for the subscribed resource kind) or a control frame carrying a `Status`
//! payload. The feed emits the wrapped form (`object` replaced by a Status)
//! for mid-stream errors and a bare Status line when it rejects the request
//! outright, so both shapes are recognized. A line that parses as neither
//! is a fatal decode error: it means the feed schema has drifted.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

use crate::resources::ResourceKind;

/// Status code signalling that the resume token is past the feed's
/// retained history and only a full refresh can recover.
pub const STATUS_HORIZON_LOST: i64 = 410;

/// Event types carried by object frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Added => "ADDED",
            EventKind::Modified => "MODIFIED",
            EventKind::Deleted => "DELETED",
            EventKind::Error => "ERROR",
        }
    }
}

/// Common object metadata.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub resource_version: String,
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodObject {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default)]
    pub volumes: Vec<PodVolume>,
    #[serde(default)]
    pub containers: Vec<PodContainer>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodVolume {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub persistent_volume_claim: Option<ClaimVolumeSource>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimVolumeSource {
    #[serde(default)]
    pub claim_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodContainer {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMountSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMountSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PvObject {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PvSpec,
    #[serde(default)]
    pub status: PhaseStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PvSpec {
    #[serde(default)]
    pub capacity: HashMap<String, String>,
    #[serde(default)]
    pub access_modes: Vec<String>,
    #[serde(default)]
    pub nfs: Option<NfsVolumeSource>,
    #[serde(default)]
    pub iscsi: Option<IscsiVolumeSource>,
    #[serde(default)]
    pub claim_ref: Option<ObjectRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NfsVolumeSource {
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IscsiVolumeSource {
    #[serde(default)]
    pub target_portal: String,
    #[serde(default)]
    pub iqn: String,
    #[serde(default)]
    pub lun: i64,
    #[serde(default)]
    pub fs_type: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PvcObject {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PvcSpec,
    #[serde(default)]
    pub status: PhaseStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PvcSpec {
    #[serde(default)]
    pub access_modes: Vec<String>,
    #[serde(default)]
    pub resources: ResourceRequests,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequests {
    #[serde(default)]
    pub requests: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseStatus {
    #[serde(default)]
    pub phase: String,
}

/// Control-plane Status payload, emitted when the feed cannot serve the
/// requested stream (notably code 410, resume token past the horizon).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub code: i64,
}

impl Status {
    pub fn is_horizon_lost(&self) -> bool {
        self.code == STATUS_HORIZON_LOST
    }
}

/// Decoded payload of an object frame.
#[derive(Debug, Clone)]
pub enum ResourceObject {
    Pod(PodObject),
    Pv(PvObject),
    Pvc(PvcObject),
}

impl ResourceObject {
    pub fn meta(&self) -> &ObjectMeta {
        match self {
            ResourceObject::Pod(p) => &p.metadata,
            ResourceObject::Pv(p) => &p.metadata,
            ResourceObject::Pvc(p) => &p.metadata,
        }
    }

    pub fn uid(&self) -> &str {
        &self.meta().uid
    }

    pub fn resource_version(&self) -> &str {
        &self.meta().resource_version
    }
}

/// One decoded object frame, with the raw line retained for storage.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub object: ResourceObject,
    pub raw: String,
}

/// Outcome of decoding one feed line.
#[derive(Debug)]
pub enum Decoded {
    Event(WatchEvent),
    Control(Status),
}

#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    #[error("frame for {resource} is neither an object nor a Status: {detail}")]
    Unrecognized { resource: ResourceKind, detail: String },
}

#[derive(Debug, Deserialize)]
struct RawFrame<T> {
    #[serde(rename = "type")]
    kind: EventKind,
    object: T,
}

/// Decodes one newline-delimited frame for the subscribed resource kind.
///
/// Object frames must carry a uid; anything else is retried as a wrapped
/// or bare Status before being reported as schema drift.
pub fn decode_frame(resource: ResourceKind, line: &str) -> Result<Decoded, DecodeError> {
    let typed = match resource {
        ResourceKind::Pods => serde_json::from_str::<RawFrame<PodObject>>(line)
            .map(|f| (f.kind, ResourceObject::Pod(f.object))),
        ResourceKind::PersistentVolumes => serde_json::from_str::<RawFrame<PvObject>>(line)
            .map(|f| (f.kind, ResourceObject::Pv(f.object))),
        ResourceKind::PersistentVolumeClaims => serde_json::from_str::<RawFrame<PvcObject>>(line)
            .map(|f| (f.kind, ResourceObject::Pvc(f.object))),
    };

    let detail = match typed {
        Ok((kind, object)) if !object.uid().is_empty() => {
            return Ok(Decoded::Event(WatchEvent {
                kind,
                object,
                raw: line.to_string(),
            }));
        }
        Ok(_) => "object frame without uid".to_string(),
        Err(e) => e.to_string(),
    };

    if let Ok(frame) = serde_json::from_str::<RawFrame<Status>>(line) {
        if frame.object.kind == "Status" {
            return Ok(Decoded::Control(frame.object));
        }
    }
    if let Ok(status) = serde_json::from_str::<Status>(line) {
        if status.kind == "Status" {
            return Ok(Decoded::Control(status));
        }
    }

    Err(DecodeError::Unrecognized { resource, detail })
}
