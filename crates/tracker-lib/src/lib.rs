//! Core library for the voltrack daemon
//!
//! This crate provides the pieces that turn a control plane's watch feed
//! into a queryable storage history:
//! - Watch-feed subscription and frame decoding
//! - Per-resource reconciliation with resume and refresh handling
//! - A transactional persistence port with SQLite and in-memory backends
//! - Mount-edge reconstruction across out-of-order events
//! - Health checks and observability

pub mod event;
pub mod health;
pub mod models;
pub mod observability;
pub mod reconciler;
pub mod resources;
pub mod store;
pub mod supervisor;
pub mod watch;

pub use health::{ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse};
pub use models::*;
pub use observability::TrackerMetrics;
pub use resources::{ResourceKind, PV_SCOPE};
pub use store::{Backing, MemoryStore, SqliteStore, Store, StoreError};
pub use supervisor::{Supervisor, SupervisorError};
