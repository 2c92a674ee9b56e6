//! Long-lived watch subscriptions against the control plane feed.

mod client;

pub use client::{ApiClient, WatchError, WatchFrame, WatchStream};
