// src/models/mod.rs

//! Domain models for the collection daemon.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod config;
mod entity;
mod outcome;
mod state;

// Re-export all public types
pub use config::{
    CollectionConfig, Config, DaemonConfig, EgressConfig, FeedConfig, StorageConfig,
    TransportConfig,
};
pub use entity::{CatalogEntry, Platform};
pub use outcome::{CollectStatus, CycleStats, ErrorCode, ProbeResult, RequestOutcome};
pub use state::{CollectionMode, CollectionState, Decision, SkipReason};
