/// Handle List Sync Library
/// Watches Jetstream identity events and adds verified accounts whose
/// handles match configured patterns to a Bluesky list

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod membership;
pub mod models;
pub mod pattern;
pub mod processor;
pub mod storage;
pub mod websocket;

pub use client::SyncClient;
pub use error::{Result, SyncError};
pub use membership::MembershipStore;
pub use pattern::PatternMatcher;
pub use processor::{EventOutcome, IdentityEventProcessor, RetryPolicy};
pub use storage::{PersistedState, StateStore};
