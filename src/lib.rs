//! # enrichq
//!
//! Lazily enriches items a live UI is already showing, such as "who added
//! this reaction", without hammering a rate-limited API.
//!
//! Every fetch goes through one [`queue::SequentialQueue`] lane with a
//! cool-down between calls. The [`cache::EnrichmentCache`] fetches each
//! fingerprint at most once, answers reads immediately with whatever it has,
//! and publishes an [`event::EventKind::EnrichmentUpdated`] when new data
//! lands so views can re-render.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod model;
pub mod queue;
pub mod reactions;
pub mod telemetry;
