//! Scheduled backup/restore engine for the store database.
//!
//! Exports the relational store into checksummed artifacts (optionally
//! zstd-compressed and AES-256-GCM-encrypted) on configurable schedules, and
//! restores artifacts under explicit conflict policies. The control surface
//! (HTTP/CLI) lives outside this crate and drives [`engine::BackupEngine`]
//! directly.

pub mod config;
pub mod db;
pub mod destination;
pub mod engine;
pub mod error;
pub mod models;
pub mod observers;
pub mod pipeline;
pub mod registry;
pub mod services;
pub mod source;

pub use config::EngineConfig;
pub use engine::{BackupEngine, EngineStats};
pub use error::{EngineError, Result};
