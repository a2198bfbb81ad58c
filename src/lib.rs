//! # tierq
//!
//! SQLite-backed work-queue engine for long-running storage operations on
//! imaging studies, starting with moving a study to a lower storage tier.
//!
//! Provides the persistence broker, reversible command pipelines, resumable
//! job state, conflict checks between queue entries, and OpenTelemetry
//! observability.

pub mod alert;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod filesystem;
pub mod model;
pub mod retry;
pub mod stats;
pub mod storage;
pub mod telemetry;
