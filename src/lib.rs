//! Orchestration core for migrating a clinical practice's records from a
//! legacy export into a normalized destination store.
//!
//! Work is split into dependency-ordered [`runner::Phase`]s. Each phase
//! extracts source rows, resolves them against a fresh [`index::EntitySet`]
//! of what is already migrated, upserts or links, and records its progress
//! in a [`checkpoint::CheckpointTracker`] so an interrupted run can resume.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod index;
pub mod link;
pub mod model;
pub mod normalization;
pub mod outcome;
pub mod phases;
pub mod resolve;
pub mod runner;
pub mod source;
pub mod store;
pub mod tracing;
pub mod util;
pub mod validate;

pub use config::MigrationConfig;
pub use error::MigrationError;
pub use runner::{MigrationContext, PhaseRunner};
