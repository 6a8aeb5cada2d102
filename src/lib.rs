//! Kubernetes Storage Version Migrator
//!
//! Rewrites every stored object of the selected resource types so the API
//! server re-persists them under its current storage version. Runs either as
//! a single-shot command or as a controller driven by StorageVersionMigration
//! objects.

pub mod adapters;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod migrator;
pub mod reconcilers;

pub use error::{Error, Result};
