//! Temporal metrics for pole and job tracking.
//!
//! Snapshots of jobs and poles are stored append-only; field transitions are
//! detected at write time and rolled up into daily productivity and
//! per-utility burndown rows. [`MetricsEngine`] is the entry point; storage
//! goes through the [`store::MetricsStore`] trait.

pub mod analysis;
pub mod backfill;
pub mod burndown;
pub mod compact;
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod locks;
pub mod models;
pub mod projects;
pub mod store;
pub mod summary;

pub use engine::{IngestReport, MetricsEngine};
pub use error::{MetricsError, MetricsResult};
