#![allow(clippy::doc_markdown)] // Allow brand names like BigQuery, Servers.com without backticks

//! Cloud billing collection for AWS, GCP and Servers.com.
//!
//! This crate polls vendor billing APIs on a schedule and keeps the results
//! in a registry of labeled gauges:
//!
//! - **AWS** - Cost Explorer (daily, per service, month to date, forecast)
//! - **GCP** - BigQuery billing export (yesterday per service and project)
//! - **Servers.com** - invoices aggregated per month
//!
//! ## Features
//!
//! - One independent job per provider; a failing vendor never blocks another
//! - Clear-then-set reconciliation, so vanished label sets disappear
//! - Readers always see a whole poll result, never half of one
//! - Failed polls keep the previously published values
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use cost::providers::{CostProvider, ServersComConfig, ServersComCostProvider};
//! use cost::{MetricRegistry, Scheduler};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Arc::new(MetricRegistry::new());
//!     let provider = Arc::new(ServersComCostProvider::new(ServersComConfig {
//!         enabled: true,
//!         token: Some("token".into()),
//!     })?);
//!     for descriptor in provider.metrics() {
//!         registry.register(descriptor)?;
//!     }
//!
//!     let mut scheduler = Scheduler::new(Arc::clone(&registry));
//!     scheduler.register(provider, Duration::from_secs(5400), Duration::from_secs(10))?;
//!     scheduler.start()?;
//!
//!     // Serve `registry.read_all().render()` over HTTP...
//!
//!     scheduler.shutdown().await?;
//!     registry.close();
//!     Ok(())
//! }
//! ```

pub mod providers;
pub mod registry;
pub mod scheduler;

pub use providers::{Collection, CostProvider, CostProviderError, PollResult};
pub use registry::{
    LabelSet, Measurement, MetricDescriptor, MetricRegistry, RegistryError, RegistrySnapshot,
};
pub use scheduler::{JobState, JobStatus, PollOutcome, Scheduler, SchedulerError};
