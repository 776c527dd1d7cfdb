//! Cloud billing provider implementations.
//!
//! This module provides integrations with:
//!
//! - AWS - Cost Explorer API
//! - GCP - BigQuery billing export
//! - Servers.com - Billing invoices API

pub mod aws;
pub mod gcp;
pub(crate) mod http;
pub mod serverscom;
pub(crate) mod traits;

pub use aws::{AwsConfig, AwsCostProvider, AwsCredentials, AwsMetricToggles};
pub use gcp::{GcpConfig, GcpCostProvider, ServiceAccountKey, TokenSource};
pub use serverscom::{ServersComConfig, ServersComCostProvider};
pub use traits::{Collection, CostProvider, CostProviderError, PollResult};
