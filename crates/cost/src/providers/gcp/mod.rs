//! GCP billing provider.
//!
//! Reads yesterday's net cost per service and project from the BigQuery
//! billing export and publishes
//! `gcp_yesterday_costs_by_service{gcp_service, gcp_project}`.
//!
//! ## Authentication
//!
//! Either a service-account key (a signed JWT is exchanged for an access
//! token with the `bigquery.readonly` scope) or a pre-minted access token.

mod auth;
mod client;
mod models;

pub use auth::{ServiceAccountKey, TokenSource};
pub use client::{GcpConfig, GcpCostProvider, YESTERDAY_COSTS_BY_SERVICE};
pub use models::*;
