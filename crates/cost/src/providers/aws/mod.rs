//! AWS Cost Explorer provider.
//!
//! Publishes up to five gauges, each behind its own toggle:
//!
//! - `aws_today_daily_costs` - blended cost for today
//! - `aws_yesterday_daily_costs` - blended cost for yesterday
//! - `aws_yesterday_costs_by_service{aws_service}` - yesterday per service
//! - `aws_month_to_date_costs` - unblended cost for the current month
//! - `aws_month_forecasted_costs` - forecasted unblended cost to month end
//!
//! Every gauge comes from its own query. A failing query only holds back
//! its own gauge; the others are still published.
//!
//! ## Authentication
//!
//! Static access keys (optionally with a session token). Requests are signed
//! with Signature Version 4 for the `ce` service.
//!
//! ## Example
//!
//! ```rust,ignore
//! use cost::providers::{AwsConfig, AwsCostProvider, AwsCredentials};
//!
//! let provider = AwsCostProvider::new(AwsConfig {
//!     enabled: true,
//!     credentials: Some(AwsCredentials {
//!         access_key_id: "AKIA...".into(),
//!         secret_access_key: "...".into(),
//!         session_token: None,
//!     }),
//!     ..AwsConfig::default()
//! })?;
//! ```

mod client;
mod models;
mod sigv4;

pub use client::{
    AwsConfig, AwsCostProvider, AwsMetricToggles, MONTH_FORECASTED_COSTS, MONTH_TO_DATE_COSTS,
    TODAY_DAILY_COSTS, YESTERDAY_COSTS_BY_SERVICE, YESTERDAY_DAILY_COSTS,
};
pub use models::*;
pub use sigv4::AwsCredentials;
