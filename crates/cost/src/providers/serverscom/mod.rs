//! Servers.com bare-metal billing provider.
//!
//! Lists the last two years of invoices and publishes their monthly totals
//! as `serverscom_monthly_expenses{month_year}`.

mod client;
mod models;

pub use client::{aggregate_monthly, ServersComConfig, ServersComCostProvider, MONTHLY_EXPENSES};
pub use models::*;
