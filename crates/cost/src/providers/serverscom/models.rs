//! Servers.com billing models.

use serde::Deserialize;

/// One invoice from `GET /billing/invoices`.
#[derive(Debug, Clone, Deserialize)]
pub struct Invoice {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    /// Issue date, `YYYY-MM-DD`.
    pub date: String,
    /// Amount due, a number or a decimal string.
    pub total_due: serde_json::Value,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}
