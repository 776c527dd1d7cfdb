//! BigQuery REST models.

use serde::{Deserialize, Serialize};

/// `jobs.query` request body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub query: String,
    pub use_legacy_sql: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_results: Option<u32>,
}

/// Identifies a query job.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReference {
    pub project_id: String,
    pub job_id: String,
    #[serde(default)]
    pub location: Option<String>,
}

/// Column description.
#[derive(Debug, Clone, Deserialize)]
pub struct TableFieldSchema {
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: Option<String>,
}

/// Result schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TableSchema {
    #[serde(default)]
    pub fields: Vec<TableFieldSchema>,
}

/// One cell. Values are strings or `null`.
#[derive(Debug, Clone, Deserialize)]
pub struct TableCell {
    #[serde(default)]
    pub v: serde_json::Value,
}

/// One row, cells in schema order.
#[derive(Debug, Clone, Deserialize)]
pub struct TableRow {
    #[serde(default)]
    pub f: Vec<TableCell>,
}

/// Response of both `jobs.query` and `jobs.getQueryResults`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    #[serde(default)]
    pub job_complete: bool,
    #[serde(default)]
    pub job_reference: Option<JobReference>,
    #[serde(default)]
    pub schema: Option<TableSchema>,
    #[serde(default)]
    pub rows: Vec<TableRow>,
    #[serde(default)]
    pub page_token: Option<String>,
    #[serde(default)]
    pub total_rows: Option<String>,
}
