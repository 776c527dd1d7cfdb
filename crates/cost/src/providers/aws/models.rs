//! Cost Explorer request and response models.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ============================================================================
// Requests
// ============================================================================

/// Time range, `YYYY-MM-DD`, end exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DateInterval {
    pub start: String,
    pub end: String,
}

impl DateInterval {
    #[must_use]
    pub fn new(start: chrono::NaiveDate, end: chrono::NaiveDate) -> Self {
        Self {
            start: start.format("%Y-%m-%d").to_string(),
            end: end.format("%Y-%m-%d").to_string(),
        }
    }
}

/// Result granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Granularity {
    Daily,
    Monthly,
}

/// Group-by clause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GroupDefinition {
    #[serde(rename = "Type")]
    pub group_type: String,
    pub key: String,
}

impl GroupDefinition {
    /// Group by the `SERVICE` dimension.
    #[must_use]
    pub fn service() -> Self {
        Self {
            group_type: "DIMENSION".to_string(),
            key: "SERVICE".to_string(),
        }
    }
}

/// `GetCostAndUsage` request body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetCostAndUsageRequest {
    pub time_period: DateInterval,
    pub granularity: Granularity,
    pub metrics: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<GroupDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

/// `GetCostForecast` request body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetCostForecastRequest {
    pub time_period: DateInterval,
    pub metric: String,
    pub granularity: Granularity,
}

// ============================================================================
// Responses
// ============================================================================

/// Amount and unit of one cost metric. Amounts are decimal strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricValue {
    pub amount: Option<String>,
    pub unit: Option<String>,
}

/// One group within a time bucket.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Group {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub metrics: HashMap<String, MetricValue>,
}

/// One time bucket.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResultByTime {
    pub time_period: Option<serde_json::Value>,
    #[serde(default)]
    pub total: HashMap<String, MetricValue>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub estimated: bool,
}

/// `GetCostAndUsage` response body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetCostAndUsageResponse {
    #[serde(default)]
    pub results_by_time: Vec<ResultByTime>,
    pub next_page_token: Option<String>,
}

/// `GetCostForecast` response body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetCostForecastResponse {
    pub total: Option<MetricValue>,
}
