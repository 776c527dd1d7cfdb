//! BigQuery billing export client.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, instrument};

use super::auth::{TokenProvider, TokenSource};
use super::models::{JobReference, QueryRequest, QueryResponse, TableRow, TableSchema};
use crate::providers::http::{build_client, read_json};
use crate::providers::traits::parse_amount;
use crate::providers::{CostProvider, CostProviderError};
use crate::registry::{Measurement, MetricDescriptor};

const BIGQUERY_API_BASE: &str = "https://bigquery.googleapis.com/bigquery/v2";
const QUERY_TIMEOUT_MS: u32 = 10_000;
const MAX_RESULT_POLLS: usize = 30;
const UNKNOWN: &str = "unknown";

pub const YESTERDAY_COSTS_BY_SERVICE: &str = "gcp_yesterday_costs_by_service";

const SERVICE_LABEL: &str = "gcp_service";
const PROJECT_LABEL: &str = "gcp_project";

/// GCP provider configuration.
#[derive(Debug, Clone, Default)]
pub struct GcpConfig {
    pub enabled: bool,
    pub token_source: Option<TokenSource>,
    /// Project holding the billing export dataset.
    pub billing_project: Option<String>,
    pub dataset_id: Option<String>,
    /// Project the query job runs (and is billed) in.
    pub job_project: Option<String>,
}

/// GCP billing provider backed by the BigQuery billing export.
#[derive(Debug)]
pub struct GcpCostProvider {
    client: Client,
    enabled: bool,
    tokens: Option<TokenProvider>,
    billing_project: String,
    dataset_id: String,
    job_project: String,
    base_url: String,
}

impl GcpCostProvider {
    /// Create a new GCP provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider is enabled without credentials or
    /// without a valid billing project and dataset.
    pub fn new(config: GcpConfig) -> Result<Self, CostProviderError> {
        let client = build_client()?;

        if config.enabled {
            if config.token_source.is_none() {
                return Err(CostProviderError::Config(
                    "GCP is enabled but neither GOOGLE_CREDENTIALS nor GCP_ACCESS_TOKEN is set"
                        .to_string(),
                ));
            }
            validate_identifier(
                "GCP_BQ_BILLING_PROJECT",
                config.billing_project.as_deref().unwrap_or_default(),
            )?;
            validate_identifier(
                "GCP_BQ_DATASET_ID",
                config.dataset_id.as_deref().unwrap_or_default(),
            )?;
        }

        let key_project = match &config.token_source {
            Some(TokenSource::ServiceAccount(key)) => key.project_id.clone(),
            _ => None,
        };
        let job_project = config
            .job_project
            .or(key_project)
            .or_else(|| config.billing_project.clone())
            .unwrap_or_default();
        if config.enabled {
            validate_identifier("GCP_BQ_JOB_PROJECT", &job_project)?;
        }

        Ok(Self {
            tokens: config
                .token_source
                .map(|source| TokenProvider::new(source, client.clone())),
            client,
            enabled: config.enabled,
            billing_project: config.billing_project.unwrap_or_default(),
            dataset_id: config.dataset_id.unwrap_or_default(),
            job_project,
            base_url: BIGQUERY_API_BASE.to_string(),
        })
    }

    /// Point the client at a different BigQuery endpoint.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Submit `sql` and wait for every result page.
    async fn run_query(&self, sql: String) -> Result<(TableSchema, Vec<TableRow>), CostProviderError> {
        let tokens = self.tokens.as_ref().ok_or_else(|| {
            CostProviderError::Auth("GCP credentials are not configured".to_string())
        })?;
        let token = tokens.token().await?;

        let url = format!("{}/projects/{}/queries", self.base_url, self.job_project);
        debug!(url = %url, "Submitting BigQuery query");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&QueryRequest {
                query: sql,
                use_legacy_sql: false,
                timeout_ms: Some(QUERY_TIMEOUT_MS),
                max_results: None,
            })
            .send()
            .await?;
        let mut page: QueryResponse = read_json(response, "gcp").await?;
        let job = page.job_reference.clone().ok_or_else(|| {
            CostProviderError::Malformed("query response has no jobReference".to_string())
        })?;

        let mut schema = None;
        let mut rows = Vec::new();
        for _ in 0..MAX_RESULT_POLLS {
            let mut page_token = None;
            if page.job_complete {
                if schema.is_none() {
                    schema = page.schema.take();
                }
                rows.append(&mut page.rows);
                match page.page_token.take() {
                    Some(next) => page_token = Some(next),
                    None => return Ok((schema.unwrap_or_default(), rows)),
                }
            }
            page = self
                .query_results(&job, page_token.as_deref(), &token)
                .await?;
        }

        Err(CostProviderError::Timeout(format!(
            "BigQuery job {} not finished after {MAX_RESULT_POLLS} polls",
            job.job_id
        )))
    }

    async fn query_results(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
        token: &str,
    ) -> Result<QueryResponse, CostProviderError> {
        let url = format!(
            "{}/projects/{}/queries/{}",
            self.base_url, job.project_id, job.job_id
        );
        let mut params = vec![("timeoutMs", QUERY_TIMEOUT_MS.to_string())];
        if let Some(page_token) = page_token {
            params.push(("pageToken", page_token.to_string()));
        }
        if let Some(location) = &job.location {
            params.push(("location", location.clone()));
        }

        debug!(url = %url, has_page_token = page_token.is_some(), "Fetching BigQuery results");
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .query(&params)
            .send()
            .await?;
        read_json(response, "gcp").await
    }

    pub(crate) async fn fetch_for(&self, today: NaiveDate) -> Result<Vec<Measurement>, CostProviderError> {
        let yesterday = today.pred_opt().ok_or_else(|| {
            CostProviderError::InvalidTimeRange(format!("{today} is out of range"))
        })?;
        let sql = build_query(&self.billing_project, &self.dataset_id, yesterday, today);
        let (schema, rows) = self.run_query(sql).await?;
        debug!(rows = rows.len(), "BigQuery query finished");
        rows_to_measurements(&schema, &rows)
    }
}

/// Identifiers end up inside the SQL text, so only a safe alphabet is allowed.
fn validate_identifier(what: &str, value: &str) -> Result<(), CostProviderError> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'));
    if valid {
        Ok(())
    } else {
        Err(CostProviderError::Config(format!(
            "{what} must be set and contain only letters, digits, '_', '-', '.' or ':' (got '{value}')"
        )))
    }
}

/// Net cost per service and project over [start, end).
pub(crate) fn build_query(
    billing_project: &str,
    dataset_id: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> String {
    format!(
        "SELECT
  service.description AS service_description,
  project.name AS project_name,
  SUM(CAST(cost AS NUMERIC))
    + SUM(IFNULL((SELECT SUM(CAST(c.amount AS NUMERIC)) FROM UNNEST(credits) c), 0)) AS subtotal
FROM
  `{billing_project}.{dataset_id}.*`
WHERE
  DATE(usage_start_time) >= DATE('{start}')
  AND DATE(usage_start_time) < DATE('{end}')
GROUP BY
  service.description, project.name
ORDER BY
  subtotal DESC",
        start = start.format("%Y-%m-%d"),
        end = end.format("%Y-%m-%d"),
    )
}

pub(crate) fn rows_to_measurements(
    schema: &TableSchema,
    rows: &[TableRow],
) -> Result<Vec<Measurement>, CostProviderError> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let column = |name: &str| {
        schema
            .fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| CostProviderError::Malformed(format!("result has no column {name}")))
    };
    let service_idx = column("service_description")?;
    let project_idx = column("project_name")?;
    let subtotal_idx = column("subtotal")?;

    let mut totals: BTreeMap<(String, String), f64> = BTreeMap::new();
    for row in rows {
        let cell = |idx: usize| {
            row.f.get(idx).map(|c| &c.v).ok_or_else(|| {
                CostProviderError::Malformed("row has fewer cells than the schema".to_string())
            })
        };
        let service = label_value(cell(service_idx)?);
        let project = label_value(cell(project_idx)?);
        let subtotal = parse_amount(cell(subtotal_idx)?, "subtotal")?;
        *totals.entry((service, project)).or_insert(0.0) += subtotal;
    }

    Ok(totals
        .into_iter()
        .map(|((service, project), subtotal)| {
            Measurement::new(YESTERDAY_COSTS_BY_SERVICE, subtotal)
                .with_label(SERVICE_LABEL, service)
                .with_label(PROJECT_LABEL, project)
        })
        .collect())
}

fn label_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => UNKNOWN.to_string(),
        other => other.to_string(),
    }
}

#[async_trait]
impl CostProvider for GcpCostProvider {
    fn name(&self) -> &'static str {
        "gcp"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn metrics(&self) -> Vec<MetricDescriptor> {
        vec![MetricDescriptor::new(
            YESTERDAY_COSTS_BY_SERVICE,
            "Yesterday daily costs from GCP by service",
        )
        .with_labels(&[SERVICE_LABEL, PROJECT_LABEL])]
    }

    #[instrument(skip(self), fields(provider = "gcp"))]
    async fn fetch(&self) -> Result<Vec<Measurement>, CostProviderError> {
        self.fetch_for(Utc::now().date_naive()).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::registry::LabelSet;

    fn enabled_config() -> GcpConfig {
        GcpConfig {
            enabled: true,
            token_source: Some(TokenSource::Static("token".to_string())),
            billing_project: Some("billing-proj".to_string()),
            dataset_id: Some("billing_export".to_string()),
            job_project: None,
        }
    }

    fn schema() -> TableSchema {
        serde_json::from_value(json!({
            "fields": [
                {"name": "service_description", "type": "STRING"},
                {"name": "project_name", "type": "STRING"},
                {"name": "subtotal", "type": "NUMERIC"}
            ]
        }))
        .unwrap()
    }

    fn row(service: Value, project: Value, subtotal: Value) -> TableRow {
        serde_json::from_value(json!({"f": [{"v": service}, {"v": project}, {"v": subtotal}]}))
            .unwrap()
    }

    #[test]
    fn test_query_targets_export_tables_for_one_day() {
        let sql = build_query(
            "billing-proj",
            "billing_export",
            NaiveDate::from_ymd_opt(2024, 6, 14).unwrap(),
            NaiveDate::from_ymd_opt(2024, 6, 15).unwrap(),
        );
        assert!(sql.contains("`billing-proj.billing_export.*`"));
        assert!(sql.contains("DATE(usage_start_time) >= DATE('2024-06-14')"));
        assert!(sql.contains("DATE(usage_start_time) < DATE('2024-06-15')"));
        assert!(sql.contains("UNNEST(credits)"));
    }

    #[test]
    fn test_rows_to_measurements() {
        let rows = vec![
            row(json!("Compute Engine"), json!("prod"), json!("12.5")),
            row(json!("BigQuery"), Value::Null, json!("0.25")),
        ];
        let measurements = rows_to_measurements(&schema(), &rows).unwrap();
        assert_eq!(measurements.len(), 2);

        let bq = measurements
            .iter()
            .find(|m| m.labels.get(SERVICE_LABEL) == Some("BigQuery"))
            .unwrap();
        assert_eq!(bq.labels.get(PROJECT_LABEL), Some(UNKNOWN));
        assert!((bq.value - 0.25).abs() < f64::EPSILON);
        assert_eq!(
            measurements[1].labels,
            LabelSet::from([(SERVICE_LABEL, "Compute Engine"), (PROJECT_LABEL, "prod")])
        );
    }

    #[test]
    fn test_rows_read_by_column_name() {
        let schema: TableSchema = serde_json::from_value(json!({
            "fields": [
                {"name": "subtotal"},
                {"name": "project_name"},
                {"name": "service_description"}
            ]
        }))
        .unwrap();
        let rows = vec![row(json!("-1.5"), json!("dev"), json!("Cloud Storage"))];
        let measurements = rows_to_measurements(&schema, &rows).unwrap();
        assert_eq!(measurements[0].labels.get(SERVICE_LABEL), Some("Cloud Storage"));
        assert!((measurements[0].value + 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_duplicate_label_sets_are_summed() {
        let rows = vec![
            row(json!("Networking"), Value::Null, json!("1")),
            row(json!("Networking"), Value::Null, json!("2")),
        ];
        let measurements = rows_to_measurements(&schema(), &rows).unwrap();
        assert_eq!(measurements.len(), 1);
        assert!((measurements[0].value - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_missing_column_is_malformed() {
        let schema: TableSchema =
            serde_json::from_value(json!({"fields": [{"name": "service_description"}]})).unwrap();
        let rows = vec![row(json!("a"), json!("b"), json!("1"))];
        assert!(matches!(
            rows_to_measurements(&schema, &rows),
            Err(CostProviderError::Malformed(_))
        ));
    }

    #[test]
    fn test_enabled_requires_credentials_and_location() {
        let mut config = enabled_config();
        config.token_source = None;
        assert!(matches!(
            GcpCostProvider::new(config),
            Err(CostProviderError::Config(_))
        ));

        let mut config = enabled_config();
        config.dataset_id = None;
        assert!(GcpCostProvider::new(config).is_err());

        let mut config = enabled_config();
        config.dataset_id = Some("export`; DROP TABLE x; --".to_string());
        assert!(GcpCostProvider::new(config).is_err());
    }

    #[test]
    fn test_job_project_defaults_to_billing_project() {
        let provider = GcpCostProvider::new(enabled_config()).unwrap();
        assert_eq!(provider.job_project, "billing-proj");

        let mut config = enabled_config();
        config.job_project = Some("runner".to_string());
        let provider = GcpCostProvider::new(config).unwrap();
        assert_eq!(provider.job_project, "runner");
    }

    #[test]
    fn test_disabled_accepts_empty_config() {
        let provider = GcpCostProvider::new(GcpConfig::default()).unwrap();
        assert!(!provider.is_enabled());
        assert_eq!(provider.metrics()[0].label_names, vec![SERVICE_LABEL, PROJECT_LABEL]);
    }
}
