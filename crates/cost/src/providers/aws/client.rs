//! AWS Cost Explorer client.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{Datelike, Months, NaiveDate, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument};
use url::Url;

use super::models::{
    DateInterval, GetCostAndUsageRequest, GetCostAndUsageResponse, GetCostForecastRequest,
    GetCostForecastResponse, Granularity, GroupDefinition, MetricValue,
};
use super::sigv4::{AwsCredentials, Signer};
use crate::providers::http::{build_client, read_json};
use crate::providers::{Collection, CostProvider, CostProviderError};
use crate::registry::{Measurement, MetricDescriptor};

const DEFAULT_REGION: &str = "us-east-1";
const CHINA_REGION: &str = "cn-northwest-1";
const SERVICE: &str = "ce";
const TARGET_PREFIX: &str = "AWSInsightsIndexService";
const AMZ_JSON: &str = "application/x-amz-json-1.1";
const MAX_PAGES: usize = 20;

pub const TODAY_DAILY_COSTS: &str = "aws_today_daily_costs";
pub const YESTERDAY_DAILY_COSTS: &str = "aws_yesterday_daily_costs";
pub const YESTERDAY_COSTS_BY_SERVICE: &str = "aws_yesterday_costs_by_service";
pub const MONTH_TO_DATE_COSTS: &str = "aws_month_to_date_costs";
pub const MONTH_FORECASTED_COSTS: &str = "aws_month_forecasted_costs";

const SERVICE_LABEL: &str = "aws_service";

/// Which Cost Explorer metrics to publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct AwsMetricToggles {
    pub today: bool,
    pub yesterday: bool,
    pub yesterday_by_service: bool,
    pub month_to_date: bool,
    pub month_forecast: bool,
}

impl Default for AwsMetricToggles {
    fn default() -> Self {
        Self {
            today: true,
            yesterday: true,
            yesterday_by_service: true,
            month_to_date: true,
            month_forecast: true,
        }
    }
}

/// AWS provider configuration.
#[derive(Debug, Clone)]
pub struct AwsConfig {
    pub enabled: bool,
    pub credentials: Option<AwsCredentials>,
    /// Only selects the partition: Cost Explorer has a single endpoint in
    /// `us-east-1`, plus `cn-northwest-1` for the China regions.
    pub region: String,
    pub metrics: AwsMetricToggles,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            credentials: None,
            region: DEFAULT_REGION.to_string(),
            metrics: AwsMetricToggles::default(),
        }
    }
}

/// Calendar days a poll reports on, all UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueryDates {
    pub today: NaiveDate,
    pub tomorrow: NaiveDate,
    pub yesterday: NaiveDate,
    pub month_start: NaiveDate,
    pub next_month_start: NaiveDate,
}

impl QueryDates {
    pub fn for_day(today: NaiveDate) -> Result<Self, CostProviderError> {
        let out_of_range = || CostProviderError::InvalidTimeRange(format!("{today} is out of range"));
        let month_start = today.with_day(1).ok_or_else(out_of_range)?;
        Ok(Self {
            today,
            tomorrow: today.succ_opt().ok_or_else(out_of_range)?,
            yesterday: today.pred_opt().ok_or_else(out_of_range)?,
            month_start,
            next_month_start: month_start
                .checked_add_months(Months::new(1))
                .ok_or_else(out_of_range)?,
        })
    }
}

/// AWS Cost Explorer provider.
///
/// Talks to the JSON-RPC endpoint directly with SigV4-signed requests.
#[derive(Debug, Clone)]
pub struct AwsCostProvider {
    client: Client,
    enabled: bool,
    credentials: Option<AwsCredentials>,
    region: String,
    base_url: String,
    metrics: AwsMetricToggles,
}

impl AwsCostProvider {
    /// Create a new AWS provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider is enabled without credentials, or
    /// the HTTP client cannot be built. Credentials of a disabled provider
    /// are not checked.
    pub fn new(config: AwsConfig) -> Result<Self, CostProviderError> {
        if config.enabled {
            match &config.credentials {
                None => {
                    return Err(CostProviderError::Config(
                        "AWS is enabled but AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY are not set"
                            .to_string(),
                    ))
                }
                Some(creds)
                    if creds.access_key_id.is_empty() || creds.secret_access_key.is_empty() =>
                {
                    return Err(CostProviderError::Config(
                        "AWS credentials must not be empty".to_string(),
                    ))
                }
                Some(_) => {}
            }
        }

        let (base_url, region) = endpoint_for(&config.region);
        if !config.region.is_empty() && config.region != region {
            debug!(
                configured = %config.region,
                signing_region = region,
                "Cost Explorer is only served from one region per partition"
            );
        }

        Ok(Self {
            client: build_client()?,
            enabled: config.enabled,
            credentials: config.credentials,
            base_url,
            region: region.to_string(),
            metrics: config.metrics,
        })
    }

    /// Point the client at a different endpoint.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Call one Cost Explorer operation.
    async fn call<Req, Resp>(&self, operation: &str, request: &Req) -> Result<Resp, CostProviderError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            CostProviderError::Auth("AWS credentials are not configured".to_string())
        })?;

        let url = Url::parse(&self.base_url)
            .map_err(|e| CostProviderError::Config(format!("invalid AWS endpoint: {e}")))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(CostProviderError::Config(format!(
                    "AWS endpoint has no host: {url}"
                )))
            }
        };

        let target = format!("{TARGET_PREFIX}.{operation}");
        let body = serde_json::to_vec(request)?;
        let signature = Signer {
            credentials,
            region: &self.region,
            service: SERVICE,
        }
        .sign_post(
            &host,
            &[("content-type", AMZ_JSON), ("x-amz-target", &target)],
            &body,
            Utc::now(),
        )?;

        debug!(url = %url, target = %target, "Making AWS Cost Explorer request");

        let mut builder = self
            .client
            .post(url)
            .header("Content-Type", AMZ_JSON)
            .header("X-Amz-Target", &target)
            .header("X-Amz-Date", &signature.amz_date)
            .header("Authorization", &signature.authorization);
        if let Some(token) = &credentials.session_token {
            builder = builder.header("X-Amz-Security-Token", token);
        }

        let response = builder.body(body).send().await?;
        read_json(response, "aws").await
    }

    /// Total of `metric` over [start, end).
    async fn total_cost(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        granularity: Granularity,
        metric: &str,
    ) -> Result<f64, CostProviderError> {
        let request = GetCostAndUsageRequest {
            time_period: DateInterval::new(start, end),
            granularity,
            metrics: vec![metric.to_string()],
            group_by: Vec::new(),
            next_page_token: None,
        };
        let response: GetCostAndUsageResponse = self.call("GetCostAndUsage", &request).await?;
        let bucket = response.results_by_time.first().ok_or_else(|| {
            CostProviderError::Malformed("GetCostAndUsage returned no ResultsByTime".to_string())
        })?;
        metric_amount(&bucket.total, metric)
    }

    /// `BlendedCost` per service over [start, end), following pagination.
    async fn costs_by_service(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BTreeMap<String, f64>, CostProviderError> {
        let mut costs = BTreeMap::new();
        let mut next_page_token = None;

        for _ in 0..MAX_PAGES {
            let request = GetCostAndUsageRequest {
                time_period: DateInterval::new(start, end),
                granularity: Granularity::Daily,
                metrics: vec!["BlendedCost".to_string()],
                group_by: vec![GroupDefinition::service()],
                next_page_token,
            };
            let response: GetCostAndUsageResponse =
                self.call("GetCostAndUsage", &request).await?;

            for bucket in &response.results_by_time {
                for group in &bucket.groups {
                    let service = group.keys.first().ok_or_else(|| {
                        CostProviderError::Malformed("group without a service key".to_string())
                    })?;
                    let amount = metric_amount(&group.metrics, "BlendedCost")?;
                    *costs.entry(service.clone()).or_insert(0.0) += amount;
                }
            }

            match response.next_page_token {
                Some(token) if !token.is_empty() => next_page_token = Some(token),
                _ => return Ok(costs),
            }
        }

        Err(CostProviderError::Timeout(format!(
            "GetCostAndUsage still paginating after {MAX_PAGES} pages"
        )))
    }

    /// Forecasted `UNBLENDED_COST` over [start, end).
    async fn forecast(&self, start: NaiveDate, end: NaiveDate) -> Result<f64, CostProviderError> {
        let request = GetCostForecastRequest {
            time_period: DateInterval::new(start, end),
            metric: "UNBLENDED_COST".to_string(),
            granularity: Granularity::Monthly,
        };
        let response: GetCostForecastResponse = self.call("GetCostForecast", &request).await?;
        let total = response.total.ok_or_else(|| {
            CostProviderError::Malformed("GetCostForecast returned no Total".to_string())
        })?;
        parse_metric_value(&total, "forecast Total")
    }

    /// Collect every enabled metric for the given day.
    ///
    /// Each metric is its own query; a failing query only marks its metric
    /// as failed. Errors out only when every enabled query failed.
    pub(crate) async fn fetch_for(&self, today: NaiveDate) -> Result<Collection, CostProviderError> {
        let dates = QueryDates::for_day(today)?;
        let mut collection = Collection::default();
        let mut attempted = 0;

        if self.metrics.today {
            attempted += 1;
            let cost = self
                .total_cost(dates.today, dates.tomorrow, Granularity::Daily, "BlendedCost")
                .await
                .map(|cost| vec![Measurement::new(TODAY_DAILY_COSTS, cost)]);
            record(&mut collection, TODAY_DAILY_COSTS, cost);
        }

        if self.metrics.yesterday {
            attempted += 1;
            let cost = self
                .total_cost(dates.yesterday, dates.today, Granularity::Daily, "BlendedCost")
                .await
                .map(|cost| vec![Measurement::new(YESTERDAY_DAILY_COSTS, cost)]);
            record(&mut collection, YESTERDAY_DAILY_COSTS, cost);
        }

        if self.metrics.yesterday_by_service {
            attempted += 1;
            let costs = self
                .costs_by_service(dates.yesterday, dates.today)
                .await
                .map(|costs| {
                    costs
                        .into_iter()
                        .map(|(service, cost)| {
                            Measurement::new(YESTERDAY_COSTS_BY_SERVICE, cost)
                                .with_label(SERVICE_LABEL, service)
                        })
                        .collect()
                });
            record(&mut collection, YESTERDAY_COSTS_BY_SERVICE, costs);
        }

        if self.metrics.month_to_date {
            attempted += 1;
            let cost = self
                .total_cost(
                    dates.month_start,
                    dates.next_month_start,
                    Granularity::Monthly,
                    "UnblendedCost",
                )
                .await
                .map(|cost| vec![Measurement::new(MONTH_TO_DATE_COSTS, cost)]);
            record(&mut collection, MONTH_TO_DATE_COSTS, cost);
        }

        if self.metrics.month_forecast {
            attempted += 1;
            let cost = self
                .forecast(dates.today, dates.next_month_start)
                .await
                .map(|cost| vec![Measurement::new(MONTH_FORECASTED_COSTS, cost)]);
            record(&mut collection, MONTH_FORECASTED_COSTS, cost);
        }

        if attempted > 0 && collection.failed.len() == attempted {
            return Err(collection
                .failed
                .into_iter()
                .map(|(_, e)| e)
                .next()
                .unwrap_or_else(|| CostProviderError::Malformed("no query ran".to_string())));
        }
        Ok(collection)
    }
}

fn record(
    collection: &mut Collection,
    metric: &str,
    result: Result<Vec<Measurement>, CostProviderError>,
) {
    match result {
        Ok(measurements) => collection.measurements.extend(measurements),
        Err(e) => collection.failed.push((metric.to_string(), e)),
    }
}

/// Cost Explorer endpoint and signing region for a configured region.
fn endpoint_for(region: &str) -> (String, &'static str) {
    let (region, domain) = if region.starts_with("cn-") {
        (CHINA_REGION, "amazonaws.com.cn")
    } else {
        (DEFAULT_REGION, "amazonaws.com")
    };
    (format!("https://ce.{region}.{domain}"), region)
}

fn metric_amount(metrics: &HashMap<String, MetricValue>, metric: &str) -> Result<f64, CostProviderError> {
    let value = metrics
        .get(metric)
        .ok_or_else(|| CostProviderError::Malformed(format!("missing metric {metric}")))?;
    parse_metric_value(value, metric)
}

fn parse_metric_value(value: &MetricValue, what: &str) -> Result<f64, CostProviderError> {
    let amount = value
        .amount
        .as_deref()
        .ok_or_else(|| CostProviderError::Malformed(format!("{what}: missing Amount")))?;
    amount
        .trim()
        .parse()
        .map_err(|_| CostProviderError::Malformed(format!("{what}: '{amount}' is not a number")))
}

#[async_trait]
impl CostProvider for AwsCostProvider {
    fn name(&self) -> &'static str {
        "aws"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn metrics(&self) -> Vec<MetricDescriptor> {
        let mut descriptors = Vec::new();
        if self.metrics.today {
            descriptors.push(MetricDescriptor::new(
                TODAY_DAILY_COSTS,
                "Today daily costs from AWS",
            ));
        }
        if self.metrics.yesterday {
            descriptors.push(MetricDescriptor::new(
                YESTERDAY_DAILY_COSTS,
                "Yesterday daily costs from AWS",
            ));
        }
        if self.metrics.yesterday_by_service {
            descriptors.push(
                MetricDescriptor::new(
                    YESTERDAY_COSTS_BY_SERVICE,
                    "Yesterday daily costs from AWS by service",
                )
                .with_labels(&[SERVICE_LABEL]),
            );
        }
        if self.metrics.month_to_date {
            descriptors.push(MetricDescriptor::new(
                MONTH_TO_DATE_COSTS,
                "Month to date costs from AWS",
            ));
        }
        if self.metrics.month_forecast {
            descriptors.push(MetricDescriptor::new(
                MONTH_FORECASTED_COSTS,
                "Monthly forecasted costs from AWS",
            ));
        }
        descriptors
    }

    #[instrument(skip(self), fields(provider = "aws"))]
    async fn fetch(&self) -> Result<Vec<Measurement>, CostProviderError> {
        self.fetch_for(Utc::now().date_naive()).await?.into_result()
    }

    #[instrument(skip(self), fields(provider = "aws"))]
    async fn fetch_each(&self) -> Result<Collection, CostProviderError> {
        self.fetch_for(Utc::now().date_naive()).await
    }
}
