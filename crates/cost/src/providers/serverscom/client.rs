//! Servers.com billing API client.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use reqwest::Client;
use tracing::{debug, instrument};

use super::models::Invoice;
use crate::providers::http::{build_client, read_json};
use crate::providers::traits::parse_amount;
use crate::providers::{CostProvider, CostProviderError};
use crate::registry::{Measurement, MetricDescriptor};

const SERVERSCOM_API_BASE: &str = "https://api.servers.com/v1";
const PER_PAGE: usize = 50;
const MAX_PAGES: u32 = 40;
const LOOKBACK_YEARS: i32 = 2;

pub const MONTHLY_EXPENSES: &str = "serverscom_monthly_expenses";

const MONTH_LABEL: &str = "month_year";

/// Servers.com provider configuration.
#[derive(Debug, Clone, Default)]
pub struct ServersComConfig {
    pub enabled: bool,
    pub token: Option<String>,
}

/// Servers.com invoice provider.
#[derive(Debug, Clone)]
pub struct ServersComCostProvider {
    client: Client,
    enabled: bool,
    token: Option<String>,
    base_url: String,
}

impl ServersComCostProvider {
    /// Create a new Servers.com provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider is enabled without a token.
    pub fn new(config: ServersComConfig) -> Result<Self, CostProviderError> {
        let token = config.token.filter(|t| !t.is_empty());
        if config.enabled && token.is_none() {
            return Err(CostProviderError::Config(
                "Servers.com is enabled but SERVERSCOM_TOKEN is not set".to_string(),
            ));
        }

        Ok(Self {
            client: build_client()?,
            enabled: config.enabled,
            token,
            base_url: SERVERSCOM_API_BASE.to_string(),
        })
    }

    /// Point the client at a different endpoint.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Every invoice issued on or after `start_date`.
    async fn invoices_since(&self, start_date: NaiveDate) -> Result<Vec<Invoice>, CostProviderError> {
        let token = self.token.as_deref().ok_or_else(|| {
            CostProviderError::Auth("Servers.com token is not configured".to_string())
        })?;
        let url = format!("{}/billing/invoices", self.base_url);
        let start = start_date.format("%Y-%m-%d").to_string();

        let mut invoices = Vec::new();
        for page in 1..=MAX_PAGES {
            debug!(url = %url, page, start_date = %start, "Making Servers.com API request");
            let response = self
                .client
                .get(&url)
                .bearer_auth(token)
                .header("Content-Type", "application/json")
                .query(&[
                    ("per_page", PER_PAGE.to_string()),
                    ("start_date", start.clone()),
                    ("page", page.to_string()),
                ])
                .send()
                .await?;
            let batch: Vec<Invoice> = read_json(response, "serverscom").await?;
            let last_page = batch.len() < PER_PAGE;
            invoices.extend(batch);
            if last_page {
                return Ok(invoices);
            }
        }

        Err(CostProviderError::Timeout(format!(
            "invoice listing still paginating after {MAX_PAGES} pages"
        )))
    }

    pub(crate) async fn fetch_for(&self, today: NaiveDate) -> Result<Vec<Measurement>, CostProviderError> {
        let invoices = self.invoices_since(lookback_start(today)?).await?;
        debug!(invoices = invoices.len(), "Fetched Servers.com invoices");

        Ok(aggregate_monthly(&invoices)?
            .into_iter()
            .map(|(month, total)| Measurement::new(MONTHLY_EXPENSES, total).with_label(MONTH_LABEL, month))
            .collect())
    }
}

/// First day of the same month, two years back.
fn lookback_start(today: NaiveDate) -> Result<NaiveDate, CostProviderError> {
    NaiveDate::from_ymd_opt(today.year() - LOOKBACK_YEARS, today.month(), 1).ok_or_else(|| {
        CostProviderError::InvalidTimeRange(format!("no lookback window for {today}"))
    })
}

/// Sum invoice totals per `YYYY-MM`, dropping months that net to zero.
///
/// # Errors
///
/// Returns an error if an invoice date or amount cannot be parsed.
pub fn aggregate_monthly(invoices: &[Invoice]) -> Result<BTreeMap<String, f64>, CostProviderError> {
    let mut totals: BTreeMap<String, f64> = BTreeMap::new();
    for invoice in invoices {
        let month = month_bucket(&invoice.date)?;
        let amount = parse_amount(&invoice.total_due, "total_due")?;
        *totals.entry(month).or_insert(0.0) += amount;
    }
    totals.retain(|_, total| total.abs() > 0.0);
    Ok(totals)
}

fn month_bucket(date: &str) -> Result<String, CostProviderError> {
    let malformed = || CostProviderError::Malformed(format!("invalid invoice date '{date}'"));
    let month = date.get(..7).ok_or_else(malformed)?;
    NaiveDate::parse_from_str(&format!("{month}-01"), "%Y-%m-%d").map_err(|_| malformed())?;
    Ok(month.to_string())
}

#[async_trait]
impl CostProvider for ServersComCostProvider {
    fn name(&self) -> &'static str {
        "serverscom"
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn metrics(&self) -> Vec<MetricDescriptor> {
        vec![
            MetricDescriptor::new(MONTHLY_EXPENSES, "Monthly expenses from servers.com")
                .with_labels(&[MONTH_LABEL]),
        ]
    }

    #[instrument(skip(self), fields(provider = "serverscom"))]
    async fn fetch(&self) -> Result<Vec<Measurement>, CostProviderError> {
        self.fetch_for(Utc::now().date_naive()).await
    }
}
