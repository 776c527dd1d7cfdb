//! Command line and environment configuration.

use std::net::SocketAddr;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, ValueEnum};
use cost::providers::{
    AwsConfig, AwsCredentials, AwsMetricToggles, CostProviderError, GcpConfig,
    ServersComConfig, ServiceAccountKey, TokenSource,
};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Cost exporter - publishes cloud billing costs as gauges.
///
/// Every option can also be set through the environment variable shown.
#[derive(Parser, Debug, Clone)]
#[command(name = "cost-exporter", version)]
#[command(about = "Publish AWS, GCP and Servers.com billing costs over HTTP")]
pub struct Cli {
    /// Address the HTTP server binds to.
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:5000")]
    pub listen_addr: SocketAddr,

    /// Seconds between polls of each provider.
    #[arg(
        long,
        env = "QUERY_PERIOD",
        default_value_t = 5400,
        value_parser = clap::value_parser!(u64).range(1..=31_536_000)
    )]
    pub query_period: u64,

    /// Seconds to wait before the first poll (at most one day).
    #[arg(
        long,
        env = "STARTUP_DELAY",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(..=86_400)
    )]
    pub startup_delay: u64,

    /// Log format.
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    pub verbose: bool,

    // ------------------------------------------------------------------
    // AWS
    // ------------------------------------------------------------------
    /// Poll AWS Cost Explorer.
    #[arg(long, env = "AWS_ENABLED", default_value_t = false, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub aws_enabled: bool,

    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    pub aws_access_key_id: Option<String>,

    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub aws_secret_access_key: Option<String>,

    #[arg(long, env = "AWS_SESSION_TOKEN", hide_env_values = true)]
    pub aws_session_token: Option<String>,

    /// Selects the Cost Explorer partition. The endpoint itself is always
    /// `us-east-1`, or `cn-northwest-1` for `cn-*` regions.
    #[arg(long, env = "AWS_COST_EXPLORER_REGION", default_value = "us-east-1")]
    pub aws_cost_explorer_region: String,

    /// Publish `aws_today_daily_costs`.
    #[arg(long, env = "METRIC_TODAY_DAILY_COSTS", default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub metric_today_daily_costs: bool,

    /// Publish `aws_yesterday_daily_costs`.
    #[arg(long, env = "METRIC_YESTERDAY_DAILY_COSTS", default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub metric_yesterday_daily_costs: bool,

    /// Publish `aws_yesterday_costs_by_service`.
    #[arg(long, env = "METRIC_YESTERDAY_COSTS_BY_SERVICE", default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub metric_yesterday_costs_by_service: bool,

    /// Publish `aws_month_to_date_costs`.
    #[arg(long, env = "METRIC_MONTH_TO_DATE_COSTS", default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub metric_month_to_date_costs: bool,

    /// Publish `aws_month_forecasted_costs`.
    #[arg(long, env = "METRIC_MONTH_FORECASTED_COSTS", default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub metric_month_forecasted_costs: bool,

    // ------------------------------------------------------------------
    // GCP
    // ------------------------------------------------------------------
    /// Poll the BigQuery billing export.
    #[arg(long, env = "GCP_ENABLED", default_value_t = false, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub gcp_enabled: bool,

    /// Service-account key JSON (file content, not a path).
    #[arg(long, env = "GOOGLE_CREDENTIALS", hide_env_values = true)]
    pub google_credentials: Option<String>,

    /// Pre-minted OAuth access token, used when no key is given.
    #[arg(long, env = "GCP_ACCESS_TOKEN", hide_env_values = true)]
    pub gcp_access_token: Option<String>,

    /// Project holding the billing export dataset.
    #[arg(long, env = "GCP_BQ_BILLING_PROJECT")]
    pub gcp_bq_billing_project: Option<String>,

    /// Billing export dataset.
    #[arg(long, env = "GCP_BQ_DATASET_ID")]
    pub gcp_bq_dataset_id: Option<String>,

    /// Project the query job runs in (defaults to the key's project).
    #[arg(long, env = "GCP_BQ_JOB_PROJECT")]
    pub gcp_bq_job_project: Option<String>,

    // ------------------------------------------------------------------
    // Servers.com
    // ------------------------------------------------------------------
    /// Poll the Servers.com billing API.
    #[arg(long, env = "SERVERSCOM_ENABLED", default_value_t = false, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub serverscom_enabled: bool,

    #[arg(long, env = "SERVERSCOM_TOKEN", hide_env_values = true)]
    pub serverscom_token: Option<String>,
}

impl Cli {
    pub fn query_period(&self) -> Duration {
        Duration::from_secs(self.query_period)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay)
    }

    pub fn aws_config(&self) -> AwsConfig {
        let credentials = match (
            non_empty(self.aws_access_key_id.as_ref()),
            non_empty(self.aws_secret_access_key.as_ref()),
        ) {
            (Some(access_key_id), Some(secret_access_key)) => Some(AwsCredentials {
                access_key_id,
                secret_access_key,
                session_token: non_empty(self.aws_session_token.as_ref()),
            }),
            _ => None,
        };

        AwsConfig {
            enabled: self.aws_enabled,
            credentials,
            region: self.aws_cost_explorer_region.clone(),
            metrics: AwsMetricToggles {
                today: self.metric_today_daily_costs,
                yesterday: self.metric_yesterday_daily_costs,
                yesterday_by_service: self.metric_yesterday_costs_by_service,
                month_to_date: self.metric_month_to_date_costs,
                month_forecast: self.metric_month_forecasted_costs,
            },
        }
    }

    /// GCP settings; a service-account key wins over a static token.
    ///
    /// Credentials are only parsed when GCP is enabled.
    pub fn gcp_config(&self) -> Result<GcpConfig, CostProviderError> {
        let token_source = if self.gcp_enabled {
            match (
                non_empty(self.google_credentials.as_ref()),
                non_empty(self.gcp_access_token.as_ref()),
            ) {
                (Some(json), _) => Some(TokenSource::ServiceAccount(
                    ServiceAccountKey::from_json(&json)?,
                )),
                (None, Some(token)) => Some(TokenSource::Static(token)),
                (None, None) => None,
            }
        } else {
            None
        };

        Ok(GcpConfig {
            enabled: self.gcp_enabled,
            token_source,
            billing_project: non_empty(self.gcp_bq_billing_project.as_ref()),
            dataset_id: non_empty(self.gcp_bq_dataset_id.as_ref()),
            job_project: non_empty(self.gcp_bq_job_project.as_ref()),
        })
    }

    pub fn serverscom_config(&self) -> ServersComConfig {
        ServersComConfig {
            enabled: self.serverscom_enabled,
            token: non_empty(self.serverscom_token.as_ref()),
        }
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty()).cloned()
}
