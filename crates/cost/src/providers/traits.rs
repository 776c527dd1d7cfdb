//! Cost provider trait and common types.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info};

use crate::registry::{MetricDescriptor, Measurement};

/// Errors that can occur during cost provider operations.
#[derive(Error, Debug)]
pub enum CostProviderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Authentication error (missing, rejected or expired credentials).
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Response parsed but did not have the expected shape.
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// Invalid time range.
    #[error("Invalid time range: {0}")]
    InvalidTimeRange(String),

    /// Vendor did not finish within the allowed number of polls.
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl CostProviderError {
    /// Map a non-success HTTP status and body to an error.
    #[must_use]
    pub fn from_status(status: reqwest::StatusCode, message: String) -> Self {
        match status.as_u16() {
            401 | 403 => Self::Auth(message),
            429 => Self::RateLimited(message),
            code => Self::Api {
                status: code,
                message,
            },
        }
    }

    /// Map a non-success response using the vendor's error code as well.
    ///
    /// Some vendors report throttling with a 400 and a code in the body.
    #[must_use]
    pub fn from_vendor(status: reqwest::StatusCode, code: Option<&str>, message: String) -> Self {
        match code {
            Some(code) if THROTTLING_CODES.contains(&code) => Self::RateLimited(message),
            _ => Self::from_status(status, message),
        }
    }
}

const THROTTLING_CODES: &[&str] = &[
    "ThrottlingException",
    "TooManyRequestsException",
    "LimitExceededException",
    "RequestLimitExceeded",
    "RESOURCE_EXHAUSTED",
];

/// Measurements from a fetch whose metrics are refreshed independently.
#[derive(Debug, Default)]
pub struct Collection {
    /// Fresh measurements for every metric that was refreshed.
    pub measurements: Vec<Measurement>,
    /// Metrics that could not be refreshed this time, with the reason.
    pub failed: Vec<(String, CostProviderError)>,
}

impl Collection {
    /// A collection in which every metric was refreshed.
    #[must_use]
    pub fn complete(measurements: Vec<Measurement>) -> Self {
        Self {
            measurements,
            failed: Vec::new(),
        }
    }

    /// All-or-nothing view: the first failure, if any, fails the whole fetch.
    ///
    /// # Errors
    ///
    /// Returns the error of the first metric that could not be refreshed.
    pub fn into_result(self) -> Result<Vec<Measurement>, CostProviderError> {
        match self.failed.into_iter().next() {
            Some((_, e)) => Err(e),
            None => Ok(self.measurements),
        }
    }
}

/// Outcome of one provider invocation.
#[derive(Debug)]
pub enum PollResult {
    /// Provider is disabled; nothing was fetched and nothing may change.
    Skipped,
    /// Fresh measurements, possibly empty.
    Collected(Vec<Measurement>),
    /// Some metrics were refreshed; the ones in `failed` must keep their values.
    Partial {
        measurements: Vec<Measurement>,
        failed: Vec<String>,
    },
    /// Vendor call failed; previously published values must be kept.
    Failed(CostProviderError),
}

impl PollResult {
    /// Whether this result carries fresh data.
    #[must_use]
    pub fn is_collected(&self) -> bool {
        matches!(self, Self::Collected(_) | Self::Partial { .. })
    }
}

/// Trait for cloud billing providers.
///
/// Implementations fetch one vendor's cost data and turn it into
/// measurements. [`CostProvider::collect`] never fails: vendor errors are
/// folded into [`PollResult::Failed`].
#[async_trait]
pub trait CostProvider: Send + Sync {
    /// Get the provider name (e.g., "aws", "gcp").
    fn name(&self) -> &'static str;

    /// Whether the provider is enabled by configuration.
    fn is_enabled(&self) -> bool;

    /// Metrics owned by this provider under its current configuration.
    fn metrics(&self) -> Vec<MetricDescriptor>;

    /// Query the vendor and convert the result into measurements.
    ///
    /// # Errors
    ///
    /// Returns an error if the API request fails, authentication fails, or
    /// the response does not have the expected shape.
    async fn fetch(&self) -> Result<Vec<Measurement>, CostProviderError>;

    /// Query the vendor, letting metrics fail one by one.
    ///
    /// Providers whose metrics come from separate vendor calls override this
    /// so a failing call only holds back its own metrics. The default is
    /// [`CostProvider::fetch`], all or nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing at all could be refreshed.
    async fn fetch_each(&self) -> Result<Collection, CostProviderError> {
        self.fetch().await.map(Collection::complete)
    }

    /// Run one poll cycle.
    async fn collect(&self) -> PollResult {
        if !self.is_enabled() {
            info!(provider = self.name(), "Provider is not enabled");
            return PollResult::Skipped;
        }

        info!(provider = self.name(), "Calculating costs...");
        match self.fetch_each().await {
            Ok(Collection {
                measurements,
                failed,
            }) if failed.is_empty() => {
                info!(
                    provider = self.name(),
                    measurements = measurements.len(),
                    "Finished calculating costs"
                );
                PollResult::Collected(measurements)
            }
            Ok(Collection {
                measurements,
                failed,
            }) => {
                for (metric, e) in &failed {
                    error!(provider = self.name(), metric = %metric, error = %e, "Failed to calculate metric");
                }
                info!(
                    provider = self.name(),
                    measurements = measurements.len(),
                    failed = failed.len(),
                    "Finished calculating costs with failures"
                );
                PollResult::Partial {
                    measurements,
                    failed: failed.into_iter().map(|(metric, _)| metric).collect(),
                }
            }
            Err(e) => {
                error!(provider = self.name(), error = %e, "Failed to calculate costs");
                PollResult::Failed(e)
            }
        }
    }
}

/// Parse a decimal amount the way billing APIs send them (strings or numbers).
pub(crate) fn parse_amount(value: &serde_json::Value, what: &str) -> Result<f64, CostProviderError> {
    match value {
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| CostProviderError::Malformed(format!("{what}: {n} is not a float"))),
        serde_json::Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| CostProviderError::Malformed(format!("{what}: '{s}' is not a number"))),
        other => Err(CostProviderError::Malformed(format!(
            "{what}: expected a number, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed {
        enabled: bool,
        fail: bool,
    }

    #[async_trait]
    impl CostProvider for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn is_enabled(&self) -> bool {
            self.enabled
        }

        fn metrics(&self) -> Vec<MetricDescriptor> {
            vec![MetricDescriptor::new("fixed_cost", "Fixed cost")]
        }

        async fn fetch(&self) -> Result<Vec<Measurement>, CostProviderError> {
            if self.fail {
                return Err(CostProviderError::Api {
                    status: 500,
                    message: "boom".to_string(),
                });
            }
            Ok(vec![Measurement::new("fixed_cost", 1.5)])
        }
    }

    #[tokio::test]
    async fn test_collect_disabled_is_skipped() {
        let provider = Fixed {
            enabled: false,
            fail: true,
        };
        assert!(matches!(provider.collect().await, PollResult::Skipped));
    }

    #[tokio::test]
    async fn test_collect_folds_errors() {
        let provider = Fixed {
            enabled: true,
            fail: true,
        };
        match provider.collect().await {
            PollResult::Failed(CostProviderError::Api { status, .. }) => assert_eq!(status, 500),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_collect_success() {
        let provider = Fixed {
            enabled: true,
            fail: false,
        };
        let result = provider.collect().await;
        assert!(result.is_collected());
    }

    struct Halves;

    #[async_trait]
    impl CostProvider for Halves {
        fn name(&self) -> &'static str {
            "halves"
        }

        fn is_enabled(&self) -> bool {
            true
        }

        fn metrics(&self) -> Vec<MetricDescriptor> {
            vec![
                MetricDescriptor::new("left_cost", "Left"),
                MetricDescriptor::new("right_cost", "Right"),
            ]
        }

        async fn fetch(&self) -> Result<Vec<Measurement>, CostProviderError> {
            self.fetch_each().await?.into_result()
        }

        async fn fetch_each(&self) -> Result<Collection, CostProviderError> {
            Ok(Collection {
                measurements: vec![Measurement::new("left_cost", 2.0)],
                failed: vec![(
                    "right_cost".to_string(),
                    CostProviderError::Malformed("no total".to_string()),
                )],
            })
        }
    }

    #[tokio::test]
    async fn test_collect_partial() {
        match Halves.collect().await {
            PollResult::Partial {
                measurements,
                failed,
            } => {
                assert_eq!(measurements, vec![Measurement::new("left_cost", 2.0)]);
                assert_eq!(failed, vec!["right_cost".to_string()]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(Halves.fetch().await, Err(CostProviderError::Malformed(_))));
    }

    #[test]
    fn test_from_status() {
        assert!(matches!(
            CostProviderError::from_status(reqwest::StatusCode::FORBIDDEN, String::new()),
            CostProviderError::Auth(_)
        ));
        assert!(matches!(
            CostProviderError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, String::new()),
            CostProviderError::RateLimited(_)
        ));
        assert!(matches!(
            CostProviderError::from_status(reqwest::StatusCode::BAD_GATEWAY, String::new()),
            CostProviderError::Api { status: 502, .. }
        ));
    }

    #[test]
    fn test_from_vendor_throttling_code() {
        assert!(matches!(
            CostProviderError::from_vendor(
                reqwest::StatusCode::BAD_REQUEST,
                Some("ThrottlingException"),
                "Rate exceeded".to_string()
            ),
            CostProviderError::RateLimited(_)
        ));
        assert!(matches!(
            CostProviderError::from_vendor(
                reqwest::StatusCode::BAD_REQUEST,
                Some("DataUnavailableException"),
                String::new()
            ),
            CostProviderError::Api { status: 400, .. }
        ));
        assert!(matches!(
            CostProviderError::from_vendor(reqwest::StatusCode::UNAUTHORIZED, None, String::new()),
            CostProviderError::Auth(_)
        ));
    }

    #[test]
    fn test_parse_amount() {
        assert!((parse_amount(&json!("12.50"), "x").unwrap() - 12.5).abs() < f64::EPSILON);
        assert!((parse_amount(&json!(3), "x").unwrap() - 3.0).abs() < f64::EPSILON);
        assert!(parse_amount(&json!("n/a"), "x").is_err());
        assert!(parse_amount(&json!(null), "x").is_err());
    }
}
