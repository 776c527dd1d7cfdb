//! AWS Cost Explorer client against a mock endpoint.

use cost::providers::{
    AwsConfig, AwsCostProvider, AwsCredentials, AwsMetricToggles, CostProvider, CostProviderError,
};
use cost::scheduler::poll_provider;
use cost::{LabelSet, Measurement, MetricRegistry, PollOutcome};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const COST_AND_USAGE: &str = "AWSInsightsIndexService.GetCostAndUsage";
const FORECAST: &str = "AWSInsightsIndexService.GetCostForecast";

fn provider(server: &MockServer, metrics: AwsMetricToggles) -> AwsCostProvider {
    AwsCostProvider::new(AwsConfig {
        enabled: true,
        credentials: Some(AwsCredentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: Some("session".to_string()),
        }),
        region: "us-east-1".to_string(),
        metrics,
    })
    .unwrap()
    .with_base_url(server.uri())
}

fn total(metric: &str, amount: &str) -> serde_json::Value {
    json!({
        "ResultsByTime": [{
            "TimePeriod": {"Start": "2024-06-01", "End": "2024-06-02"},
            "Total": {metric: {"Amount": amount, "Unit": "USD"}},
            "Groups": [],
            "Estimated": false
        }]
    })
}

fn groups(pairs: &[(&str, &str)], next: Option<&str>) -> serde_json::Value {
    let groups: Vec<_> = pairs
        .iter()
        .map(|(service, amount)| {
            json!({"Keys": [service], "Metrics": {"BlendedCost": {"Amount": amount, "Unit": "USD"}}})
        })
        .collect();
    let mut body = json!({
        "ResultsByTime": [{"TimePeriod": {}, "Total": {}, "Groups": groups, "Estimated": true}]
    });
    if let Some(next) = next {
        body["NextPageToken"] = json!(next);
    }
    body
}

fn value(measurements: &[Measurement], metric: &str, labels: &LabelSet) -> Option<f64> {
    measurements
        .iter()
        .find(|m| m.metric == metric && &m.labels == labels)
        .map(|m| m.value)
}

#[tokio::test]
async fn test_fetch_all_metrics() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/"))
        .and(header("x-amz-target", COST_AND_USAGE))
        .and(body_partial_json(json!({"NextPageToken": "page-2"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(groups(&[("AWS Lambda", "0.5")], None)))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/"))
        .and(header("x-amz-target", COST_AND_USAGE))
        .and(body_partial_json(json!({"GroupBy": [{"Type": "DIMENSION", "Key": "SERVICE"}]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(groups(
            &[("Amazon Simple Storage Service", "1.25"), ("Amazon EC2", "7")],
            Some("page-2"),
        )))
        .with_priority(2)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/"))
        .and(header("x-amz-target", COST_AND_USAGE))
        .and(body_partial_json(json!({"Metrics": ["UnblendedCost"], "Granularity": "MONTHLY"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(total("UnblendedCost", "321.5")))
        .with_priority(3)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/"))
        .and(header("x-amz-target", COST_AND_USAGE))
        .and(body_partial_json(json!({"Metrics": ["BlendedCost"], "Granularity": "DAILY"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(total("BlendedCost", "11.11")))
        .with_priority(5)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/"))
        .and(header("x-amz-target", FORECAST))
        .and(header("content-type", "application/x-amz-json-1.1"))
        .and(header("x-amz-security-token", "session"))
        .and(header_exists("authorization"))
        .and(header_exists("x-amz-date"))
        .and(body_partial_json(json!({"Metric": "UNBLENDED_COST"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"Total": {"Amount": "987.65", "Unit": "USD"}})),
        )
        .mount(&server)
        .await;

    let measurements = provider(&server, AwsMetricToggles::default())
        .fetch()
        .await
        .unwrap();

    let none = LabelSet::new();
    assert_eq!(value(&measurements, "aws_today_daily_costs", &none), Some(11.11));
    assert_eq!(value(&measurements, "aws_yesterday_daily_costs", &none), Some(11.11));
    assert_eq!(value(&measurements, "aws_month_to_date_costs", &none), Some(321.5));
    assert_eq!(value(&measurements, "aws_month_forecasted_costs", &none), Some(987.65));

    let by_service = |service: &str| {
        value(
            &measurements,
            "aws_yesterday_costs_by_service",
            &LabelSet::from([("aws_service", service)]),
        )
    };
    assert_eq!(by_service("Amazon Simple Storage Service"), Some(1.25));
    assert_eq!(by_service("Amazon EC2"), Some(7.0));
    assert_eq!(by_service("AWS Lambda"), Some(0.5));
    assert_eq!(measurements.len(), 7);
}

#[tokio::test]
async fn test_disabled_toggles_skip_requests() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/"))
        .and(header("x-amz-target", FORECAST))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"Total": {"Amount": "5", "Unit": "USD"}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(header("x-amz-target", COST_AND_USAGE))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let toggles = AwsMetricToggles {
        today: false,
        yesterday: false,
        yesterday_by_service: false,
        month_to_date: false,
        month_forecast: true,
    };
    let measurements = provider(&server, toggles).fetch().await.unwrap();
    assert_eq!(measurements, vec![Measurement::new("aws_month_forecasted_costs", 5.0)]);
}

#[tokio::test]
async fn test_fetch_surfaces_failing_query() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(header("x-amz-target", COST_AND_USAGE))
        .respond_with(ResponseTemplate::new(200).set_body_json(total("BlendedCost", "1")))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(header("x-amz-target", FORECAST))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "__type": "com.amazonaws.ce#DataUnavailableException",
            "Message": "Insufficient amount of historical data"
        })))
        .mount(&server)
        .await;

    let toggles = AwsMetricToggles {
        yesterday_by_service: false,
        month_to_date: false,
        ..AwsMetricToggles::default()
    };
    match provider(&server, toggles).fetch().await {
        Err(CostProviderError::Api { status, message }) => {
            assert_eq!(status, 400);
            assert_eq!(message, "Insufficient amount of historical data");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_failing_forecast_does_not_hold_back_other_metrics() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(header("x-amz-target", COST_AND_USAGE))
        .respond_with(ResponseTemplate::new(200).set_body_json(total("BlendedCost", "42")))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(header("x-amz-target", FORECAST))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "__type": "com.amazonaws.ce#DataUnavailableException",
            "Message": "Insufficient amount of historical data"
        })))
        .mount(&server)
        .await;

    let toggles = AwsMetricToggles {
        yesterday: false,
        yesterday_by_service: false,
        month_to_date: false,
        ..AwsMetricToggles::default()
    };
    let provider = provider(&server, toggles);
    let registry = MetricRegistry::new();
    for descriptor in provider.metrics() {
        registry.register(descriptor).unwrap();
    }
    let none = LabelSet::new();
    registry
        .reconcile(
            "aws_today_daily_costs",
            &[Measurement::new("aws_today_daily_costs", 1.0)],
        )
        .unwrap();
    registry
        .reconcile(
            "aws_month_forecasted_costs",
            &[Measurement::new("aws_month_forecasted_costs", 900.0)],
        )
        .unwrap();

    assert_eq!(
        poll_provider(&provider, &registry).await,
        PollOutcome::Partial {
            metrics: 1,
            failed: 1
        }
    );

    let snapshot = registry.read_all();
    assert_eq!(snapshot.value("aws_today_daily_costs", &none), Some(42.0));
    assert_eq!(snapshot.value("aws_month_forecasted_costs", &none), Some(900.0));
}

#[tokio::test]
async fn test_every_query_failing_fails_the_poll() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "__type": "InternalServerException",
            "Message": "try again"
        })))
        .mount(&server)
        .await;

    let provider = provider(&server, AwsMetricToggles::default());
    let registry = MetricRegistry::new();
    assert_eq!(poll_provider(&provider, &registry).await, PollOutcome::Failed);
    assert!(registry.read_all().families.is_empty());
}

#[tokio::test]
async fn test_throttling_is_rate_limited() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "__type": "com.amazonaws.ce#ThrottlingException",
            "Message": "Rate exceeded"
        })))
        .mount(&server)
        .await;

    let result = provider(&server, AwsMetricToggles::default()).fetch().await;
    assert!(matches!(result, Err(CostProviderError::RateLimited(ref m)) if m == "Rate exceeded"));
}

#[tokio::test]
async fn test_access_denied_is_auth_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "__type": "AccessDeniedException",
            "Message": "User is not authorized to perform: ce:GetCostAndUsage"
        })))
        .mount(&server)
        .await;

    let result = provider(&server, AwsMetricToggles::default()).fetch().await;
    assert!(matches!(result, Err(CostProviderError::Auth(_))));
}

#[tokio::test]
async fn test_missing_results_is_malformed() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ResultsByTime": []})))
        .mount(&server)
        .await;

    let toggles = AwsMetricToggles {
        today: true,
        yesterday: false,
        yesterday_by_service: false,
        month_to_date: false,
        month_forecast: false,
    };
    let result = provider(&server, toggles).fetch().await;
    assert!(matches!(result, Err(CostProviderError::Malformed(_))));
}
