//! HTTP plumbing shared by the vendor clients.

use std::time::Duration;

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::warn;

use super::CostProviderError;

/// Upper bound for any single vendor request.
pub(crate) const DEFAULT_TIMEOUT_SECS: u64 = 30;

const USER_AGENT: &str = concat!("cost-exporter/", env!("CARGO_PKG_VERSION"));

/// Build the HTTP client every provider uses.
pub(crate) fn build_client() -> Result<Client, CostProviderError> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
        .build()
        .map_err(CostProviderError::Http)
}

/// Turn a response into `T`, mapping non-success statuses to errors.
pub(crate) async fn read_json<T>(response: Response, provider: &str) -> Result<T, CostProviderError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(CostProviderError::from_vendor(
            status,
            error_code(&body).as_deref(),
            error_message(&body),
        ));
    }

    serde_json::from_str(&body).map_err(|e| {
        warn!(
            provider,
            error = %e,
            body = %truncate(&body, 512),
            "Failed to parse response"
        );
        CostProviderError::Serialization(e)
    })
}

/// Pull a human readable message out of a vendor error body.
///
/// Understands `{"message": ..}`, `{"Message": ..}` and
/// `{"error": {"message": ..}}`; anything else is returned as-is.
fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let candidates = [
            value.get("message"),
            value.get("Message"),
            value.get("error").and_then(|e| e.get("message")),
            value.get("error_description"),
            value.get("error"),
        ];
        if let Some(message) = candidates.into_iter().flatten().find_map(|v| v.as_str()) {
            return message.to_string();
        }
    }
    truncate(body, 512).to_string()
}

/// Machine readable error code of a vendor error body, if any.
///
/// AWS JSON protocols send `{"__type": "prefix#Code"}`; Google APIs send
/// `{"error": {"status": "CODE"}}`.
fn error_code(body: &str) -> Option<String> {
    let value = serde_json::from_str::<serde_json::Value>(body).ok()?;
    let code = value
        .get("__type")
        .or_else(|| value.get("error").and_then(|e| e.get("status")))?
        .as_str()?;
    Some(code.rsplit('#').next().unwrap_or(code).to_string())
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
