//! OAuth access tokens for BigQuery.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::providers::http::read_json;
use crate::providers::CostProviderError;

const BIGQUERY_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery.readonly";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Tokens are refreshed this long before they expire.
const REFRESH_MARGIN_SECS: i64 = 60;

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// The fields of a service-account key file we use.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl ServiceAccountKey {
    /// Parse the JSON content of a key file.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or lacks required fields.
    pub fn from_json(json: &str) -> Result<Self, CostProviderError> {
        serde_json::from_str(json)
            .map_err(|e| CostProviderError::Config(format!("invalid service account key: {e}")))
    }
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key", &"***")
            .field("project_id", &self.project_id)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

/// Where access tokens come from.
#[derive(Clone)]
pub enum TokenSource {
    /// Signed JWT exchanged at the key's token endpoint.
    ServiceAccount(ServiceAccountKey),
    /// Pre-minted token used verbatim.
    Static(String),
}

impl std::fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ServiceAccount(key) => f.debug_tuple("ServiceAccount").field(key).finish(),
            Self::Static(_) => f.debug_tuple("Static").field(&"***").finish(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Hands out access tokens, caching exchanged ones until shortly before expiry.
#[derive(Debug)]
pub(crate) struct TokenProvider {
    source: TokenSource,
    client: Client,
    cache: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(source: TokenSource, client: Client) -> Self {
        Self {
            source,
            client,
            cache: Mutex::new(None),
        }
    }

    /// A valid access token.
    pub async fn token(&self) -> Result<String, CostProviderError> {
        let key = match &self.source {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::ServiceAccount(key) => key,
        };

        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.expires_at - Duration::seconds(REFRESH_MARGIN_SECS) > Utc::now() {
                return Ok(cached.token.clone());
            }
        }

        let fresh = self.exchange(key).await?;
        let token = fresh.token.clone();
        *cache = Some(fresh);
        Ok(token)
    }

    #[instrument(skip_all, fields(provider = "gcp", client_email = %key.client_email))]
    async fn exchange(&self, key: &ServiceAccountKey) -> Result<CachedToken, CostProviderError> {
        let now = Utc::now();
        let assertion = sign_assertion(key, now)?;

        debug!(token_uri = %key.token_uri, "Exchanging service account assertion");
        let response = self
            .client
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", &assertion)])
            .send()
            .await?;
        let body: TokenResponse = read_json(response, "gcp").await?;

        Ok(CachedToken {
            token: body.access_token,
            expires_at: token_expiry(now, body.expires_in)?,
        })
    }
}

fn token_expiry(now: DateTime<Utc>, expires_in: Option<i64>) -> Result<DateTime<Utc>, CostProviderError> {
    let secs = expires_in.unwrap_or(ASSERTION_LIFETIME_SECS);
    let invalid = || CostProviderError::Malformed(format!("token expires_in {secs} is out of range"));
    if secs < 0 {
        return Err(invalid());
    }
    Duration::try_seconds(secs)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(invalid)
}

fn sign_assertion(key: &ServiceAccountKey, now: DateTime<Utc>) -> Result<String, CostProviderError> {
    let claims = Claims {
        iss: &key.client_email,
        scope: BIGQUERY_READONLY_SCOPE,
        aud: &key.token_uri,
        iat: now.timestamp(),
        exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
    };
    let mut header = Header::new(Algorithm::RS256);
    header.kid.clone_from(&key.private_key_id);

    let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
        .map_err(|e| CostProviderError::Auth(format!("invalid service account private key: {e}")))?;
    jsonwebtoken::encode(&header, &claims, &encoding_key)
        .map_err(|e| CostProviderError::Auth(format!("failed to sign assertion: {e}")))
}
