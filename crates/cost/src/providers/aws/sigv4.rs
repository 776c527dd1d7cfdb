//! AWS Signature Version 4 for JSON-RPC style POST requests.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::providers::CostProviderError;

type HmacSha256 = Hmac<Sha256>;

const SIGN_V4_ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Static AWS credentials.
#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("session_token", &self.session_token.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Headers to attach to a signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Signature {
    pub amz_date: String,
    pub authorization: String,
}

/// Signs one request.
pub(crate) struct Signer<'a> {
    pub credentials: &'a AwsCredentials,
    pub region: &'a str,
    pub service: &'a str,
}

impl Signer<'_> {
    /// Sign a POST to `/` with the given extra headers (lowercase names).
    ///
    /// `host`, `x-amz-date` and, when present, `x-amz-security-token` are
    /// added to the signed set automatically.
    pub fn sign_post(
        &self,
        host: &str,
        headers: &[(&str, &str)],
        body: &[u8],
        at: DateTime<Utc>,
    ) -> Result<Signature, CostProviderError> {
        let amz_date = at.format("%Y%m%dT%H%M%SZ").to_string();
        let date = at.format("%Y%m%d").to_string();

        let mut signed: Vec<(String, String)> = headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        signed.push(("host".to_string(), host.to_string()));
        signed.push(("x-amz-date".to_string(), amz_date.clone()));
        if let Some(token) = &self.credentials.session_token {
            signed.push(("x-amz-security-token".to_string(), token.clone()));
        }
        signed.sort();

        let canonical_headers: String = signed.iter().map(|(k, v)| format!("{k}:{v}\n")).collect();
        let signed_headers = signed
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_request = format!(
            "POST\n/\n\n{canonical_headers}\n{signed_headers}\n{}",
            hex::encode(Sha256::digest(body))
        );

        let scope = format!("{date}/{}/{}/aws4_request", self.region, self.service);
        let string_to_sign = format!(
            "{SIGN_V4_ALGORITHM}\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let key = signing_key(
            &self.credentials.secret_access_key,
            &date,
            self.region,
            self.service,
        )?;
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

        Ok(Signature {
            amz_date,
            authorization: format!(
                "{SIGN_V4_ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
                self.credentials.access_key_id
            ),
        })
    }
}

fn signing_key(
    secret: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, CostProviderError> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CostProviderError> {
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return Err(CostProviderError::Config("invalid signing key".to_string()));
    };
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}
