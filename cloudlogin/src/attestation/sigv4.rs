//! AWS Signature Version 4 header signing.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::utf8_percent_encode;
use sha2::{Digest, Sha256};

use super::QUERY_ENCODE_SET;
use crate::credentials::Credential;
use crate::error::{LoginError, LoginResult};

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
pub const AMZ_DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// A request to be signed. Header names keep their display case; signing
/// lowercases them.
#[derive(Debug, Clone)]
pub struct SignableRequest {
    pub method: String,
    pub host: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl SignableRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn set_header(&mut self, name: &str, value: String) {
        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value));
    }
}

/// Scope the signature is bound to
#[derive(Debug, Clone, Copy)]
pub struct SigningScope<'a> {
    pub region: &'a str,
    pub service: &'a str,
    pub time: DateTime<Utc>,
}

impl SigningScope<'_> {
    fn amz_date(&self) -> String {
        self.time.format(AMZ_DATE_FORMAT).to_string()
    }

    fn date_stamp(&self) -> String {
        self.time.format("%Y%m%d").to_string()
    }

    fn credential_scope(&self) -> String {
        format!(
            "{}/{}/{}/aws4_request",
            self.date_stamp(),
            self.region,
            self.service
        )
    }
}

/// Add `X-Amz-Date`, the security token when present, and `Authorization`.
/// Every header already on the request, plus `host`, is signed.
pub fn sign(
    request: &mut SignableRequest,
    credential: &Credential,
    scope: SigningScope<'_>,
) -> LoginResult<()> {
    request.set_header("X-Amz-Date", scope.amz_date());
    if let Some(token) = &credential.session_token {
        request.set_header("X-Amz-Security-Token", token.clone());
    }

    let authorization = authorization(request, credential, scope)?;
    request.set_header("Authorization", authorization);
    Ok(())
}

/// Compute the `Authorization` value for a request carrying its `X-Amz-Date`
/// and any other headers to be signed.
pub fn authorization(
    request: &SignableRequest,
    credential: &Credential,
    scope: SigningScope<'_>,
) -> LoginResult<String> {
    let (canonical, signed_headers) = canonical_request(request);
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        scope.amz_date(),
        scope.credential_scope(),
        hex_sha256(canonical.as_bytes())
    );

    let key = signing_key(
        &credential.secret_access_key,
        &scope.date_stamp(),
        scope.region,
        scope.service,
    )?;
    let signature = hex::encode(hmac(&key, string_to_sign.as_bytes())?);

    Ok(format!(
        "{} Credential={}/{}, SignedHeaders={}, Signature={}",
        ALGORITHM,
        credential.access_key_id,
        scope.credential_scope(),
        signed_headers,
        signature
    ))
}

/// Canonical request and the `;`-joined signed header list
pub fn canonical_request(request: &SignableRequest) -> (String, String) {
    let mut headers: Vec<(String, String)> = request
        .headers
        .iter()
        .filter(|(name, _)| !name.eq_ignore_ascii_case("authorization"))
        .map(|(name, value)| (name.to_ascii_lowercase(), canonical_header_value(value)))
        .collect();
    if !headers.iter().any(|(name, _)| name == "host") {
        headers.push(("host".to_string(), request.host.clone()));
    }
    headers.sort();

    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    // Encode keys and values, then sort by encoded key and encoded value
    let enc = |s: &str| utf8_percent_encode(s, QUERY_ENCODE_SET).to_string();
    let mut query: Vec<(String, String)> = request
        .query
        .iter()
        .map(|(k, v)| (enc(k), enc(v)))
        .collect();
    query.sort();
    let canonical_query = query
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let path = if request.path.is_empty() { "/" } else { &request.path };

    let canonical = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        request.method,
        path,
        canonical_query,
        canonical_headers,
        signed_headers,
        hex_sha256(&request.body)
    );
    (canonical, signed_headers)
}

fn canonical_header_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Derive the signing key for a date, region and service
pub fn signing_key(secret: &str, date_stamp: &str, region: &str, service: &str) -> LoginResult<Vec<u8>> {
    let k_date = hmac(format!("AWS4{}", secret).as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac(&k_date, region.as_bytes())?;
    let k_service = hmac(&k_region, service.as_bytes())?;
    hmac(&k_service, b"aws4_request")
}

fn hmac(key: &[u8], data: &[u8]) -> LoginResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| {
        LoginError::attestation_caused("attestation/aws-iam", "sigv4 failed", e.to_string())
    })?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
