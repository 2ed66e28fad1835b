use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::debug;

use super::sigv4::{self, SignableRequest, SigningScope};
use super::Attestation;
use crate::common::env::{self, Env};
use crate::common::LoginConfig;
use crate::credentials::Credential;
use crate::error::LoginResult;

pub const GET_CALLER_IDENTITY_BODY: &str = "Action=GetCallerIdentity&Version=2011-06-15";
pub const SERVER_ID_HEADER: &str = "X-Vault-AWS-IAM-Server-ID";
const CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";
const GLOBAL_SIGNING_REGION: &str = "us-east-1";

/// Signing region: config, then `AWS_REGION`; `None` selects the global endpoint
pub fn resolve_region(config: &LoginConfig, env: &dyn Env) -> Option<String> {
    config
        .region
        .clone()
        .filter(|region| !region.is_empty())
        .or_else(|| env.non_empty(env::AWS_REGION))
}

/// STS host for a region
pub fn sts_host(region: Option<&str>) -> String {
    match region {
        Some(region) => format!("sts.{}.amazonaws.com", region),
        None => "sts.amazonaws.com".to_string(),
    }
}

/// Sign an STS `GetCallerIdentity` request the server can replay
pub fn build(
    credential: &Credential,
    region: Option<&str>,
    server_id: Option<&str>,
    now: DateTime<Utc>,
) -> LoginResult<Attestation> {
    let host = sts_host(region);
    let body = GET_CALLER_IDENTITY_BODY.as_bytes().to_vec();

    let mut headers = vec![
        ("Content-Length".to_string(), body.len().to_string()),
        ("Content-Type".to_string(), CONTENT_TYPE.to_string()),
        ("Host".to_string(), host.clone()),
    ];
    if let Some(server_id) = server_id {
        headers.push((SERVER_ID_HEADER.to_string(), server_id.to_string()));
    }

    let mut request = SignableRequest {
        method: "POST".to_string(),
        host: host.clone(),
        path: "/".to_string(),
        query: vec![],
        headers,
        body,
    };
    let scope = SigningScope {
        region: region.unwrap_or(GLOBAL_SIGNING_REGION),
        service: "sts",
        time: now,
    };
    sigv4::sign(&mut request, credential, scope)?;

    debug!("Signed GetCallerIdentity request for {}", host);

    // Host travels in the URL; the server rebuilds it from there.
    let mut header_map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in request
        .headers
        .into_iter()
        .filter(|(name, _)| !name.eq_ignore_ascii_case("host"))
    {
        header_map.entry(name).or_default().push(value);
    }

    Ok(Attestation::IamRequest {
        method: request.method,
        url: format!("https://{}/", host),
        body: GET_CALLER_IDENTITY_BODY.to_string(),
        headers: header_map,
    })
}
