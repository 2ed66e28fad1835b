use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::BTreeMap;

use crate::attestation::aws_iam::SERVER_ID_HEADER;
use crate::attestation::Attestation;
use crate::common::LoginConfig;
use crate::error::{LoginError, LoginResult};

/// Body and routing of a login call
#[derive(Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub mount_path: String,
    pub body: BTreeMap<String, String>,
    /// Extra headers for the outgoing POST
    pub headers: Vec<(String, String)>,
}

impl LoginRequest {
    /// Merge an attestation with the configured role and mount
    pub fn assemble(attestation: Attestation, config: &LoginConfig) -> LoginResult<Self> {
        let mut body = BTreeMap::new();
        let mut headers = Vec::new();

        if !config.role.is_empty() {
            body.insert("role".to_string(), config.role.clone());
        }

        match attestation {
            Attestation::IamRequest {
                method,
                url,
                body: request_body,
                headers: request_headers,
            } => {
                let encoded_headers = serde_json::to_vec(&request_headers).map_err(|e| {
                    LoginError::attestation_caused(
                        "login/assemble",
                        "failed to encode IAM request headers",
                        e,
                    )
                })?;
                body.insert("iam_http_request_method".to_string(), method);
                body.insert("iam_request_url".to_string(), STANDARD.encode(url));
                body.insert("iam_request_body".to_string(), STANDARD.encode(request_body));
                body.insert(
                    "iam_request_headers".to_string(),
                    STANDARD.encode(encoded_headers),
                );
                if let Some(server_id) = &config.iam_server_id_header {
                    headers.push((SERVER_ID_HEADER.to_string(), server_id.clone()));
                }
            }
            Attestation::Ec2Pkcs7 { pkcs7, nonce } => {
                body.insert("pkcs7".to_string(), pkcs7);
                body.insert("nonce".to_string(), nonce);
            }
            Attestation::Ec2Identity {
                identity,
                signature,
                nonce,
            } => {
                body.insert("identity".to_string(), identity);
                body.insert("signature".to_string(), signature);
                body.insert("nonce".to_string(), nonce);
            }
            Attestation::AzureJwt {
                access_token,
                vm_name,
                vmss_name,
                subscription_id,
                resource_group,
            } => {
                body.insert("jwt".to_string(), access_token);
                body.insert("vm_name".to_string(), vm_name);
                body.insert("vmss_name".to_string(), vmss_name);
                body.insert("subscription_id".to_string(), subscription_id);
                body.insert("resource_group_name".to_string(), resource_group);
            }
            Attestation::GcpJwt { signed_jwt } => {
                body.insert("jwt".to_string(), signed_jwt);
            }
            Attestation::PcfCert {
                cert_chain,
                signing_time,
                signature,
                ..
            } => {
                body.insert("cf_instance_cert".to_string(), cert_chain);
                body.insert("signing_time".to_string(), signing_time);
                body.insert("signature".to_string(), signature);
            }
        }

        Ok(Self {
            mount_path: config.mount_path().trim_matches('/').to_string(),
            body,
            headers,
        })
    }

    /// Server path the request is POSTed to
    pub fn path(&self) -> String {
        format!("/v1/auth/{}/login", self.mount_path)
    }
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("mount_path", &self.mount_path)
            .field("keys", &self.body.keys().collect::<Vec<_>>())
            .field("headers", &self.headers)
            .finish()
    }
}
