use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;

use super::Attestation;
use crate::common::{LoginContext, SignatureType};
use crate::error::LoginResult;
use crate::metadata::{ImdsSession, MetadataClient};

pub const PKCS7_PATH: &str = "/latest/dynamic/instance-identity/pkcs7";
pub const DOCUMENT_PATH: &str = "/latest/dynamic/instance-identity/document";
pub const SIGNATURE_PATH: &str = "/latest/dynamic/instance-identity/signature";

/// Instance identity proof from IMDS, bound to `nonce`
pub async fn build(
    client: &dyn MetadataClient,
    ctx: &LoginContext,
    signature_type: SignatureType,
    nonce: &str,
) -> LoginResult<Attestation> {
    let session = ImdsSession::open(client, ctx).await?;

    match signature_type {
        SignatureType::Pkcs7 => {
            let pkcs7 = session.get_text(ctx, PKCS7_PATH).await?;
            debug!("Fetched PKCS#7 instance identity ({} bytes)", pkcs7.len());
            Ok(Attestation::Ec2Pkcs7 {
                pkcs7,
                nonce: nonce.to_string(),
            })
        }
        SignatureType::Identity => {
            let document = session.get(ctx, DOCUMENT_PATH).await?;
            let signature = session.get_text(ctx, SIGNATURE_PATH).await?;
            Ok(Attestation::Ec2Identity {
                identity: STANDARD.encode(&document.body),
                signature,
                nonce: nonce.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{DefaultMetadataClient, MetadataEndpoints};
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn imds() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/latest/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("tok"))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_pkcs7_is_trimmed() {
        let server = imds().await;
        Mock::given(method("GET"))
            .and(path(PKCS7_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("\nMIIC...pkcs7...\n"))
            .mount(&server)
            .await;

        let client = DefaultMetadataClient::new(MetadataEndpoints::all(server.uri()), Duration::from_secs(2));
        let attestation = build(&client, &LoginContext::new(), SignatureType::Pkcs7, "n-1")
            .await
            .unwrap();
        match attestation {
            Attestation::Ec2Pkcs7 { pkcs7, nonce } => {
                assert_eq!(pkcs7, "MIIC...pkcs7...");
                assert_eq!(nonce, "n-1");
            }
            other => panic!("unexpected attestation: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_identity_document_is_base64() {
        let server = imds().await;
        let document = r#"{"instanceId":"i-1","region":"us-east-1"}"#;
        Mock::given(method("GET"))
            .and(path(DOCUMENT_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string(document))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(SIGNATURE_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("c2lnbmF0dXJl"))
            .mount(&server)
            .await;

        let client = DefaultMetadataClient::new(MetadataEndpoints::all(server.uri()), Duration::from_secs(2));
        let attestation = build(&client, &LoginContext::new(), SignatureType::Identity, "n-2")
            .await
            .unwrap();
        match attestation {
            Attestation::Ec2Identity {
                identity,
                signature,
                nonce,
            } => {
                assert_eq!(STANDARD.decode(identity).unwrap(), document.as_bytes());
                assert_eq!(signature, "c2lnbmF0dXJl");
                assert_eq!(nonce, "n-2");
            }
            other => panic!("unexpected attestation: {:?}", other),
        }
    }
}
