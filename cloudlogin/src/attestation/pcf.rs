use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use chrono::{DateTime, Utc};
use ring::rand::SystemRandom;
use ring::signature::{RsaKeyPair, RSA_PSS_SHA256};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use tracing::debug;
use x509_parser::extensions::{GeneralName, ParsedExtension};

use super::Attestation;
use crate::common::env::{self, Env};
use crate::common::LoginContext;
use crate::error::{LoginError, LoginResult};

const STEP: &str = "attestation/pcf";

/// Layout the server parses signing times with
pub const SIGNING_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Identity claims carried by a CF instance certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    pub instance_id: String,
    pub org_id: String,
    pub space_id: String,
    pub app_id: String,
    pub ip: IpAddr,
}

/// Parse the leaf of a PEM certificate chain
pub fn parse_instance_certificate(chain_pem: &str) -> LoginResult<InstanceIdentity> {
    let blocks = pem::parse_many(chain_pem)
        .map_err(|e| LoginError::attestation_caused(STEP, "failed to parse instance certificate PEM", e))?;
    let leaf = blocks
        .iter()
        .find(|block| block.tag() == "CERTIFICATE")
        .ok_or_else(|| LoginError::attestation(STEP, "instance certificate file has no certificate"))?;

    let (_, cert) = x509_parser::parse_x509_certificate(leaf.contents()).map_err(|e| {
        LoginError::attestation(STEP, format!("failed to parse instance certificate: {}", e))
    })?;

    let subject = cert.subject();
    let instance_id = subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
        .ok_or_else(|| LoginError::attestation(STEP, "instance certificate has no common name"))?;

    let mut org_id = None;
    let mut space_id = None;
    let mut app_id = None;
    for unit in subject.iter_organizational_unit() {
        let Ok(unit) = unit.as_str() else { continue };
        if let Some(id) = unit.strip_prefix("organization:") {
            org_id = Some(id.to_string());
        } else if let Some(id) = unit.strip_prefix("space:") {
            space_id = Some(id.to_string());
        } else if let Some(id) = unit.strip_prefix("app:") {
            app_id = Some(id.to_string());
        }
    }

    let mut ip = None;
    for ext in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                if let GeneralName::IPAddress(bytes) = name {
                    ip = ip_from_bytes(bytes);
                    if ip.is_some() {
                        break;
                    }
                }
            }
        }
    }

    let missing = |what: &str| LoginError::attestation(STEP, format!("instance certificate has no {}", what));
    Ok(InstanceIdentity {
        instance_id,
        org_id: org_id.ok_or_else(|| missing("organization OU"))?,
        space_id: space_id.ok_or_else(|| missing("space OU"))?,
        app_id: app_id.ok_or_else(|| missing("app OU"))?,
        ip: ip.ok_or_else(|| missing("IP address SAN"))?,
    })
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Bytes covered by the signature
pub fn signing_payload(signing_time: &str, cert_pem: &str, role: &str) -> Vec<u8> {
    format!("{}{}{}", signing_time, cert_pem, role).into_bytes()
}

fn load_key_pair(key_pem: &str) -> LoginResult<RsaKeyPair> {
    let block = pem::parse(key_pem)
        .map_err(|e| LoginError::attestation_caused(STEP, "failed to parse instance key PEM", e))?;

    let parsed = match block.tag() {
        "RSA PRIVATE KEY" => RsaKeyPair::from_der(block.contents()),
        "PRIVATE KEY" => RsaKeyPair::from_pkcs8(block.contents()),
        other => {
            return Err(LoginError::attestation(
                STEP,
                format!("unsupported instance key type {:?}", other),
            ))
        }
    };
    parsed.map_err(|e| LoginError::attestation_caused(STEP, "instance key rejected", e.to_string()))
}

/// RSA-PSS-SHA256 signature over the signing payload, base64url encoded
pub fn sign(key_pem: &str, signing_time: &str, cert_pem: &str, role: &str) -> LoginResult<String> {
    let key_pair = load_key_pair(key_pem)?;
    let payload = signing_payload(signing_time, cert_pem, role);

    let mut signature = vec![0; key_pair.public().modulus_len()];
    key_pair
        .sign(&RSA_PSS_SHA256, &SystemRandom::new(), &payload, &mut signature)
        .map_err(|_| LoginError::attestation(STEP, "failed to sign with instance key"))?;

    Ok(URL_SAFE.encode(signature))
}

async fn read_file(ctx: &LoginContext, env: &dyn Env, var: &str) -> LoginResult<(PathBuf, String)> {
    let path = env
        .non_empty(var)
        .map(PathBuf::from)
        .ok_or_else(|| LoginError::credential_unavailable(STEP, format!("{} is not set", var)))?;
    let contents = ctx
        .run(tokio::fs::read_to_string(&path))
        .await?
        .map_err(|e| {
            LoginError::attestation_caused(STEP, format!("failed to read {}", path.display()), e)
        })?;
    Ok((path, contents))
}

/// Instance certificate attestation signed at `now`
pub async fn build(
    ctx: &LoginContext,
    env: &dyn Env,
    role: &str,
    now: DateTime<Utc>,
) -> LoginResult<Attestation> {
    let (cert_path, cert_chain) = read_file(ctx, env, env::CF_INSTANCE_CERT).await?;
    let (_, key_pem) = read_file(ctx, env, env::CF_INSTANCE_KEY).await?;

    let identity = parse_instance_certificate(&cert_chain)?;
    debug!(
        "Loaded instance certificate {} for instance {}",
        cert_path.display(),
        identity.instance_id
    );

    let signing_time = now.format(SIGNING_TIME_FORMAT).to_string();
    let signature = sign(&key_pem, &signing_time, &cert_chain, role)?;

    Ok(Attestation::PcfCert {
        instance_id: identity.instance_id,
        org_id: identity.org_id,
        space_id: identity.space_id,
        app_id: identity.app_id,
        ip: identity.ip.to_string(),
        cert_chain,
        signature,
        signing_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::StaticEnv;
    use chrono::TimeZone;
    use ring::signature::{UnparsedPublicKey, RSA_PSS_2048_8192_SHA256};

    const CERT: &str = include_str!("../../tests/fixtures/instance.crt");
    const PKCS8_KEY: &str = include_str!("../../tests/fixtures/instance.key");
    const RSA_KEY: &str = include_str!("../../tests/fixtures/instance-rsa.key");

    fn fixture(name: &str) -> String {
        format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name)
    }

    fn verify(signature_b64: &str, payload: &[u8]) -> bool {
        let block = pem::parse(CERT).unwrap();
        let (_, cert) = x509_parser::parse_x509_certificate(block.contents()).unwrap();
        let public_key = &*cert.public_key().subject_public_key.data;
        let signature = URL_SAFE.decode(signature_b64).unwrap();
        UnparsedPublicKey::new(&RSA_PSS_2048_8192_SHA256, public_key)
            .verify(payload, &signature)
            .is_ok()
    }

    #[test]
    fn test_parse_instance_certificate() {
        let identity = parse_instance_certificate(CERT).unwrap();
        assert_eq!(identity.instance_id, "1bf2e7f6-2d1d-41ec-501c-c70d");
        assert_eq!(identity.org_id, "34a878d0-c2f9-4521-ba73-a9f664e82c7bf");
        assert_eq!(identity.space_id, "3d2eba6b-ef19-44d5-91dd-1975b0db5cc9");
        assert_eq!(identity.app_id, "2d3e834a-3a25-4591-974c-fa5626d5d0a1");
        assert_eq!(identity.ip, "10.255.181.105".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_both_key_encodings_sign() {
        let time = "2024-05-17T09:30:00Z";
        for key in [PKCS8_KEY, RSA_KEY] {
            let signature = sign(key, time, CERT, "dev").unwrap();
            assert!(verify(&signature, &signing_payload(time, CERT, "dev")));
            assert!(!verify(&signature, &signing_payload(time, CERT, "other")));
        }
    }

    #[tokio::test]
    async fn test_build_from_environment() {
        let env = StaticEnv::new()
            .with(env::CF_INSTANCE_CERT, fixture("instance.crt"))
            .with(env::CF_INSTANCE_KEY, fixture("instance.key"));
        let now = Utc.with_ymd_and_hms(2024, 5, 17, 9, 30, 0).unwrap();

        let attestation = build(&LoginContext::new(), &env, "dev", now).await.unwrap();
        match attestation {
            Attestation::PcfCert {
                instance_id,
                ip,
                cert_chain,
                signature,
                signing_time,
                ..
            } => {
                assert_eq!(instance_id, "1bf2e7f6-2d1d-41ec-501c-c70d");
                assert_eq!(ip, "10.255.181.105");
                assert_eq!(signing_time, "2024-05-17T09:30:00Z");
                assert_eq!(cert_chain, CERT);
                assert!(verify(&signature, &signing_payload(&signing_time, CERT, "dev")));
            }
            other => panic!("unexpected attestation: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_certificate_path() {
        let err = build(&LoginContext::new(), &StaticEnv::new(), "dev", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, LoginError::CredentialUnavailable { .. }));
        assert!(err.to_string().contains(env::CF_INSTANCE_CERT));
    }
}
