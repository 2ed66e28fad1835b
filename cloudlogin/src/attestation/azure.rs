use serde::Deserialize;

use super::Attestation;
use crate::common::LoginContext;
use crate::credentials::azure::API_VERSION;
use crate::credentials::Credential;
use crate::error::LoginResult;
use crate::metadata::{MetadataClient, MetadataProvider, MetadataRequest};

#[derive(Debug, Deserialize)]
struct InstanceMetadata {
    compute: Compute,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Compute {
    #[serde(default)]
    name: String,
    #[serde(default)]
    vm_scale_set_name: String,
    #[serde(default)]
    subscription_id: String,
    #[serde(default)]
    resource_group_name: String,
}

/// Managed identity token plus the VM coordinates the server checks it against
pub async fn build(
    token: &Credential,
    client: &dyn MetadataClient,
    ctx: &LoginContext,
) -> LoginResult<Attestation> {
    let instance: InstanceMetadata = client
        .send(
            ctx,
            MetadataRequest::get(
                MetadataProvider::Azure,
                format!("/metadata/instance?api-version={}", API_VERSION),
            ),
        )
        .await?
        .json("metadata/azure")?;

    let compute = instance.compute;
    Ok(Attestation::AzureJwt {
        access_token: token.bearer_token().to_string(),
        vm_name: compute.name,
        vmss_name: compute.vm_scale_set_name,
        subscription_id: compute.subscription_id,
        resource_group: compute.resource_group_name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{DefaultMetadataClient, MetadataEndpoints};
    use std::time::Duration;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_scale_set_instance() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/metadata/instance"))
            .and(query_param("api-version", API_VERSION))
            .and(header("Metadata", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "compute": {
                    "name": "vmss_1",
                    "vmScaleSetName": "vmss",
                    "subscriptionId": "s1",
                    "resourceGroupName": "rg1",
                    "location": "westeurope"
                },
                "network": {}
            })))
            .mount(&server)
            .await;

        let client = DefaultMetadataClient::new(MetadataEndpoints::all(server.uri()), Duration::from_secs(2));
        let token = Credential::bearer("system-assigned", "eyJ.token", "managed-identity");
        let attestation = build(&token, &client, &LoginContext::new()).await.unwrap();
        match attestation {
            Attestation::AzureJwt {
                access_token,
                vm_name,
                vmss_name,
                subscription_id,
                resource_group,
            } => {
                assert_eq!(access_token, "eyJ.token");
                assert_eq!(vm_name, "vmss_1");
                assert_eq!(vmss_name, "vmss");
                assert_eq!(subscription_id, "s1");
                assert_eq!(resource_group, "rg1");
            }
            other => panic!("unexpected attestation: {:?}", other),
        }
    }
}
