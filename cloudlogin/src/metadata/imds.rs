use tracing::{debug, warn};

use super::{MetadataClient, MetadataDocument, MetadataProvider, MetadataRequest};
use crate::common::LoginContext;
use crate::error::{LoginError, LoginResult};

const TOKEN_PATH: &str = "/latest/api/token";
const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const TOKEN_TTL_SECONDS: u32 = 21600;

/// A session against the EC2 instance metadata service.
///
/// Opening the session requests an IMDSv2 token. If the token endpoint fails
/// for any reason other than a 404 the session degrades to unauthenticated
/// IMDSv1 requests.
pub struct ImdsSession<'a> {
    client: &'a dyn MetadataClient,
    token: Option<String>,
}

impl<'a> ImdsSession<'a> {
    pub async fn open(client: &'a dyn MetadataClient, ctx: &LoginContext) -> LoginResult<Self> {
        let request = MetadataRequest::put(MetadataProvider::Aws, TOKEN_PATH)
            .header(TOKEN_TTL_HEADER, TOKEN_TTL_SECONDS.to_string());

        let token = match client.send(ctx, request).await {
            Ok(doc) => {
                debug!("Obtained IMDSv2 session token");
                Some(doc.text("metadata/aws")?)
            }
            Err(e) if e.is_interrupted() => return Err(e),
            Err(e @ LoginError::MetadataUnavailable {
                status: Some(404), ..
            }) => return Err(e),
            Err(e) => {
                warn!("IMDSv2 token request failed, falling back to IMDSv1: {}", e);
                None
            }
        };

        Ok(Self { client, token })
    }

    pub fn is_v2(&self) -> bool {
        self.token.is_some()
    }

    pub async fn get(&self, ctx: &LoginContext, path: &str) -> LoginResult<MetadataDocument> {
        let mut request = MetadataRequest::get(MetadataProvider::Aws, path);
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token.as_str());
        }
        self.client.send(ctx, request).await
    }

    /// GET a path and return its body as trimmed text
    pub async fn get_text(&self, ctx: &LoginContext, path: &str) -> LoginResult<String> {
        self.get(ctx, path).await?.text("metadata/aws")
    }
}
