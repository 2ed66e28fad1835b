use anyhow::{Context, Result};
use clap::Parser;
use cloudlogin::common::ProcessEnv;
use cloudlogin::credentials::{CloudProvider, CredentialResolver};
use cloudlogin::metadata::{DefaultMetadataClient, MetadataEndpoints};
use cloudlogin::{
    AuthType, CloudAuthBuilder, DefaultLoginDispatcher, LoginConfig, LoginContext, SignatureType,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug, Clone)]
pub struct LoginCommand {
    /// YAML login configuration; flags override its values
    #[arg(short, long, env = "CLOUDLOGIN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Secrets server address
    #[arg(short, long, env = "VAULT_ADDR", default_value = "https://127.0.0.1:8200")]
    pub address: String,

    /// Server namespace
    #[arg(long, env = "VAULT_NAMESPACE")]
    pub namespace: Option<String>,

    /// Login method (aws-iam, aws-ec2, azure, gcp-gce, gcp-iam, pcf)
    #[arg(long, env = "CLOUDLOGIN_AUTH_TYPE")]
    pub auth_type: Option<AuthType>,

    /// Role to log in against
    #[arg(short, long, env = "CLOUDLOGIN_ROLE")]
    pub role: Option<String>,

    /// Mount path of the auth backend
    #[arg(long, env = "CLOUDLOGIN_MOUNT_PATH")]
    pub mount_path: Option<String>,

    /// STS signing region (aws-iam)
    #[arg(long)]
    pub region: Option<String>,

    /// Token audience (azure)
    #[arg(long)]
    pub resource: Option<String>,

    /// Identity proof type: pkcs7 or identity (aws-ec2)
    #[arg(long)]
    pub signature_type: Option<SignatureType>,

    /// Reauthentication nonce (aws-ec2)
    #[arg(long, env = "CLOUDLOGIN_NONCE")]
    pub nonce: Option<String>,

    /// X-Vault-AWS-IAM-Server-ID header value (aws-iam)
    #[arg(long)]
    pub iam_server_id_header: Option<String>,

    /// Service account name or email (gcp)
    #[arg(long)]
    pub service_account: Option<String>,

    /// Signed JWT lifetime in minutes (gcp-iam)
    #[arg(long)]
    pub jwt_ttl_minutes: Option<u32>,

    /// Read AWS credentials from this shared credentials file
    #[arg(long)]
    pub shared_credentials_file: Option<PathBuf>,

    /// Timeout for each metadata request or RPC, in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Deadline for the whole login, in seconds
    #[arg(long, default_value = "60")]
    pub login_timeout: u64,

    /// Print only the client token instead of the full token JSON
    #[arg(long)]
    pub token_only: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct CredentialsCommand {
    /// Cloud to resolve credentials for (aws, azure, gcp, alicloud, tencent, yandex)
    pub provider: CloudProvider,

    /// YAML login configuration holding static credential settings
    #[arg(short, long, env = "CLOUDLOGIN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Timeout for each metadata request, in seconds
    #[arg(long, default_value = "5")]
    pub timeout: u64,
}

fn load_config(path: Option<&PathBuf>) -> Result<Option<LoginConfig>> {
    path.map(|path| {
        LoginConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))
    })
    .transpose()
}

/// Context cancelled on Ctrl-C and after `timeout`
fn interruptible_context(timeout: Duration) -> LoginContext {
    let ctx = LoginContext::with_timeout(timeout);
    let token = ctx.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling login");
            token.cancel();
        }
    });
    ctx
}

pub async fn login(args: LoginCommand) -> Result<()> {
    let mut builder = match load_config(args.config.as_ref())? {
        Some(config) => CloudAuthBuilder::from_config(config),
        None => CloudAuthBuilder::new(),
    };

    if let Some(auth_type) = args.auth_type {
        builder = builder.auth_type(auth_type);
    }
    if let Some(role) = args.role {
        builder = builder.role(role);
    }
    if let Some(mount_path) = args.mount_path {
        builder = builder.mount_path(mount_path);
    }
    if let Some(region) = args.region {
        builder = builder.region(region);
    }
    if let Some(resource) = args.resource {
        builder = builder.resource(resource);
    }
    if let Some(signature_type) = args.signature_type {
        builder = builder.signature_type(signature_type);
    }
    if let Some(nonce) = args.nonce {
        builder = builder.nonce(nonce);
    }
    if let Some(header) = args.iam_server_id_header {
        builder = builder.iam_server_id_header(header);
    }
    if let Some(service_account) = args.service_account {
        builder = builder.service_account(service_account);
    }
    if let Some(minutes) = args.jwt_ttl_minutes {
        builder = builder.jwt_ttl_minutes(minutes);
    }
    if let Some(path) = args.shared_credentials_file {
        builder = builder.shared_credentials_file(path);
    }
    if let Some(timeout) = args.timeout {
        builder = builder.timeout(Duration::from_secs(timeout));
    }

    let auth = builder.build().context("Invalid login configuration")?;

    let mut dispatcher = DefaultLoginDispatcher::new(&args.address)
        .with_timeout(auth.config().timeout());
    if let Some(namespace) = args.namespace {
        dispatcher = dispatcher.with_namespace(namespace);
    }

    info!(
        "Logging in to {} with {} (mount {})",
        args.address,
        auth.auth_type(),
        auth.config().mount_path()
    );

    let ctx = interruptible_context(Duration::from_secs(args.login_timeout));
    let token = auth.login(&ctx, &dispatcher).await?;

    if let Some(nonce) = auth.nonce().filter(|_| auth.auth_type() == AuthType::AwsEc2) {
        info!("EC2 nonce for reauthentication: {}", nonce);
    }

    if args.token_only {
        println!("{}", token.client_token);
    } else {
        println!("{}", serde_json::to_string_pretty(&token)?);
    }
    Ok(())
}

pub async fn credentials(args: CredentialsCommand) -> Result<()> {
    // Credential chains only read the per-cloud sections, not the auth type.
    let config = load_config(args.config.as_ref())?
        .unwrap_or_else(|| LoginConfig::new(AuthType::AwsIam));
    config.validate().context("Invalid credential configuration")?;

    let env = Arc::new(ProcessEnv);
    let metadata = Arc::new(DefaultMetadataClient::new(
        MetadataEndpoints::from_env(env.as_ref()),
        Duration::from_secs(args.timeout),
    ));
    let resolver = CredentialResolver::new(Arc::new(config), env, metadata);

    let chain = resolver.chain(args.provider)?;
    info!(
        "Resolving {} credentials (steps: {})",
        args.provider,
        chain.step_names().join(", ")
    );

    let ctx = interruptible_context(Duration::from_secs(args.timeout.saturating_mul(4).max(1)));
    let credential = chain.resolve(&ctx).await?;

    let report = serde_json::json!({
        "provider": args.provider.as_str(),
        "step": credential.provider,
        "identity": credential.access_key_id,
        "has_session_token": credential.session_token.is_some(),
        "expiration": credential.expiration.map(|expiration| expiration.to_rfc3339()),
        "labels": credential.labels,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
