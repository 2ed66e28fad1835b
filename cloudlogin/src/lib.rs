//! Log in to a secrets server with a cloud workload identity.
//!
//! The server never sees a long-lived secret: each login proves who the
//! workload is with a platform-signed attestation (a signed STS request, an
//! EC2 identity document, an Azure managed identity token, a Google-signed
//! JWT or a Cloud Foundry instance certificate) and exchanges it for a
//! session [`Token`].

pub mod attestation;
pub mod common;
pub mod credentials;
pub mod error;
pub mod facade;
pub mod login;
pub mod metadata;

pub use common::{AuthType, LoginConfig, LoginContext, SignatureType, Token};
pub use error::{LoginError, LoginResult};
pub use facade::{CloudAuth, CloudAuthBuilder};
pub use login::{DefaultLoginDispatcher, LoginDispatcher};
