pub mod config;
pub mod context;
pub mod env;
pub mod types;

pub use config::{AuthType, KeyPairConfig, LoginConfig, SignatureType, YandexConfig};
pub use context::LoginContext;
pub use env::{Env, ProcessEnv, StaticEnv};
pub use types::Token;
