pub mod dispatcher;
pub mod request;

pub use dispatcher::{DefaultLoginDispatcher, LoginDispatcher};
pub use request::LoginRequest;
