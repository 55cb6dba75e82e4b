//! Authentication for the server dispatcher.

pub mod auth;

pub use auth::{AUTH_PARAM_KEY, AuthPolicy, CredentialValidator, StaticTokenValidator};
