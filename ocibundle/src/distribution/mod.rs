//! Talk to OCI registries based on the [OCI distribution specification](https://github.com/opencontainers/distribution-spec)

mod auth;
mod client;

pub use auth::{Credential, Keychain};
pub use client::Client;
