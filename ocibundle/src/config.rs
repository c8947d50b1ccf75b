//! Tunables shared by the registry gateways and the copy engine.

use crate::error::{Error, Result};
use std::time::Duration;

/// Number of workers the resolver and copier share by default.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Options for talking to registries.
#[derive(Debug, Clone)]
pub struct RegistryOpts {
    /// How long to wait for a server to start responding before the
    /// request fails with a `timeout awaiting response headers` error.
    pub response_header_timeout: Duration,
    /// Bounded worker count for resolve and copy tasks.
    pub concurrency: usize,
}

impl Default for RegistryOpts {
    fn default() -> Self {
        RegistryOpts {
            response_header_timeout: Duration::from_secs(30),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

/// Parse durations of the form `30s`, `1500ms`, `2m` used by CLI
/// flags such as `--registry-response-header-timeout`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    let err = || Error::InvalidDuration(input.to_string());
    let (number, unit) = input
        .find(|c: char| !c.is_ascii_digit())
        .map(|at| input.split_at(at))
        .ok_or_else(err)?;
    let number: u64 = number.parse().map_err(|_| err())?;
    match unit {
        "ms" => Ok(Duration::from_millis(number)),
        "s" => Ok(Duration::from_secs(number)),
        "m" => Ok(Duration::from_secs(number * 60)),
        _ => Err(err()),
    }
}
