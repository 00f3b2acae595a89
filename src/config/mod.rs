use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ServerError;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_ARTIFACT_PATH: &str = ".pio/build/pixel_s3/firmware.bin";
pub const DEFAULT_ROUTE: &str = "/firmware.bin";
/// Subnet handed out by the master device's access point
pub const DEFAULT_HIGHLIGHT_PREFIX: &str = "192.168.4.";

/// Artifact server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: IpAddr,
    pub artifact_path: PathBuf,
    pub route: String,
    pub highlight_prefix: Option<String>,
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            artifact_path: PathBuf::from(DEFAULT_ARTIFACT_PATH),
            route: DEFAULT_ROUTE.to_string(),
            highlight_prefix: Some(DEFAULT_HIGHLIGHT_PREFIX.to_string()),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Config serving `artifact_path` on the default route
    #[cfg(test)]
    pub fn for_artifact(artifact_path: impl Into<PathBuf>) -> Self {
        Self {
            artifact_path: artifact_path.into(),
            ..Self::default()
        }
    }

    /// Returns a copy with the route normalized to a leading slash.
    pub fn validated(mut self) -> Result<Self, ServerError> {
        self.route = normalize_route(&self.route)?;
        Ok(self)
    }
}

/// Normalize a served route name into an absolute request path.
///
/// The route is matched literally, so characters the router reads as
/// captures or wildcards (`:`, `*`, braces) are rejected, as are empty
/// segments.
pub fn normalize_route(route: &str) -> Result<String, ServerError> {
    let invalid = || ServerError::InvalidRoute(route.to_string());

    let trimmed = route.trim().trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(invalid());
    }
    if trimmed.contains(|c: char| "?#:*{}".contains(c) || c.is_whitespace()) {
        return Err(invalid());
    }
    if trimmed.split('/').any(str::is_empty) {
        return Err(invalid());
    }
    Ok(format!("/{}", trimmed))
}
