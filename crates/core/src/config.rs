//! Runtime configuration for a migration run.
//!
//! Configuration is resolved once at process startup and passed into the
//! engines, rather than read from the environment during processing. The CLI
//! is responsible for populating it (from env vars or flags); the core never
//! touches `std::env`.

use crate::error::{SyncError, SyncResult};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Connection details for one EMR server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    base_url: String,
    username: String,
    password: String,
}

impl ServerConfig {
    pub fn new(base_url: String, username: String, password: String) -> SyncResult<Self> {
        if base_url.trim().is_empty() {
            return Err(SyncError::InvalidInput("base_url cannot be empty".into()));
        }
        if username.trim().is_empty() {
            return Err(SyncError::InvalidInput("username cannot be empty".into()));
        }
        Ok(Self {
            // trailing slashes would double up when joining endpoint paths
            base_url: base_url.trim_end_matches('/').to_string(),
            username,
            password,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

/// Full configuration for one migration run, resolved at startup.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    source: ServerConfig,
    target: ServerConfig,
    work_dir: PathBuf,
    batch_size: usize,
    request_timeout: Duration,
    order_number_prefix: Option<String>,
    haiti_2016_dst_correction: bool,
}

impl SyncConfig {
    pub fn new(
        source: ServerConfig,
        target: ServerConfig,
        work_dir: PathBuf,
        batch_size: usize,
    ) -> Self {
        Self {
            source,
            target,
            work_dir,
            batch_size: batch_size.max(1),
            request_timeout: Duration::from_secs(120),
            order_number_prefix: None,
            haiti_2016_dst_correction: false,
        }
    }

    /// Prefix applied to order numbers when exporting from the source side,
    /// so that migrated order numbers cannot collide with numbers the target
    /// generates itself.
    pub fn with_order_number_prefix(mut self, prefix: Option<String>) -> Self {
        self.order_number_prefix = prefix.filter(|p| !p.trim().is_empty());
        self
    }

    /// Enable the Haiti 2016 daylight-saving correction during verification.
    pub fn with_haiti_2016_dst_correction(mut self, enabled: bool) -> Self {
        self.haiti_2016_dst_correction = enabled;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn source(&self) -> &ServerConfig {
        &self.source
    }

    pub fn target(&self) -> &ServerConfig {
        &self.target
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn order_number_prefix(&self) -> Option<&str> {
        self.order_number_prefix.as_deref()
    }

    pub fn haiti_2016_dst_correction(&self) -> bool {
        self.haiti_2016_dst_correction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(url: &str) -> ServerConfig {
        ServerConfig::new(url.into(), "admin".into(), "secret".into()).unwrap()
    }

    #[test]
    fn test_trailing_slash_stripped_from_base_url() {
        let server = server("https://emr.example.org/openmrs/");
        assert_eq!(server.base_url(), "https://emr.example.org/openmrs");
    }

    #[test]
    fn test_empty_base_url_rejected() {
        let result = ServerConfig::new("  ".into(), "admin".into(), "secret".into());
        assert!(matches!(result, Err(SyncError::InvalidInput(_))));
    }

    #[test]
    fn test_batch_size_clamped_to_at_least_one() {
        let config = SyncConfig::new(
            server("https://a.example.org"),
            server("https://b.example.org"),
            PathBuf::from("/tmp/work"),
            0,
        );
        assert_eq!(config.batch_size(), 1);
    }

    #[test]
    fn test_blank_order_number_prefix_treated_as_absent() {
        let config = SyncConfig::new(
            server("https://a.example.org"),
            server("https://b.example.org"),
            PathBuf::from("/tmp/work"),
            10,
        )
        .with_order_number_prefix(Some("  ".into()));
        assert_eq!(config.order_number_prefix(), None);
    }
}
