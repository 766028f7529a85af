// src/config.rs

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("chunk size must be at least one byte")]
    ZeroChunkSize,
}

/// Settings shared by every download a registry creates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DownloadConfig {
    /// Directory new downloads are written into.
    pub download_dir: PathBuf,
    /// Upper bound for a single read/write in the fetch loop.
    pub chunk_size: usize,
    /// Bandwidth cap in bytes per second shared by all downloads. 0 = unlimited.
    pub speed_limit: u64,
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            chunk_size: 1024,
            speed_limit: 0,
            user_agent: concat!("dlmgr/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl DownloadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a JSON config file. Missing keys keep their defaults.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        Ok(())
    }

    #[must_use]
    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    #[must_use]
    pub const fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    #[must_use]
    pub const fn with_speed_limit(mut self, bytes_per_sec: u64) -> Self {
        self.speed_limit = bytes_per_sec;
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = DownloadConfig::default();
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.speed_limit, 0);
        assert_eq!(config.download_dir, PathBuf::from("."));
        assert!(config.user_agent.starts_with("dlmgr/"));
    }

    #[test]
    fn builder_pattern() {
        let config = DownloadConfig::new()
            .with_download_dir("/tmp/dl")
            .with_chunk_size(4096)
            .with_speed_limit(10_000)
            .with_user_agent("test-agent");

        assert_eq!(config.download_dir, PathBuf::from("/tmp/dl"));
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.speed_limit, 10_000);
        assert_eq!(config.user_agent, "test-agent");
    }

    #[tokio::test]
    async fn load_fills_missing_keys_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "chunk_size": 512, "download_dir": "/data" }}"#).unwrap();

        let config = DownloadConfig::load(file.path()).await.unwrap();
        assert_eq!(config.chunk_size, 512);
        assert_eq!(config.download_dir, PathBuf::from("/data"));
        assert_eq!(config.speed_limit, 0);
    }

    #[tokio::test]
    async fn load_rejects_zero_chunk_size() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "chunk_size": 0 }}"#).unwrap();

        let err = DownloadConfig::load(file.path()).await.unwrap_err();
        assert!(matches!(err, ConfigError::ZeroChunkSize));
    }

    #[tokio::test]
    async fn load_reports_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "chunk_size = 12").unwrap();

        let err = DownloadConfig::load(file.path()).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
