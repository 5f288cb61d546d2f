use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use oltalk_proto::wire::MAX_BINARY_LEN;

/// Server configuration, loaded from the JSON file named by `--config`.
///
/// `bind_host`, `port`, `data_dir` and `db_path` are required; the rest fall
/// back to defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub bind_host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_thread_pool_size")]
    pub thread_pool_size: u32,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default = "default_history_page_size")]
    pub history_page_size: u32,
    #[serde(default = "default_file_chunk_size")]
    pub file_chunk_size: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_thread_pool_size() -> u32 {
    4
}

fn default_max_clients() -> usize {
    1000
}

fn default_history_page_size() -> u32 {
    100
}

fn default_file_chunk_size() -> usize {
    65536
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to open config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            bail!("port must be in 1..65535");
        }
        if !matches!(self.log_level.as_str(), "debug" | "info" | "warn" | "error") {
            bail!("log_level must be one of debug, info, warn, error");
        }
        if self.thread_pool_size == 0 {
            bail!("thread_pool_size must be positive");
        }
        if self.max_clients == 0 {
            bail!("max_clients must be positive");
        }
        if self.history_page_size == 0 {
            bail!("history_page_size must be positive");
        }
        if self.file_chunk_size == 0 {
            bail!("file_chunk_size must be positive");
        }
        if self.file_chunk_size > MAX_BINARY_LEN {
            bail!("file_chunk_size exceeds the wire binary cap");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<ServerConfig> {
        let config: ServerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse(
            r#"{"bind_host":"127.0.0.1","port":9000,
                "data_dir":"/tmp/oltalk","db_path":"/tmp/oltalk/server.db"}"#,
        )
        .unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.thread_pool_size, 4);
        assert_eq!(config.max_clients, 1000);
        assert_eq!(config.history_page_size, 100);
        assert_eq!(config.file_chunk_size, 65536);
    }

    #[test]
    fn missing_required_key_fails() {
        assert!(parse(r#"{"bind_host":"127.0.0.1","port":9000}"#).is_err());
    }

    #[test]
    fn zero_port_rejected() {
        let err = parse(
            r#"{"bind_host":"127.0.0.1","port":0,
                "data_dir":"/tmp/x","db_path":"/tmp/x/db"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn bad_log_level_rejected() {
        let err = parse(
            r#"{"bind_host":"127.0.0.1","port":9000,
                "data_dir":"/tmp/x","db_path":"/tmp/x/db","log_level":"verbose"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("log_level"));
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let err = parse(
            r#"{"bind_host":"127.0.0.1","port":9000,
                "data_dir":"/tmp/x","db_path":"/tmp/x/db","file_chunk_size":0}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("file_chunk_size"));
    }
}
