use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Scanner ceiling: files above this many bytes are counted as skipped
/// without being opened for content.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 500 * 1024 * 1024;

/// Maximum allowed length for search queries (characters).
pub const MAX_SEARCH_QUERY_LENGTH: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub listen_addr: String,
    pub port: u16,
    pub data_dir: String,
    pub lm_studio_url: String,
    pub max_file_size_bytes: u64,
    pub llm_timeout_secs: u64,
    pub embed_batch_size: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let port: u16 = std::env::var("KR_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8742);

        let data_dir = std::env::var("KR_DATA_DIR").unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|d| d.join(".knowledge-refinery").to_string_lossy().to_string())
                .unwrap_or_else(|| ".knowledge-refinery".to_string())
        });

        let lm_studio_url = std::env::var("KR_LM_STUDIO_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:1234/v1".to_string());

        Self {
            listen_addr: format!("127.0.0.1:{}", port),
            port,
            data_dir,
            lm_studio_url,
            max_file_size_bytes: std::env::var("KR_MAX_FILE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_FILE_SIZE),
            llm_timeout_secs: std::env::var("KR_LLM_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
            embed_batch_size: std::env::var("KR_EMBED_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(32),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("refinery.db")
    }

    pub fn pid_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("daemon.pid")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("tmp")
    }

    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("logs")
    }
}
