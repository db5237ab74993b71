use crate::error::{EngineError, Result};
use std::path::PathBuf;

/// AES-256 key length in bytes.
const KEY_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub log_level: String,
    /// Environment-wide artifact encryption key; required only when a
    /// config enables encryption.
    pub encryption_key: Option<[u8; KEY_LEN]>,
    pub scheduler_tick_secs: u64,
    pub retention_sweep_secs: u64,
    pub max_concurrent_jobs: usize,
    pub job_timeout_secs: u64,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(
            std::env::var("ENGINE_DATA_DIR").unwrap_or_else(|_| "./data".into()),
        );

        let encryption_key = match std::env::var("BACKUP_ENCRYPTION_KEY") {
            Ok(raw) => Some(decode_key(&raw)?),
            Err(_) => None,
        };

        Ok(Self {
            db_path: data_dir.join("backup-engine.db"),
            data_dir,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            encryption_key,
            scheduler_tick_secs: std::env::var("SCHEDULER_TICK_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            retention_sweep_secs: std::env::var("RETENTION_SWEEP_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(86_400),
            max_concurrent_jobs: std::env::var("MAX_CONCURRENT_JOBS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            job_timeout_secs: std::env::var("JOB_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3_600),
        })
    }
}

fn decode_key(raw: &str) -> Result<[u8; KEY_LEN]> {
    use base64::{engine::general_purpose::STANDARD, Engine};

    let bytes = STANDARD
        .decode(raw.trim())
        .map_err(|e| EngineError::Configuration(format!("BACKUP_ENCRYPTION_KEY is not valid base64: {}", e)))?;
    let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
        EngineError::Configuration(format!(
            "BACKUP_ENCRYPTION_KEY must decode to {} bytes, got {}",
            KEY_LEN,
            bytes.len()
        ))
    })?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_key_accepts_32_bytes() {
        use base64::{engine::general_purpose::STANDARD, Engine};
        let raw = STANDARD.encode([7u8; 32]);
        assert_eq!(decode_key(&raw).unwrap(), [7u8; 32]);
    }

    #[test]
    fn decode_key_rejects_wrong_length() {
        use base64::{engine::general_purpose::STANDARD, Engine};
        let raw = STANDARD.encode([7u8; 16]);
        assert!(matches!(
            decode_key(&raw),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn decode_key_rejects_garbage() {
        assert!(matches!(
            decode_key("not base64!!"),
            Err(EngineError::Configuration(_))
        ));
    }
}
