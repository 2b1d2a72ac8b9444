use thiserror::Error;

/// A failed fetch attempt. Every variant is transient from the cache's point
/// of view: whether to try again is decided per failure by the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Daemon is not available")]
    DaemonUnavailable,

    #[error("No network connectivity")]
    Offline,

    #[error("RPC failed: {0}")]
    Rpc(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error details carried in messages
const MAX_ERROR_DETAIL_LENGTH: usize = 200;

impl FetchError {
    /// Build an RPC error, truncating overly long detail strings
    pub fn rpc(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if detail.len() <= MAX_ERROR_DETAIL_LENGTH {
            FetchError::Rpc(detail)
        } else {
            let cut = (0..=MAX_ERROR_DETAIL_LENGTH)
                .rev()
                .find(|&i| detail.is_char_boundary(i))
                .unwrap_or(0);
            FetchError::Rpc(format!(
                "{}... (truncated, {} total bytes)",
                &detail[..cut],
                detail.len()
            ))
        }
    }
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Could not find config directory")]
    NoConfigDir,

    #[error("Failed to access settings file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid backoff schedule: {0}")]
    InvalidSchedule(String),
}
