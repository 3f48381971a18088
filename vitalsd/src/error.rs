use thiserror::Error;

/// Rejections for alert rule input plus the storage failures behind it.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule name must not be empty")]
    EmptyName,
    #[error("unknown metric '{0}' (expected one of: {known})", known = crate::alerts::Metric::names().join(", "))]
    UnknownMetric(String),
    #[error("unknown operator '{0}' (expected one of: >, <, >=, <=, ==)")]
    UnknownOperator(String),
    #[error("threshold '{0}' is not a finite number")]
    InvalidThreshold(String),
    #[error("rule {0} not found")]
    NotFound(i64),
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Why a signal or priority change could not be applied.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("process {0} not found")]
    NotFound(u32),
    #[error("permission denied for process {0}")]
    PermissionDenied(u32),
    #[error("refusing to touch protected process {0}")]
    Protected(u32),
    #[error("nice value {0} outside -20..=19")]
    InvalidNice(i32),
    #[error("os error: {0}")]
    Os(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}
