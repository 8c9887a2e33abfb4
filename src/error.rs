use thiserror::Error;

/// Errors surfaced by the orchestration engine and its components.
///
/// Configuration errors (`EmptyTargets`, `EmptyTemplates`, `InvalidRateSpec`,
/// `InvalidConfig`) are fatal and reported before any unit is dispatched. Per-unit probe
/// failures are never represented here; they are absorbed locally and the
/// unit is marked failed-but-completed.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no targets provided for scan")]
    EmptyTargets,

    #[error("no templates provided for scan")]
    EmptyTemplates,

    #[error("invalid rate limit: {0}")]
    InvalidRateSpec(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("scan cancelled")]
    Cancelled,

    #[error("engine instance already ran; create a new engine to scan again")]
    AlreadyRan,

    #[error("component is stopped: {0}")]
    Stopped(&'static str),

    #[error("template catalog error: {0}")]
    Catalog(String),

    #[error("target store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("collaboration endpoint error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("checkpoint serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// True when the error is the cooperative shutdown signal rather than
    /// a real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}
