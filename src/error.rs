//! Error types for the mnemo memory store.

/// Top-level error type for the memory system.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Vector collection backend error.
    #[error("collection error: {0}")]
    Collection(String),

    /// Embedding generation error.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Migration engine or state-machine error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Search result fusion error.
    #[error("fusion error: {0}")]
    Fusion(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Migration state persistence error.
    #[error("state error: {0}")]
    State(String),

    /// Memory record validation error.
    #[error("record error: {0}")]
    Record(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, MemoryError>;
