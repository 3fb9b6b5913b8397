/// Core error type for the bot.
///
/// Adapter crates map their specific errors into this type so the handlers
/// can tell user-facing failures (balance, permissions) from retryable ones.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("insufficient balance")]
    InsufficientBalance,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no active conversation")]
    NoActiveConversation,

    #[error("a reply is still being generated")]
    Busy,

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;
