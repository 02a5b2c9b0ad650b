/// Core error type.
///
/// Adapter crates map their specific failures into this type (or into
/// [`crate::source::SourceError`] at the message source boundary).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Terminal condition (e.g. the credential was rejected). Stops the poll loop.
    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
