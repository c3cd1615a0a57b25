use thiserror::Error;

/// Every failure mode named in the error handling design: each variant maps
/// to one row of that table and is matched explicitly at its call site.
#[derive(Debug, Error)]
pub enum Error {
    #[error("message empty or not a video/document, or file reference revoked")]
    NotFound,

    #[error("upstream asked to slow down for {0}s")]
    RateLimited(u64),

    #[error("worker credential rejected on start")]
    CredentialExpired,

    #[error("storage backend unavailable")]
    StorageUnavailable(#[source] anyhow::Error),

    #[error("encoder pipe closed mid-write")]
    PipeClosed,

    #[error("stream stuck: no segmenter stdin activity for {0:?}")]
    StreamStuck(std::time::Duration),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Other(e.into())
    }
}
