use thiserror::Error;

/// Failures surfaced by the screening pipeline.
///
/// A request either yields a complete result or exactly one of these; no
/// variant carries a partially computed prediction.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Image could not be decoded: {0}")]
    Decode(String),
    #[error("No conjunctiva region detected")]
    NoRegionDetected,
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Failed to encode output image: {0}")]
    Encode(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Whether the caller can fix the failure by resubmitting a different
    /// image (4xx-style) rather than it being a server-side fault.
    pub fn is_user_correctable(&self) -> bool {
        matches!(self, Error::Decode(_) | Error::NoRegionDetected)
    }

    pub(crate) fn decode(err: impl std::fmt::Display) -> Self {
        Error::Decode(err.to_string())
    }

    pub(crate) fn inference(err: impl std::fmt::Display) -> Self {
        Error::Inference(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
