//! Errors raised while personalizing, rendering and post-processing.
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed request: empty prompt, bad image dimensions, bad configuration.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Anything surfaced by the generative backend while encoding, optimizing,
    /// denoising or decoding.
    #[error("backend failure: {0}")]
    Backend(String),

    #[error("missing asset {0:?}")]
    MissingAsset(PathBuf),

    /// A video frame does not have the size fixed by the first frame.
    #[error("frame {index} is {actual:?} but the stream is {expected:?}")]
    DimensionMismatch { index: usize, expected: (u32, u32), actual: (u32, u32) },

    #[error("video encoder: {0}")]
    Encoder(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Config(#[from] serde_json::Error),
}

impl Error {
    /// Short stable name, used when reporting failures.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "InvalidInputError",
            Self::Backend(_) => "BackendError",
            Self::MissingAsset(_) => "MissingAssetError",
            Self::DimensionMismatch { .. } => "DimensionMismatchError",
            Self::Encoder(_) => "EncoderError",
            Self::Io(_) => "IoError",
            Self::Image(_) => "ImageError",
            Self::Config(_) => "ConfigError",
        }
    }

    pub(crate) fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }
}

impl From<tch::TchError> for Error {
    fn from(e: tch::TchError) -> Self {
        Self::Backend(e.to_string())
    }
}

impl From<gif::EncodingError> for Error {
    fn from(e: gif::EncodingError) -> Self {
        Self::Encoder(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(Error::invalid("empty prompt").kind(), "InvalidInputError");
        assert_eq!(Error::MissingAsset("a.png".into()).kind(), "MissingAssetError");
        let err = Error::DimensionMismatch { index: 3, expected: (512, 512), actual: (256, 256) };
        assert_eq!(err.kind(), "DimensionMismatchError");
        assert_eq!(err.to_string(), "frame 3 is (256, 256) but the stream is (512, 512)");
    }
}
