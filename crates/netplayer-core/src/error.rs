//! Error types surfaced by codec adapters and output sinks.
//!
//! Setup paths (thread spawn, buffer allocation) use `anyhow` with context; these enums
//! cover the per-track and per-device failures the stage loops need to tell apart.

use thiserror::Error;

/// Failure reported by a [`crate::codec::Codec`].
#[derive(Error, Debug)]
pub enum CodecError {
    /// Format or parameter combination this adapter cannot decode.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Input bytes do not form a valid stream.
    #[error("malformed stream: {0}")]
    Malformed(String),

    /// Error raised by the underlying decoding library.
    #[error("decoder error: {0}")]
    Backend(String),

    #[error("stream read error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<symphonia::core::errors::Error> for CodecError {
    fn from(e: symphonia::core::errors::Error) -> Self {
        use symphonia::core::errors::Error as SymphoniaError;
        match e {
            SymphoniaError::IoError(io) => CodecError::Io(io),
            SymphoniaError::Unsupported(what) => CodecError::Unsupported(what.to_string()),
            SymphoniaError::DecodeError(what) => CodecError::Malformed(what.to_string()),
            other => CodecError::Backend(other.to_string()),
        }
    }
}

/// Failure reported by a [`crate::sink::SinkDevice`].
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink is not open")]
    Closed,

    /// The device refused the requested rate or format.
    #[error("unsupported output: {0}")]
    Unsupported(String),

    #[error("sink write failed: {0}")]
    Io(#[from] std::io::Error),
}
