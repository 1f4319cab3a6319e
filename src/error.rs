use thiserror::Error;

/// Main error type for the muxer
#[derive(Error, Debug)]
pub enum MuxError {
    /// The request combines options that cannot be served
    /// (e.g. SAMPLE-AES with non-AAC audio, or an I-frame playlist for
    /// content whose segment layout cannot be simulated)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The source media bytes are truncated or malformed
    #[error("Bad media data: {0}")]
    BadData(String),

    /// An internal invariant was violated
    #[error("Unexpected state: {0}")]
    Unexpected(String),

    /// The write callback reported a failure
    #[error("Write error: {0}")]
    WriteError(String),

    /// An error occurred while generating a playlist
    #[error("Playlist generation error: {0}")]
    Playlist(String),

    /// The media set description is inconsistent
    #[error("Invalid media set: {0}")]
    InvalidMedia(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, MuxError>;
