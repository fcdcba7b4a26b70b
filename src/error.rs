use std::io;
use thiserror::Error;

/// The primary error type for the `paradigm-link` library.
///
/// All variants are fatal for the operation that raised them; the engine never
/// retries internally. Recovery is restarting the session.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("invalid frame from bridge: {0}")]
    InvalidFrame(String),

    #[error("timeout awaiting response: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown record type 0x{0:02x}")]
    UnknownRecordType(u8),

    #[error("unsupported record type 0x{0:02x}")]
    UnsupportedRecordType(u8),

    #[error("packet layout error: {0}")]
    Layout(String),

    #[error("insufficient data: expected at least {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
