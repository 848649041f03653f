use thiserror::Error;

/// Errors surfaced by the server-side session codec.
///
/// Every variant maps to a failure kind named in the wire-format design;
/// none are retried internally. A failed decode always aborts the
/// connection at the caller.
#[derive(Error, Debug)]
pub enum VmessError {
    #[error("request header ended before a complete field could be read")]
    Truncated(#[from] std::io::Error),

    #[error("auth token did not resolve to a known user")]
    InvalidUser,

    #[error("unsupported protocol version: {0}")]
    InvalidVersion(u8),

    #[error("session fingerprint already present and unexpired (replay)")]
    Replay,

    #[error("domain address had zero length")]
    ZeroLengthDomain,

    #[error("FNV-1a checksum mismatch")]
    InvalidAuth,

    #[error("address field decoded to no usable destination")]
    InvalidAddress,

    #[error("unsupported security type after normalization: {0}")]
    UnsupportedSecurity(u8),
}

impl From<VmessError> for std::io::Error {
    fn from(e: VmessError) -> Self {
        match e {
            VmessError::Truncated(io) => io,
            other => std::io::Error::other(other),
        }
    }
}
