//! The request descriptor and the per-session cryptographic state produced
//! alongside it by header decode.

use crate::vmess::protocol::{Command, DestAddress, RequestOptions, SecurityType};

/// Everything the 41-byte plaintext header (plus address) carries, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub version: u8,
    pub user_handle: [u8; 16],
    pub options: RequestOptions,
    pub security: SecurityType,
    pub command: Command,
    pub port: u16,
    pub address: DestAddress,
}

/// Per-connection key material, established once at header-decode time and
/// consulted by both body-pipeline selection and response-header encode.
/// Not part of `RequestDescriptor` because it is secret and never compared
/// for the round-trip property test in the same way the descriptor is.
#[derive(Clone)]
pub struct SessionCryptoState {
    pub request_body_key: [u8; 16],
    pub request_body_iv: [u8; 16],
    pub response_header_byte: u8,
}
