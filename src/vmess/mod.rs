//! VMess server-side session codec: request-header decode, response-header
//! encode, replay defense, and the body framing/cipher pipelines for all
//! four security modes.

pub mod cfb;
pub mod chunk;
pub mod cipher;
pub mod error;
pub mod nonce;
pub mod protocol;
pub mod request;
pub mod response;
pub mod session;
pub mod session_history;
pub mod size;
pub mod user;

pub use error::VmessError;
pub use protocol::{Command, DestAddress, RequestOptions, SecurityType, SessionFingerprint};
pub use request::{RequestDescriptor, SessionCryptoState};
pub use response::{ResponseCommand, ResponseDescriptor};
pub use session::{select_body_reader, select_body_writer, ServerSession};
pub use session_history::SessionHistory;
pub use user::{ResolvedUser, StaticUserDirectory, UserDirectory, UserHandle};
