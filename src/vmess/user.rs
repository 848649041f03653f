//! The user directory: the external collaborator the request-header
//! decoder consults to turn a 16-byte auth token into a user and the
//! per-user `cmd_key`/timestamp needed to derive the header IV.

use std::collections::HashMap;

/// Whatever identifies a user to the caller. The codec never inspects this
/// beyond using it as the fingerprint's `user` component and for logging.
pub type UserHandle = [u8; 16];

/// A resolved user: its handle plus the 16-byte key used to derive the
/// header decryption stream.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedUser {
    pub handle: UserHandle,
    pub cmd_key: [u8; 16],
}

/// External collaborator consulted once per connection, at the start of
/// request-header decode. `lookup` returns the resolved user and the
/// client-declared time component (seconds) used to derive the header IV,
/// or `None` if the auth token matches no user.
pub trait UserDirectory: Send + Sync {
    fn lookup(&self, auth_token: &[u8; 16]) -> Option<(ResolvedUser, u64)>;
}

/// A directory backed by a fixed in-memory map from auth token to
/// `cmd_key`. Good enough to wire the codec up without any of this
/// codebase's YAML config stack; the timestamp returned is always the
/// caller-supplied one (this directory does not itself clock-skew-check).
pub struct StaticUserDirectory {
    users: HashMap<UserHandle, [u8; 16]>,
    timestamp: u64,
}

impl StaticUserDirectory {
    pub fn new(timestamp: u64) -> Self {
        Self {
            users: HashMap::new(),
            timestamp,
        }
    }

    pub fn with_user(mut self, handle: UserHandle, cmd_key: [u8; 16]) -> Self {
        self.users.insert(handle, cmd_key);
        self
    }

    pub fn set_timestamp(&mut self, timestamp: u64) {
        self.timestamp = timestamp;
    }
}

impl UserDirectory for StaticUserDirectory {
    fn lookup(&self, auth_token: &[u8; 16]) -> Option<(ResolvedUser, u64)> {
        self.users.get(auth_token).map(|cmd_key| {
            (
                ResolvedUser {
                    handle: *auth_token,
                    cmd_key: *cmd_key,
                },
                self.timestamp,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_user() {
        let dir = StaticUserDirectory::new(1_700_000_000).with_user([1u8; 16], [2u8; 16]);
        let (user, ts) = dir.lookup(&[1u8; 16]).expect("user present");
        assert_eq!(user.handle, [1u8; 16]);
        assert_eq!(user.cmd_key, [2u8; 16]);
        assert_eq!(ts, 1_700_000_000);
    }

    #[test]
    fn lookup_unknown_user() {
        let dir = StaticUserDirectory::new(0).with_user([1u8; 16], [2u8; 16]);
        assert!(dir.lookup(&[9u8; 16]).is_none());
    }
}
