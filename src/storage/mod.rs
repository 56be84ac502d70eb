// Storage module for Tor data persistence
//
// A small key -> string store holding:
// - the cached directory consensus
// - authority key certificates
// - the binary router descriptor dump (base64 encoded)

mod file;
mod memory;

pub use file::FileStringStorage;
pub use memory::MemoryStringStorage;

use crate::error::{Result, TorError};
use async_trait::async_trait;

/// Key of the cached consensus document
pub const CONSENSUS_KEY: &str = "directory-cached-consensus.txt";
/// Key of the cached authority key certificates
pub const AUTHORITY_CERTS_KEY: &str = "authority-key-certificates.txt";
/// Key of the router descriptor dump
pub const ROUTER_DESCRIPTORS_KEY: &str = "directory-router-descriptors.cache";

/// Persistent key -> string map
#[async_trait]
pub trait StringStorage: Send + Sync {
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// `None` when nothing was ever stored under `key`
    async fn get(&self, key: &str) -> Result<Option<String>>;
}

/// Keys must be lower-case file-name safe: `[a-z0-9_\-.]+`
pub fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.bytes().all(|b| {
            b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-' || b == b'.'
        });
    if valid {
        Ok(())
    } else {
        Err(TorError::Storage(format!("invalid storage key: {:?}", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        assert!(validate_key(CONSENSUS_KEY).is_ok());
        assert!(validate_key(AUTHORITY_CERTS_KEY).is_ok());
        assert!(validate_key(ROUTER_DESCRIPTORS_KEY).is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("Upper.txt").is_err());
        assert!(validate_key("../escape").is_err());
        assert!(validate_key("a b").is_err());
    }
}
