//! Upload module
//!
//! Large-file sessions, part leases and the deferred-hash reader used when a
//! part's hash is only known at the end of its body.

use parking_lot::RwLock;
use std::sync::Arc;

pub mod deferred_hash;
pub mod large_file;

pub use deferred_hash::{DeferredHash, DeferredHashReader};
pub use large_file::{LargeFile, PartUrl};

/// Content hash header value for an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentHash {
    /// Hex SHA-1 of the body
    Known(String),

    /// The last 40 bytes of the body are the hex SHA-1 of what precedes them
    Deferred,
}

impl ContentHash {
    pub fn header_value(&self) -> &str {
        match self {
            ContentHash::Known(hash) => hash,
            ContentHash::Deferred => crate::api::request::DEFERRED_HASH_SENTINEL,
        }
    }
}

impl From<String> for ContentHash {
    fn from(hash: String) -> Self {
        ContentHash::Known(hash)
    }
}

/// Upload endpoint and the token that goes with it
#[derive(Debug)]
pub(crate) struct Endpoint {
    pub(crate) uri: String,
    pub(crate) token: String,
}

/// Endpoint of an upload lease, replaced as a whole on reload.
#[derive(Debug)]
pub(crate) struct Lease {
    current: RwLock<Arc<Endpoint>>,
}

impl Lease {
    pub(crate) fn new(uri: String, token: String) -> Self {
        Self {
            current: RwLock::new(Arc::new(Endpoint { uri, token })),
        }
    }

    pub(crate) fn get(&self) -> Arc<Endpoint> {
        self.current.read().clone()
    }

    pub(crate) fn set(&self, next: Lease) {
        *self.current.write() = next.get();
    }
}
