//! Session persistence adapters.
//!
//! - [`MemoryStorage`] implements [`StoragePort`] over a `HashMap`, for the
//!   simulator and tests.
//! - [`KvSessionStore`] implements [`SessionStore`] on top of any
//!   [`StoragePort`], encoding the session with `postcard`.
//!
//! # Record layout
//!
//! ```text
//!  [ version: u8 ][ postcard(SessionState) ]
//! ```
//!
//! A record with an unknown version byte or that fails to decode is
//! reported as [`StorageError::Corrupted`]; it is never silently dropped,
//! since losing the session loses the nonce.

use std::collections::HashMap;

use log::{debug, info, warn};

use crate::app::ports::{SessionStore, StorageError, StoragePort};
use crate::pod::state::SessionState;

const SESSION_NAMESPACE: &str = "podcore";
const SESSION_KEY: &str = "session";
const RECORD_VERSION: u8 = 1;

/// Largest encoded session accepted (24 basal segments fit easily).
pub const MAX_RECORD_SIZE: usize = 1024;

// ── In-memory key-value storage ──────────────────────────────

/// Plain in-memory [`StoragePort`].  Writes are trivially atomic.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    store: HashMap<String, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn composite_key(namespace: &str, key: &str) -> String {
        format!("{}::{}", namespace, key)
    }
}

impl StoragePort for MemoryStorage {
    fn read(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        match self.store.get(&Self::composite_key(namespace, key)) {
            Some(data) if data.len() > buf.len() => Err(StorageError::TooLarge),
            Some(data) => {
                buf[..data.len()].copy_from_slice(data);
                Ok(data.len())
            }
            None => Err(StorageError::NotFound),
        }
    }

    fn write(&mut self, namespace: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        self.store
            .insert(Self::composite_key(namespace, key), data.to_vec());
        Ok(())
    }

    fn delete(&mut self, namespace: &str, key: &str) -> Result<(), StorageError> {
        self.store.remove(&Self::composite_key(namespace, key));
        Ok(())
    }

    fn exists(&self, namespace: &str, key: &str) -> bool {
        self.store.contains_key(&Self::composite_key(namespace, key))
    }
}

// ── Session store over key-value storage ─────────────────────

/// [`SessionStore`] backed by a [`StoragePort`].
pub struct KvSessionStore<P> {
    storage: P,
}

impl<P: StoragePort> KvSessionStore<P> {
    pub fn new(storage: P) -> Self {
        Self { storage }
    }

    /// Access the underlying storage (diagnostics, tests).
    pub fn storage(&self) -> &P {
        &self.storage
    }
}

impl<P: StoragePort> SessionStore for KvSessionStore<P> {
    fn load(&self) -> Result<Option<SessionState>, StorageError> {
        let mut buf = [0u8; MAX_RECORD_SIZE];
        let len = match self.storage.read(SESSION_NAMESPACE, SESSION_KEY, &mut buf) {
            Ok(len) => len,
            Err(StorageError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };

        let Some((&version, body)) = buf[..len].split_first() else {
            warn!("KvSessionStore: empty session record");
            return Err(StorageError::Corrupted);
        };
        if version != RECORD_VERSION {
            warn!("KvSessionStore: unknown record version {version}");
            return Err(StorageError::Corrupted);
        }
        let state = postcard::from_bytes(body).map_err(|e| {
            warn!("KvSessionStore: decode failed: {e}");
            StorageError::Corrupted
        })?;
        info!("KvSessionStore: session loaded ({len} bytes)");
        Ok(Some(state))
    }

    fn save(&mut self, state: &SessionState) -> Result<(), StorageError> {
        let mut record = vec![RECORD_VERSION];
        let body = postcard::to_allocvec(state).map_err(|e| {
            warn!("KvSessionStore: encode failed: {e}");
            StorageError::Corrupted
        })?;
        record.extend_from_slice(&body);
        if record.len() > MAX_RECORD_SIZE {
            return Err(StorageError::TooLarge);
        }
        self.storage.write(SESSION_NAMESPACE, SESSION_KEY, &record)?;
        debug!("KvSessionStore: session saved ({} bytes)", record.len());
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        self.storage.delete(SESSION_NAMESPACE, SESSION_KEY)?;
        info!("KvSessionStore: session cleared");
        Ok(())
    }
}
