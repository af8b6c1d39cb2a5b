//! Adapter registry.
//!
//! An adapter is a client-owned key: reads against it are routed back to the
//! owning socket instead of the storage backend. At most one owner exists per
//! key, ownership dies with the connection, and nested adapters registered by
//! the same socket are cleaned up together.

use super::SocketId;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

#[derive(Default)]
struct Inner {
    owners: HashMap<String, SocketId>,
    by_socket: HashMap<SocketId, HashSet<String>>,
}

/// Maps prefixed keys to their owning sockets.
#[derive(Default)]
pub struct AdapterRegistry {
    inner: RwLock<Inner>,
}

impl AdapterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `socket` as the owner of `key`.
    ///
    /// Fails with `KeyError` when the key already has an owner; the caller
    /// is responsible for also rejecting keys that hold storage data.
    pub fn register(&self, key: &str, socket: SocketId) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.owners.contains_key(key) {
            return Err(Error::KeyError {
                key: format!("Adapter already registered for key '{key}'"),
            });
        }
        inner.owners.insert(key.to_string(), socket);
        inner
            .by_socket
            .entry(socket)
            .or_default()
            .insert(key.to_string());
        Ok(())
    }

    /// Whether any adapter serves `key`.
    pub fn exists(&self, key: &str) -> bool {
        self.inner.read().owners.contains_key(key)
    }

    /// The socket owning `key`.
    pub fn owner(&self, key: &str) -> Option<SocketId> {
        self.inner.read().owners.get(key).copied()
    }

    /// Remove one adapter, but only when `socket` owns it.
    pub fn unregister(&self, key: &str, socket: SocketId) -> bool {
        let mut inner = self.inner.write();
        if inner.owners.get(key) != Some(&socket) {
            return false;
        }
        inner.owners.remove(key);
        if let Some(keys) = inner.by_socket.get_mut(&socket) {
            keys.remove(key);
            if keys.is_empty() {
                inner.by_socket.remove(&socket);
            }
        }
        true
    }

    /// Remove every adapter owned by `socket`; returns the removed keys.
    pub fn remove_for_socket(&self, socket: SocketId) -> Vec<String> {
        let mut inner = self.inner.write();
        let keys: Vec<String> = inner
            .by_socket
            .remove(&socket)
            .map(|keys| keys.into_iter().collect())
            .unwrap_or_default();
        for key in &keys {
            inner.owners.remove(key);
        }
        keys
    }

    /// Number of registered adapters.
    pub fn len(&self) -> usize {
        self.inner.read().owners.len()
    }

    /// Whether no adapter is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.read().owners.is_empty()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.len())
            .finish()
    }
}
