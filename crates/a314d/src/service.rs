//! Registered service names.

use std::collections::HashMap;

use crate::client::ClientId;

/// Service name → owning client. At most one registrant per name.
///
/// Names are raw byte strings; the wire allows anything up to 255 bytes and
/// the daemon treats them opaquely.
#[derive(Debug, Default)]
pub struct ServiceMap {
    map: HashMap<Vec<u8>, ClientId>,
}

impl ServiceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` to `owner`. Fails if the name is already taken.
    pub fn register(&mut self, name: &[u8], owner: ClientId) -> bool {
        if self.map.contains_key(name) {
            return false;
        }
        self.map.insert(name.to_vec(), owner);
        true
    }

    /// Remove `name` if it is registered to `owner`.
    pub fn deregister(&mut self, name: &[u8], owner: ClientId) -> bool {
        match self.map.get(name) {
            Some(&current) if current == owner => {
                self.map.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, name: &[u8]) -> Option<ClientId> {
        self.map.get(name).copied()
    }

    /// Drop every registration owned by `owner`.
    pub fn remove_owner(&mut self, owner: ClientId) {
        self.map.retain(|_, &mut cc| cc != owner);
    }
}
