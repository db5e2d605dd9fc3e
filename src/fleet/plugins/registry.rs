use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identity of one live socket. Exists only for the socket's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Live connections of one namespace, keyed by connection id.
///
/// No internal locking: a registry is owned by exactly one plugin task and
/// only that task reads or writes it.
#[derive(Debug)]
pub struct ConnectionRegistry<C> {
    entries: HashMap<ConnectionId, C>,
}

impl<C> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<C> ConnectionRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; returns the previous entry for `id`, if any.
    pub fn register(&mut self, id: ConnectionId, connection: C) -> Option<C> {
        self.entries.insert(id, connection)
    }

    pub fn unregister(&mut self, id: &ConnectionId) -> Option<C> {
        self.entries.remove(id)
    }

    /// A miss means the connection already closed.
    pub fn get(&self, id: &ConnectionId) -> Option<&C> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &ConnectionId) -> Option<&mut C> {
        self.entries.get_mut(id)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn all(&self) -> impl Iterator<Item = (&ConnectionId, &C)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry, handing them back for cleanup.
    pub fn drain(&mut self) -> impl Iterator<Item = (ConnectionId, C)> + '_ {
        self.entries.drain()
    }
}
