//! Room registry.
//!
//! A room is a named set of sockets that receive the same refresh
//! broadcasts. A socket belongs to at most one room at a time; joining a new
//! room leaves the previous one, and a room is garbage-collected when its
//! last member leaves.

use super::SocketId;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// The room every socket lands in when `join` names none.
pub const DEFAULT_ROOM: &str = "default";

#[derive(Default)]
struct Inner {
    rooms: HashMap<String, HashSet<SocketId>>,
    socket_rooms: HashMap<SocketId, String>,
}

/// Maps sockets to rooms and back.
#[derive(Default)]
pub struct RoomRegistry {
    inner: RwLock<Inner>,
}

impl RoomRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a room, leaving any previous one. Idempotent for re-joins.
    pub fn join(&self, socket: SocketId, room: &str) {
        let mut inner = self.inner.write();
        if inner.socket_rooms.get(&socket).map(String::as_str) == Some(room) {
            return;
        }
        Self::remove_membership(&mut inner, socket);
        inner
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(socket);
        inner.socket_rooms.insert(socket, room.to_string());
    }

    /// Remove a socket from its room, deleting the room when it empties.
    pub fn leave(&self, socket: SocketId) {
        Self::remove_membership(&mut self.inner.write(), socket);
    }

    /// The room a socket currently belongs to.
    pub fn room_of(&self, socket: SocketId) -> Option<String> {
        self.inner.read().socket_rooms.get(&socket).cloned()
    }

    /// Members of a room, excluding `except` when given.
    pub fn members(&self, room: &str, except: Option<SocketId>) -> Vec<SocketId> {
        self.inner
            .read()
            .rooms
            .get(room)
            .map(|members| {
                members
                    .iter()
                    .copied()
                    .filter(|m| Some(*m) != except)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of rooms currently alive.
    pub fn room_count(&self) -> usize {
        self.inner.read().rooms.len()
    }

    fn remove_membership(inner: &mut Inner, socket: SocketId) {
        if let Some(room) = inner.socket_rooms.remove(&socket) {
            if let Some(members) = inner.rooms.get_mut(&room) {
                members.remove(&socket);
                if members.is_empty() {
                    inner.rooms.remove(&room);
                }
            }
        }
    }
}

impl std::fmt::Debug for RoomRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("RoomRegistry")
            .field("rooms", &inner.rooms.len())
            .field("sockets", &inner.socket_rooms.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_creates_room() {
        let registry = RoomRegistry::new();
        let a = SocketId::new();
        registry.join(a, "r1");
        assert_eq!(registry.room_of(a).as_deref(), Some("r1"));
        assert_eq!(registry.members("r1", None), vec![a]);
    }

    #[test]
    fn join_moves_between_rooms() {
        let registry = RoomRegistry::new();
        let a = SocketId::new();
        registry.join(a, "r1");
        registry.join(a, "r2");
        assert_eq!(registry.room_of(a).as_deref(), Some("r2"));
        // r1 was emptied and collected.
        assert!(registry.members("r1", None).is_empty());
        assert_eq!(registry.room_count(), 1);
    }

    #[test]
    fn rejoin_is_idempotent() {
        let registry = RoomRegistry::new();
        let a = SocketId::new();
        registry.join(a, "r1");
        registry.join(a, "r1");
        assert_eq!(registry.members("r1", None).len(), 1);
    }

    #[test]
    fn leave_collects_empty_room() {
        let registry = RoomRegistry::new();
        let a = SocketId::new();
        let b = SocketId::new();
        registry.join(a, "r1");
        registry.join(b, "r1");
        registry.leave(a);
        assert_eq!(registry.members("r1", None), vec![b]);
        registry.leave(b);
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn members_except_origin() {
        let registry = RoomRegistry::new();
        let a = SocketId::new();
        let b = SocketId::new();
        registry.join(a, "r1");
        registry.join(b, "r1");
        let others = registry.members("r1", Some(a));
        assert_eq!(others, vec![b]);
    }
}
