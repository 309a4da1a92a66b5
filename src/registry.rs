use crate::metrics::gauges;
use crate::protocol::PeerInfo;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::mpsc;

/// Handle held in the registry — used to deliver serialized messages to a
/// connection's outbound queue.
#[derive(Clone, Debug)]
pub struct PeerHandle {
    /// Bounded channel into the connection task's delivery loop.
    pub tx: mpsc::Sender<String>,
    /// Display name supplied at join time.
    pub name: String,
    /// Instant this peer's join was applied. Removal is guarded on this
    /// token so a stale session cannot evict a later join's entry.
    pub joined_at: Instant,
}

/// One fan-out target captured in a room snapshot.
#[derive(Clone, Debug)]
pub struct BroadcastTarget {
    /// Peer id of the target within the room.
    pub peer_id: String,
    /// Join token, needed to evict the target if its queue overflows.
    pub joined_at: Instant,
    /// The target's outbound queue.
    pub tx: mpsc::Sender<String>,
}

/// Concurrent room → peer-id → handle table.
///
/// Room entries lock individually, so each join/leave composes its
/// create/insert/remove/snapshot steps atomically with respect to other
/// operations on the same room. Snapshots are returned out of the locked
/// section so callers send without holding any lock.
#[derive(Debug, Default)]
pub struct Registry {
    rooms: DashMap<String, HashMap<String, PeerHandle>>,
}

fn snapshot(room: &HashMap<String, PeerHandle>) -> (Vec<BroadcastTarget>, Vec<PeerInfo>) {
    let mut targets = Vec::with_capacity(room.len());
    let mut peers = Vec::with_capacity(room.len());
    for (id, handle) in room {
        targets.push(BroadcastTarget {
            peer_id: id.clone(),
            joined_at: handle.joined_at,
            tx: handle.tx.clone(),
        });
        peers.push(PeerInfo {
            id: id.clone(),
            name: handle.name.clone(),
        });
    }
    (targets, peers)
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    /// Insert or overwrite a peer in a room, creating the room if absent.
    ///
    /// No uniqueness enforcement beyond overwrite-on-collision: a join
    /// with an in-use peer id silently replaces the previous handle, and
    /// the replaced connection stops receiving room traffic. Returns the
    /// join token plus a snapshot taken under the room lock, for the
    /// caller to broadcast after the lock is released.
    pub fn join(
        &self,
        room: &str,
        peer_id: &str,
        name: &str,
        tx: mpsc::Sender<String>,
    ) -> (Instant, Vec<BroadcastTarget>, Vec<PeerInfo>) {
        let joined_at = Instant::now();
        let mut entry = self.rooms.entry(room.to_owned()).or_insert_with(|| {
            gauges::inc_rooms_active();
            HashMap::new()
        });
        let previous = entry.insert(
            peer_id.to_owned(),
            PeerHandle {
                tx,
                name: name.to_owned(),
                joined_at,
            },
        );
        if previous.is_none() {
            gauges::inc_peers_active();
        }
        let (targets, peers) = snapshot(&entry);
        (joined_at, targets, peers)
    }

    /// Remove a peer if its join token matches, deleting the room if it
    /// is left empty.
    ///
    /// Returns the post-removal snapshot for broadcast, or `None` when
    /// nothing was removed — an unknown room or peer, or a token from a
    /// session whose entry was already replaced. Idempotent by design.
    pub fn leave(
        &self,
        room: &str,
        peer_id: &str,
        joined_at: Instant,
    ) -> Option<(Vec<BroadcastTarget>, Vec<PeerInfo>)> {
        let mut removed = None;
        let mut now_empty = false;
        if let Some(mut entry) = self.rooms.get_mut(room) {
            if entry
                .get(peer_id)
                .is_some_and(|handle| handle.joined_at == joined_at)
            {
                entry.remove(peer_id);
                now_empty = entry.is_empty();
                removed = Some(snapshot(&entry));
            }
        }
        if removed.is_some() {
            gauges::dec_peers_active();
        }
        // the room lock is released above; re-check emptiness on delete so
        // a join that raced in between is not wiped out
        if now_empty && self.rooms.remove_if(room, |_, peers| peers.is_empty()).is_some() {
            gauges::dec_rooms_active();
        }
        removed
    }

    /// Look up the live handle for a peer in a room.
    #[must_use]
    pub fn lookup(&self, room: &str, peer_id: &str) -> Option<PeerHandle> {
        self.rooms
            .get(room)
            .and_then(|peers| peers.get(peer_id).cloned())
    }

    /// Unordered snapshot of a room's membership.
    #[must_use]
    pub fn list_peers(&self, room: &str) -> Vec<PeerInfo> {
        self.rooms.get(room).map_or_else(Vec::new, |peers| {
            peers
                .iter()
                .map(|(id, handle)| PeerInfo {
                    id: id.clone(),
                    name: handle.name.clone(),
                })
                .collect()
        })
    }

    /// Number of rooms with at least one peer.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Number of peers currently in a room.
    #[must_use]
    pub fn peer_count(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, |peers| peers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tx() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        mpsc::channel(8)
    }

    #[test]
    fn join_then_lookup_returns_handle() {
        let registry = Registry::new();
        let (tx, _rx) = make_tx();

        let (_, targets, peers) = registry.join("r1", "alice", "Alice", tx);
        assert_eq!(targets.len(), 1);
        assert_eq!(peers, vec![PeerInfo { id: "alice".into(), name: "Alice".into() }]);

        let handle = registry.lookup("r1", "alice").unwrap();
        assert_eq!(handle.name, "Alice");
    }

    #[test]
    fn lookup_missing_peer_returns_none() {
        let registry = Registry::new();
        assert!(registry.lookup("r1", "alice").is_none());

        let (tx, _rx) = make_tx();
        let _ = registry.join("r1", "alice", "Alice", tx);
        assert!(registry.lookup("r1", "bob").is_none());
        assert!(registry.lookup("r2", "alice").is_none());
    }

    #[test]
    fn join_same_id_overwrites() {
        let registry = Registry::new();
        let (tx1, _rx1) = make_tx();
        let (tx2, _rx2) = make_tx();

        let _ = registry.join("r1", "alice", "Alice", tx1);
        let _ = registry.join("r1", "alice", "Alice II", tx2);

        assert_eq!(registry.peer_count("r1"), 1);
        assert_eq!(registry.lookup("r1", "alice").unwrap().name, "Alice II");
    }

    #[test]
    fn leave_with_matching_token_removes_and_deletes_empty_room() {
        let registry = Registry::new();
        let (tx, _rx) = make_tx();

        let (joined_at, _, _) = registry.join("r1", "alice", "Alice", tx);
        assert_eq!(registry.room_count(), 1);

        let (targets, peers) = registry.leave("r1", "alice", joined_at).unwrap();
        assert!(targets.is_empty());
        assert!(peers.is_empty());
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn leave_with_stale_token_keeps_successor() {
        let registry = Registry::new();
        let (tx1, _rx1) = make_tx();
        let (tx2, _rx2) = make_tx();

        let (old_token, _, _) = registry.join("r1", "alice", "Alice", tx1);
        // same id re-joins; the old session's token must no longer remove
        std::thread::sleep(std::time::Duration::from_millis(1));
        let _ = registry.join("r1", "alice", "Alice II", tx2);

        assert!(registry.leave("r1", "alice", old_token).is_none());
        assert_eq!(registry.peer_count("r1"), 1);
        assert_eq!(registry.lookup("r1", "alice").unwrap().name, "Alice II");
    }

    #[test]
    fn leave_unknown_room_or_peer_is_noop() {
        let registry = Registry::new();
        assert!(registry.leave("ghost", "alice", Instant::now()).is_none());

        let (tx, _rx) = make_tx();
        let _ = registry.join("r1", "alice", "Alice", tx);
        assert!(registry.leave("r1", "bob", Instant::now()).is_none());
        assert_eq!(registry.peer_count("r1"), 1);
    }

    #[test]
    fn leave_returns_remaining_members() {
        let registry = Registry::new();
        let (tx_a, _rx_a) = make_tx();
        let (tx_b, _rx_b) = make_tx();

        let (token_a, _, _) = registry.join("r1", "alice", "Alice", tx_a);
        let _ = registry.join("r1", "bob", "Bob", tx_b);

        let (targets, peers) = registry.leave("r1", "alice", token_a).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].peer_id, "bob");
        assert_eq!(peers, vec![PeerInfo { id: "bob".into(), name: "Bob".into() }]);
        assert_eq!(registry.room_count(), 1);
    }

    #[test]
    fn same_peer_id_isolated_across_rooms() {
        let registry = Registry::new();
        let (tx1, _rx1) = make_tx();
        let (tx2, _rx2) = make_tx();

        let (token_r1, _, _) = registry.join("r1", "x", "in r1", tx1);
        let _ = registry.join("r2", "x", "in r2", tx2);

        assert_eq!(registry.lookup("r1", "x").unwrap().name, "in r1");
        assert_eq!(registry.lookup("r2", "x").unwrap().name, "in r2");

        let _ = registry.leave("r1", "x", token_r1);
        assert!(registry.lookup("r1", "x").is_none());
        assert_eq!(registry.lookup("r2", "x").unwrap().name, "in r2");
    }

    #[test]
    fn join_snapshot_contains_whole_room() {
        let registry = Registry::new();
        let (tx_a, _rx_a) = make_tx();
        let (tx_b, _rx_b) = make_tx();

        let _ = registry.join("r1", "alice", "Alice", tx_a);
        let (_, targets, mut peers) = registry.join("r1", "bob", "Bob", tx_b);

        assert_eq!(targets.len(), 2);
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(peers[0].id, "alice");
        assert_eq!(peers[1].id, "bob");
    }

    #[test]
    fn list_peers_matches_membership() {
        let registry = Registry::new();
        assert!(registry.list_peers("r1").is_empty());

        let (tx_a, _rx_a) = make_tx();
        let (tx_b, _rx_b) = make_tx();
        let _ = registry.join("r1", "alice", "Alice", tx_a);
        let _ = registry.join("r1", "bob", "Bob", tx_b);

        let mut peers = registry.list_peers("r1");
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].name, "Alice");
        assert_eq!(peers[1].name, "Bob");
    }
}
