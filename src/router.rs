use crate::metrics::counters;
use crate::protocol::{self, Inbound, Outbound, PeerInfo};
use crate::registry::{BroadcastTarget, Registry};
use serde_json::{Map, Value};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Room binding established by a join.
#[derive(Debug)]
struct Binding {
    room: String,
    peer_id: String,
    joined_at: Instant,
}

/// Protocol state for one connection.
///
/// A session starts unbound, becomes bound to exactly one room by a join,
/// and releases the binding once when the connection goes away. Directed
/// messages resolve against the bound room only.
#[derive(Debug)]
pub struct Session {
    tx: mpsc::Sender<String>,
    binding: Option<Binding>,
}

impl Session {
    /// Fresh, unbound session delivering through the given queue.
    #[must_use]
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx, binding: None }
    }

    /// Peer id this session is bound to, once joined.
    #[must_use]
    pub fn peer_id(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.peer_id.as_str())
    }

    /// Dispatch one inbound text frame against the registry.
    ///
    /// Malformed and unrecognized frames are logged and dropped; nothing
    /// here closes the connection.
    pub fn handle_frame(&mut self, registry: &Registry, text: &str) {
        match protocol::parse_inbound(text) {
            Ok(Inbound::Join { room, id, name }) => self.handle_join(registry, room, &id, &name),
            Ok(Inbound::Directed { target_id, payload }) => {
                self.handle_directed(registry, &target_id, payload);
            }
            Ok(Inbound::Unknown) => {
                debug!("ignoring frame with no recognized shape");
            }
            Err(e) => {
                counters::messages_dropped_total("malformed");
                warn!(error = %e, "ignoring malformed frame");
            }
        }
    }

    fn handle_join(&mut self, registry: &Registry, room: String, id: &str, name: &str) {
        // a join on an already-bound session releases the old binding
        // first, so a peer id never sits in two rooms at once
        self.finish(registry);

        let (joined_at, targets, peers) = registry.join(&room, id, name, self.tx.clone());
        counters::joins_total();
        info!(room = %room, peer = %id, name = %name, "peer joined");
        self.binding = Some(Binding {
            room: room.clone(),
            peer_id: id.to_owned(),
            joined_at,
        });
        broadcast_peer_list(registry, &room, targets, peers);
    }

    fn handle_directed(
        &self,
        registry: &Registry,
        target_id: &str,
        payload: Map<String, Value>,
    ) {
        let Some(binding) = &self.binding else {
            counters::messages_dropped_total("not_joined");
            debug!(target = %target_id, "directed frame before join, dropping");
            return;
        };

        let Some(handle) = registry.lookup(&binding.room, target_id) else {
            counters::messages_dropped_total("unknown_target");
            debug!(room = %binding.room, target = %target_id, "target not found, dropping");
            return;
        };

        let stamped = protocol::stamp_sender(payload, &binding.peer_id);
        match handle.tx.try_send(stamped) {
            Ok(()) => counters::messages_relayed_total(),
            Err(TrySendError::Full(_)) => {
                counters::messages_dropped_total("overflow");
                warn!(room = %binding.room, peer = %target_id, "peer queue full, evicting");
                if let Some((targets, peers)) =
                    registry.leave(&binding.room, target_id, handle.joined_at)
                {
                    broadcast_peer_list(registry, &binding.room, targets, peers);
                }
            }
            Err(TrySendError::Closed(_)) => {
                counters::messages_dropped_total("closed");
                debug!(room = %binding.room, target = %target_id, "target queue closed, dropping");
                if let Some((targets, peers)) =
                    registry.leave(&binding.room, target_id, handle.joined_at)
                {
                    broadcast_peer_list(registry, &binding.room, targets, peers);
                }
            }
        }
    }

    /// Release this session's room binding: leave plus broadcast, at most
    /// once per connection.
    ///
    /// Both the error path and the close path of a connection converge
    /// here; the binding is taken on first call, so a second invocation
    /// is a no-op and the room's peer count drops by exactly one.
    pub fn finish(&mut self, registry: &Registry) {
        if let Some(binding) = self.binding.take() {
            info!(room = %binding.room, peer = %binding.peer_id, "peer left");
            if let Some((targets, peers)) =
                registry.leave(&binding.room, &binding.peer_id, binding.joined_at)
            {
                broadcast_peer_list(registry, &binding.room, targets, peers);
            }
        }
    }
}

/// Fan a `peer_list` snapshot out to every open connection in a room.
///
/// The payload is serialized once and enqueued without blocking, so one
/// slow peer cannot stall delivery to the others. A full queue evicts
/// that peer from the room; the shrunken room is then re-snapshotted and
/// the fan-out runs again, so every pass either completes cleanly or
/// strictly reduces the room.
pub fn broadcast_peer_list(
    registry: &Registry,
    room: &str,
    mut targets: Vec<BroadcastTarget>,
    mut peers: Vec<PeerInfo>,
) {
    loop {
        if targets.is_empty() {
            return;
        }
        let Ok(payload) = serde_json::to_string(&Outbound::PeerList { peers: &peers }) else {
            warn!(room = %room, "failed to serialize peer list");
            return;
        };

        let mut resnapshot = None;
        for target in &targets {
            match target.tx.try_send(payload.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    counters::messages_dropped_total("overflow");
                    warn!(room = %room, peer = %target.peer_id, "peer queue full, evicting");
                    if let Some(snap) = registry.leave(room, &target.peer_id, target.joined_at) {
                        resnapshot = Some(snap);
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    counters::messages_dropped_total("closed");
                    if let Some(snap) = registry.leave(room, &target.peer_id, target.joined_at) {
                        resnapshot = Some(snap);
                    }
                }
            }
        }
        counters::peer_list_broadcasts_total();

        match resnapshot {
            Some((next_targets, next_peers)) => {
                targets = next_targets;
                peers = next_peers;
            }
            None => return,
        }
    }
}
