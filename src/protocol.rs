use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Peer identity surfaced in `peer_list` broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    /// Peer id, unique within its room.
    pub id: String,
    /// Display name supplied at join time, not validated.
    pub name: String,
}

/// Messages originated by the relay itself.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound<'a> {
    /// Snapshot of a room's membership, sent after every join and leave.
    PeerList {
        /// Current members of the room, in no particular order.
        peers: &'a [PeerInfo],
    },
}

/// A classified inbound frame.
///
/// Classification is by required-field presence: a `type` of `"join"`
/// wins over a `targetId` when both are present, and anything matching
/// neither shape is [`Inbound::Unknown`].
#[derive(Debug)]
pub enum Inbound {
    /// `{"type":"join","room":..,"id":..,"name":..}` — bind this
    /// connection to a room.
    Join {
        /// Room to join.
        room: String,
        /// Peer id within that room.
        id: String,
        /// Display name.
        name: String,
    },
    /// Any object carrying a string `targetId` — forwarded verbatim to
    /// that peer, with the sender's id stamped in.
    Directed {
        /// Peer the message is addressed to.
        target_id: String,
        /// The full message object, including `targetId`.
        payload: Map<String, Value>,
    },
    /// Parseable JSON that matches neither shape. Ignored.
    Unknown,
}

/// Ways an inbound frame can fail classification.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The frame was not valid JSON.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    /// The frame was valid JSON but not an object.
    #[error("payload is not a json object")]
    NotAnObject,
    /// A join frame was missing one of its required string fields.
    #[error("join message missing field `{0}`")]
    MissingField(&'static str),
}

fn string_field(map: &Map<String, Value>, key: &'static str) -> Result<String, ProtocolError> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or(ProtocolError::MissingField(key))
}

/// Classify one inbound text frame.
///
/// # Errors
///
/// Returns an error for non-JSON input, non-object payloads, and join
/// frames missing a required field. Callers log and ignore these; the
/// connection stays open.
pub fn parse_inbound(text: &str) -> Result<Inbound, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(map) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    if map.get("type").and_then(Value::as_str) == Some("join") {
        return Ok(Inbound::Join {
            room: string_field(&map, "room")?,
            id: string_field(&map, "id")?,
            name: string_field(&map, "name")?,
        });
    }

    let target = map
        .get("targetId")
        .and_then(Value::as_str)
        .map(str::to_owned);
    match target {
        Some(target_id) => Ok(Inbound::Directed {
            target_id,
            payload: map,
        }),
        None => Ok(Inbound::Unknown),
    }
}

/// Stamp the true sender id into a directed payload and re-serialize it.
///
/// Any caller-supplied `id` field is overwritten; receivers trust this
/// field to identify the sender.
#[must_use]
pub fn stamp_sender(mut payload: Map<String, Value>, sender_id: &str) -> String {
    payload.insert("id".to_owned(), Value::String(sender_id.to_owned()));
    Value::Object(payload).to_string()
}
