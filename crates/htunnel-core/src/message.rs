//! Tunnel message types exchanged between the polling client and the engine.
//!
//! Messages travel inside `sync` batches as JSON objects tagged by a `cmd`
//! field. Stream payloads are opaque bytes, carried as base64 text on the
//! wire so that every batch stays a valid JSON document.
//!
//! ```text
//! {"cmd":"connect","id":7,"host":"example.com","port":80}
//! {"cmd":"sync","id":7,"data":"aGVsbG8="}
//! {"cmd":"status","id":7,"value":0}
//! {"cmd":"stop"}
//! ```

use serde::{Deserialize, Serialize};

/// Client-assigned identifier of a multiplexed stream.
pub type StreamId = u32;

/// Status codes carried by [`Message::Status`].
///
/// The positive codes follow the SOCKS5 reply numbering so that a local
/// SOCKS front-end can forward them unchanged.
pub mod status {
    /// Connect succeeded; the stream is active.
    pub const OK: i32 = 0;
    /// Connect failed for an unclassified reason.
    pub const GENERAL_FAILURE: i32 = 1;
    /// Destination rejected by the server's destination policy.
    pub const NOT_ALLOWED: i32 = 2;
    /// Destination host unreachable.
    pub const HOST_UNREACHABLE: i32 = 4;
    /// Remote end refused the connection.
    pub const CONNECTION_REFUSED: i32 = 5;
    /// Connect did not complete in time.
    pub const TIMED_OUT: i32 = 6;
    /// The stream failed or was closed by the remote end.
    pub const ERROR: i32 = -2;
}

/// A single tunnel message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Message {
    /// Open a TCP stream to `host:port` under the given id.
    Connect { id: StreamId, host: String, port: u16 },
    /// Stream payload, in either direction.
    Sync {
        id: StreamId,
        #[serde(rename = "data", with = "base64_bytes")]
        payload: Vec<u8>,
    },
    /// Stream status report. Engine → client: connect result or stream
    /// failure. Client → engine: the client side of the stream went away.
    Status {
        id: StreamId,
        #[serde(rename = "value")]
        code: i32,
    },
    /// Stop the tunnel session.
    Stop,
    /// Any `cmd` this version does not understand. Accepted at the wire
    /// so one odd message cannot poison a whole batch; the engine drops it.
    #[serde(other)]
    Unknown,
}

impl Message {
    /// Build a `Status` message.
    pub fn status(id: StreamId, code: i32) -> Self {
        Message::Status { id, code }
    }

    /// Build a `Sync` message carrying `payload`.
    pub fn sync(id: StreamId, payload: impl Into<Vec<u8>>) -> Self {
        Message::Sync {
            id,
            payload: payload.into(),
        }
    }

    /// The stream this message refers to, if any.
    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Message::Connect { id, .. } | Message::Sync { id, .. } | Message::Status { id, .. } => {
                Some(*id)
            }
            Message::Stop | Message::Unknown => None,
        }
    }
}

/// Serde adapter: `Vec<u8>` as standard base64 text.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(|e| serde::de::Error::custom(format!("invalid base64 payload: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_client_batch() {
        let batch: Vec<Message> = serde_json::from_value(json!([
            {"cmd": "connect", "id": 7, "host": "example.com", "port": 80},
            {"cmd": "sync", "id": 7, "data": "aGVsbG8="},
            {"cmd": "stop"},
        ]))
        .unwrap();

        assert_eq!(
            batch,
            vec![
                Message::Connect {
                    id: 7,
                    host: "example.com".into(),
                    port: 80
                },
                Message::sync(7, b"hello".to_vec()),
                Message::Stop,
            ]
        );
    }

    #[test]
    fn status_uses_value_field() {
        let encoded = serde_json::to_value(Message::status(3, status::CONNECTION_REFUSED)).unwrap();
        assert_eq!(encoded, json!({"cmd": "status", "id": 3, "value": 5}));
    }

    #[test]
    fn sync_payload_is_base64_text() {
        let encoded = serde_json::to_value(Message::sync(1, vec![0u8, 255, 16])).unwrap();
        assert_eq!(encoded["data"], "AP8Q");
    }

    #[test]
    fn unknown_command_is_tolerated() {
        let msg: Message = serde_json::from_value(json!({"cmd": "resize", "id": 2})).unwrap();
        assert_eq!(msg, Message::Unknown);
        assert_eq!(msg.stream_id(), None);
    }

    #[test]
    fn rejects_bad_base64() {
        let result: Result<Message, _> =
            serde_json::from_value(json!({"cmd": "sync", "id": 1, "data": "***"}));
        assert!(result.is_err());
    }

    #[test]
    fn rejects_out_of_range_port() {
        let result: Result<Message, _> = serde_json::from_value(
            json!({"cmd": "connect", "id": 1, "host": "a", "port": 70000}),
        );
        assert!(result.is_err());
    }
}
