//! Peer wire protocol
//!
//! Messages are serialized with postcard inside a versioned envelope. Every
//! frame may carry a raw byte attachment, used for the replicated payload.
//!
//! ## Message Flow
//!
//! ```text
//! Master (A)                          Replica (B)
//!   |<------------ connect ------------->|
//!   |--- identity ---------------------->|
//!   |<-- identity -----------------------|
//!   |                                    |
//!   |   (propagation delay)              |
//!   |                                    |
//!   |--- sync {offer} + payload -------->|
//!   |                                    |  persist, unpack, init tasks
//!   |<== sync:done {fingerprint} ========|  (broadcast to whole pool)
//!   |                                    |
//!   |--- trigger {id, task} ------------>|
//!   |<-- trigger:reply {id, result} -----|
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{GridError, GridResult};
use crate::identity::NodeIdentity;

/// Task execution metadata ferried from master to replicas
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMeta {
    /// Number of task instances to start
    pub instance_count: u32,
    /// Task group configuration (JSON text)
    pub json_conf: Option<String>,
    /// Folder holding task entry points, relative to `base_folder`
    pub task_folder: String,
    /// Extra environment for task processes
    pub env: BTreeMap<String, String>,
    /// Where the payload was unpacked (filled in by the replica)
    pub base_folder: Option<PathBuf>,
}

/// Sync offer sent by the file master; the payload bytes travel as the attachment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOffer {
    /// Master's public address
    pub public_ip: Option<IpAddr>,
    /// Master's private address
    pub private_ip: Option<IpAddr>,
    /// Task metadata to materialize once the payload is in place
    pub task_meta: TaskMeta,
    /// Content fingerprint of the attached payload
    pub fingerprint: String,
}

/// A remote task invocation
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerRequest {
    /// Task to run
    pub task_id: String,
    /// Task input
    pub task_data: serde_json::Value,
    /// Invocation options
    pub task_opts: serde_json::Value,
}

impl TriggerRequest {
    /// Create a trigger request
    pub fn new(
        task_id: impl Into<String>,
        task_data: serde_json::Value,
        task_opts: serde_json::Value,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            task_data,
            task_opts,
        }
    }

    /// Build the wire message for this request
    pub fn to_message(&self, request_id: u64) -> GridResult<PeerMessage> {
        Ok(PeerMessage::Trigger {
            request_id,
            task_id: self.task_id.clone(),
            task_data: serde_json::to_string(&self.task_data)?,
            task_opts: serde_json::to_string(&self.task_opts)?,
        })
    }

    /// Rebuild a request from wire fields
    pub fn from_wire(task_id: String, task_data: &str, task_opts: &str) -> GridResult<Self> {
        Ok(Self {
            task_id,
            task_data: serde_json::from_str(task_data)?,
            task_opts: serde_json::from_str(task_opts)?,
        })
    }
}

/// Messages exchanged over an established peer connection
///
/// JSON-valued fields travel as JSON text since postcard is not self-describing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Sent to a new peer immediately on connect
    Identity(NodeIdentity),
    /// Discard the locally held synchronized payload
    Clear,
    /// Run a task and reply with `TriggerReply` carrying the same `request_id`
    Trigger {
        request_id: u64,
        task_id: String,
        task_data: String,
        task_opts: String,
    },
    /// Outcome of a `Trigger`
    TriggerReply {
        request_id: u64,
        error: Option<String>,
        result: Option<String>,
    },
    /// Replication offer from the file master
    Sync(SyncOffer),
    /// Broadcast by a replica once it holds the payload
    SyncDone { fingerprint: String },
}

impl PeerMessage {
    /// Protocol name of this message, as used in logs
    pub fn name(&self) -> &'static str {
        match self {
            PeerMessage::Identity(_) => "identity",
            PeerMessage::Clear => "clear",
            PeerMessage::Trigger { .. } => "trigger",
            PeerMessage::TriggerReply { .. } => "trigger:reply",
            PeerMessage::Sync(_) => "sync",
            PeerMessage::SyncDone { .. } => "sync:done",
        }
    }
}

impl fmt::Display for PeerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Wrapper for versioned messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Protocol version 1
    V1(PeerMessage),
}

impl WireMessage {
    /// Wrap a peer message in the current protocol version
    pub fn new(msg: PeerMessage) -> Self {
        WireMessage::V1(msg)
    }

    /// Unwrap the inner message
    pub fn into_inner(self) -> PeerMessage {
        match self {
            WireMessage::V1(msg) => msg,
        }
    }

    /// Get the protocol version
    pub fn version(&self) -> u8 {
        match self {
            WireMessage::V1(_) => 1,
        }
    }
}

/// One unit on the wire: a message plus an optional raw attachment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub message: WireMessage,
    pub attachment: Option<Bytes>,
}

impl Frame {
    /// Frame without attachment
    pub fn new(message: PeerMessage) -> Self {
        Self {
            message: WireMessage::new(message),
            attachment: None,
        }
    }

    /// Frame carrying raw bytes next to the message
    pub fn with_attachment(message: PeerMessage, attachment: Bytes) -> Self {
        Self {
            message: WireMessage::new(message),
            attachment: Some(attachment),
        }
    }

    /// Encode frame to bytes using postcard
    pub fn encode(&self) -> GridResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode frame from bytes using postcard
    pub fn decode(data: &[u8]) -> GridResult<Self> {
        postcard::from_bytes(data)
            .map_err(|e| GridError::Serialization(format!("Failed to decode frame: {}", e)))
    }

    /// Split into the inner message and attachment
    pub fn into_parts(self) -> (PeerMessage, Option<Bytes>) {
        (self.message.into_inner(), self.attachment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridConfig;

    #[test]
    fn test_sync_frame_carries_attachment() {
        let offer = SyncOffer {
            public_ip: Some("198.51.100.4".parse().unwrap()),
            private_ip: None,
            task_meta: TaskMeta {
                instance_count: 2,
                task_folder: "tasks".to_string(),
                ..Default::default()
            },
            fingerprint: "abc123".to_string(),
        };
        let payload = Bytes::from(vec![7u8; 100]);
        let frame = Frame::with_attachment(PeerMessage::Sync(offer.clone()), payload.clone());

        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.message.version(), 1);

        let (message, attachment) = decoded.into_parts();
        assert_eq!(message, PeerMessage::Sync(offer));
        assert_eq!(attachment, Some(payload));
    }

    #[test]
    fn test_identity_frame() {
        let identity = NodeIdentity::from_config(&GridConfig::new("ns").with_name("n1"));
        let frame = Frame::new(PeerMessage::Identity(identity.clone()));

        let (message, attachment) = Frame::decode(&frame.encode().unwrap())
            .unwrap()
            .into_parts();
        assert_eq!(message, PeerMessage::Identity(identity));
        assert!(attachment.is_none());
    }

    #[test]
    fn test_trigger_request_json_survives_wire() {
        let request = TriggerRequest::new(
            "t1",
            serde_json::json!({ "x": 1, "nested": [true, null] }),
            serde_json::json!({}),
        );
        let message = request.to_message(42).unwrap();

        let frame = Frame::decode(&Frame::new(message).encode().unwrap()).unwrap();
        match frame.into_parts().0 {
            PeerMessage::Trigger {
                request_id,
                task_id,
                task_data,
                task_opts,
            } => {
                assert_eq!(request_id, 42);
                let rebuilt = TriggerRequest::from_wire(task_id, &task_data, &task_opts).unwrap();
                assert_eq!(rebuilt, request);
            }
            other => panic!("Wrong message type: {}", other),
        }
    }

    #[test]
    fn test_message_names() {
        assert_eq!(PeerMessage::Clear.name(), "clear");
        assert_eq!(
            PeerMessage::SyncDone {
                fingerprint: String::new()
            }
            .name(),
            "sync:done"
        );
    }

    #[test]
    fn test_garbage_is_serialization_error() {
        let err = Frame::decode(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, GridError::Serialization(_)));
    }
}
