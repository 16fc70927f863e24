//! Task/response packet model and the response side channel.
//!
//! Packets travel as JSON: `{"type": u32, "data": string, "id": string}`.
//! Type 0 is reserved for errors and type 110 for background-job output; the
//! correlation id round-trips untouched on every response tied to a task.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::transport::Transport;

/// Response type reserved for handler and protocol errors.
pub const RESPONSE_ERROR: u32 = 0;

/// Response type carrying buffered background-job output.
pub const RESPONSE_JOB_OUTPUT: u32 = 110;

/// An inbound instruction from the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPacket {
    /// Numeric task-type code.
    #[serde(rename = "type")]
    pub kind: u32,
    /// Opaque task body. Binary payloads travel base64-encoded.
    pub data: String,
    /// Correlation id echoed on every response to this task.
    pub id: String,
}

impl TaskPacket {
    pub fn new(kind: u32, data: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind,
            data: data.into(),
            id: id.into(),
        }
    }

    /// Parse a packet from the raw tasking body.
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

/// An outbound response, same wire shape as [`TaskPacket`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePacket {
    #[serde(rename = "type")]
    pub kind: u32,
    pub data: String,
    pub id: String,
}

impl ResponsePacket {
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

/// Serialize a response packet for the transport.
pub fn build_response_packet(kind: u32, data: &str, correlation_id: &str) -> Vec<u8> {
    let packet = ResponsePacket {
        kind,
        data: data.to_string(),
        id: correlation_id.to_string(),
    };
    // A flat struct of integers and strings always serializes.
    serde_json::to_vec(&packet).unwrap_or_default()
}

/// The side channel every task handler answers through.
///
/// Handlers never return data to the dispatcher; several of them (file
/// transfer, long jobs) emit multiple packets per inbound task, so all results
/// flow through here.
#[derive(Clone)]
pub struct ResponseChannel {
    transport: Arc<dyn Transport>,
}

impl ResponseChannel {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Build and send one response packet.
    pub async fn send(
        &self,
        kind: u32,
        data: &str,
        correlation_id: &str,
    ) -> Result<(), TransportError> {
        self.transport
            .send(build_response_packet(kind, data, correlation_id))
            .await
    }

    /// Send a type-0 error response tagged with the correlation id.
    pub async fn send_error(&self, message: &str, correlation_id: &str) -> Result<(), TransportError> {
        self.send(RESPONSE_ERROR, message, correlation_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_packet_json_round_trip() {
        let packet = TaskPacket::new(40, "whoami", "task-7");
        let bytes = serde_json::to_vec(&packet).unwrap();
        assert_eq!(TaskPacket::parse(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_wire_field_is_named_type() {
        let bytes = build_response_packet(2, "", "abc");
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], 2);
        assert_eq!(value["data"], "");
        assert_eq!(value["id"], "abc");
    }

    #[test]
    fn test_correlation_id_round_trips_untouched() {
        let id = "0a1b2c3d-ffff-4000-8000-deadbeef0001";
        let bytes = build_response_packet(RESPONSE_ERROR, "boom", id);
        let parsed = ResponsePacket::parse(&bytes).unwrap();
        assert_eq!(parsed.id, id);
        assert_eq!(parsed.kind, RESPONSE_ERROR);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(TaskPacket::parse(b"not json").is_err());
        assert!(TaskPacket::parse(b"{\"type\":\"x\"}").is_err());
    }
}
