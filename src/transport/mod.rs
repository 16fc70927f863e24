//! Transport seam between the agent core and the controller.
//!
//! The core only requires two calls: poll for tasking and push response
//! packets. The wire format on the far side is the transport's concern; once
//! a tasking body is non-default it is handed whole to the dispatcher.

use async_trait::async_trait;

use crate::error::TransportError;

pub mod http;
pub mod memory;

pub use http::HttpTransport;
pub use memory::QueueTransport;

/// One poll result from the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tasking {
    /// Controller status code (HTTP status for the HTTP transport).
    pub status: u16,
    /// Raw tasking body. Equality with the configured default response marks
    /// a missed checkin.
    pub body: Vec<u8>,
}

impl Tasking {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }
}

/// Controller channel consumed by the scheduling loop and the response side
/// channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Poll the controller for new tasking.
    async fn fetch_tasking(&self) -> Result<Tasking, TransportError>;

    /// Deliver one serialized response packet.
    async fn send(&self, packet: Vec<u8>) -> Result<(), TransportError>;
}
