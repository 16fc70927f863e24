//! In-memory queue transport for tests and demos.
//!
//! Tasking is scripted up-front; everything the agent sends is captured for
//! later assertions. An exhausted queue serves the default "no new tasking"
//! body, which is what a quiet controller looks like to the loop.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::TransportError;
use crate::packet::ResponsePacket;
use crate::transport::{Tasking, Transport};

/// Scripted transport backed by in-memory queues.
#[derive(Default)]
pub struct QueueTransport {
    tasking: Mutex<VecDeque<Tasking>>,
    sent: Mutex<Vec<Vec<u8>>>,
    default_body: Vec<u8>,
}

impl QueueTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the body served once the scripted queue runs dry.
    pub fn with_default_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.default_body = body.into();
        self
    }

    /// Queue one scripted poll result.
    pub async fn push(&self, tasking: Tasking) {
        self.tasking.lock().await.push_back(tasking);
    }

    /// Queue a successful poll carrying `body`.
    pub async fn push_body(&self, body: impl Into<Vec<u8>>) {
        self.push(Tasking::ok(body)).await;
    }

    /// Raw captured sends, in order.
    pub async fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().await.clone()
    }

    /// Captured sends parsed as response packets. Panics on malformed output,
    /// which is itself a test failure.
    pub async fn sent_packets(&self) -> Vec<ResponsePacket> {
        self.sent
            .lock()
            .await
            .iter()
            .map(|bytes| ResponsePacket::parse(bytes).expect("agent sent malformed packet"))
            .collect()
    }

    pub async fn clear_sent(&self) {
        self.sent.lock().await.clear();
    }
}

#[async_trait]
impl Transport for QueueTransport {
    async fn fetch_tasking(&self) -> Result<Tasking, TransportError> {
        let next = self.tasking.lock().await.pop_front();
        Ok(next.unwrap_or_else(|| Tasking::ok(self.default_body.clone())))
    }

    async fn send(&self, packet: Vec<u8>) -> Result<(), TransportError> {
        self.sent.lock().await.push(packet);
        Ok(())
    }
}
