//! Persistent WebSocket uplink from a transcoder's stdout to the relay's
//! `/ws/produce/{stream_key}` endpoint, with reconnect/backoff (§4.4.2).

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::process::ChildStdout;
use tokio::time::{interval, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use core_common::backoff::Backoff;
use core_common::model::StreamDescriptor;

const CHUNK_SIZE: usize = 8 * 1024;
const STARTUP_WAIT: Duration = Duration::from_secs(10);
const STARTUP_POLL_GRANULARITY: Duration = Duration::from_millis(100);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);
const LOG_CADENCE_BYTES: u64 = 1024 * 1024;

/// Pumps bytes from `stdout` to the relay until `stdout` closes (the
/// transcoder exited) or the caller drops the handle. Reconnects the
/// socket with backoff on any send/read error; each reconnect starts a
/// fresh byte loop since a new producer connection must re-send the init
/// segment.
pub async fn run(
    relay_base: &str,
    stream_key: &str,
    mut stdout: ChildStdout,
    descriptor: Arc<Mutex<StreamDescriptor>>,
) {
    if !wait_for_first_byte(&mut stdout).await {
        warn!(stream_key, "transcoder produced no output within startup window");
        return;
    }

    let mut backoff = Backoff::uplink_default();
    let url = format!("{relay_base}/ws/produce/{stream_key}");

    loop {
        match connect_async(&url).await {
            Ok((socket, _response)) => {
                backoff.reset();
                info!(stream_key, %url, "uplink connected");
                if let Err(e) = pump(socket, &mut stdout, stream_key, &descriptor).await {
                    warn!(stream_key, error = %e, "uplink session ended, reconnecting");
                } else {
                    info!(stream_key, "transcoder output closed, uplink stopping");
                    return;
                }
            }
            Err(e) => {
                warn!(stream_key, error = %e, "uplink connect failed");
            }
        }

        let delay = backoff.next_delay();
        tokio::time::sleep(delay).await;
    }
}

/// Waits up to 10 s for the transcoder to produce its first byte, polling
/// readiness at 100 ms granularity rather than blocking indefinitely on a
/// cold pipe.
async fn wait_for_first_byte(stdout: &mut ChildStdout) -> bool {
    let deadline = tokio::time::Instant::now() + STARTUP_WAIT;
    let mut probe = [0u8; 1];
    while tokio::time::Instant::now() < deadline {
        match timeout(STARTUP_POLL_GRANULARITY, stdout.read(&mut probe)).await {
            Ok(Ok(n)) if n > 0 => return true,
            Ok(Ok(_)) => return false,
            Ok(Err(_)) => return false,
            Err(_) => continue,
        }
    }
    false
}

async fn pump(
    socket: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    stdout: &mut ChildStdout,
    stream_key: &str,
    descriptor: &Arc<Mutex<StreamDescriptor>>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let (mut sink, mut stream) = socket.split();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total_sent: u64 = 0;
    let mut next_log_at: u64 = LOG_CADENCE_BYTES;
    let mut keepalive = interval(KEEPALIVE_INTERVAL);
    keepalive.tick().await;

    loop {
        tokio::select! {
            read = stdout.read(&mut buf) => {
                let n = read.map_err(|e| {
                    tokio_tungstenite::tungstenite::Error::Io(e)
                })?;
                if n == 0 {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                sink.send(Message::Binary(buf[..n].to_vec())).await?;
                total_sent += n as u64;
                descriptor.lock().bytes_sent = total_sent;
                if total_sent >= next_log_at {
                    info!(stream_key, total_sent, "uplink bytes sent");
                    next_log_at += LOG_CADENCE_BYTES;
                }
                keepalive.reset();
            }
            _ = keepalive.tick() => {
                sink.send(Message::Ping(Vec::new())).await?;
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => return Err(
                        tokio_tungstenite::tungstenite::Error::ConnectionClosed
                    ),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_matches_spec() {
        assert_eq!(CHUNK_SIZE, 8192);
    }

    #[test]
    fn keepalive_interval_matches_spec() {
        assert_eq!(KEEPALIVE_INTERVAL, Duration::from_secs(25));
    }
}
