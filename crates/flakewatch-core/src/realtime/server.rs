use super::{Broadcaster, ClientHandle, LiveEvent};
use crate::errors::{ClientDeliveryError, ConnectionError};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Newline-delimited JSON feed over TCP. Each connection is registered with
/// the broadcaster and served by its own task; observers may send any line
/// back to acknowledge what they have read.
pub struct RealtimeServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    broadcaster: Broadcaster,
}

impl RealtimeServer {
    /// Must be called inside a tokio runtime.
    pub async fn bind(addr: &str, broadcaster: Broadcaster) -> Result<Self, ConnectionError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| ConnectionError {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| ConnectionError {
            addr: addr.to_string(),
            source,
        })?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(listener, broadcaster.clone(), shutdown_rx));
        tracing::info!(event = "realtime_listening", addr = %local_addr);

        Ok(Self {
            local_addr,
            shutdown,
            task,
            broadcaster,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signals the accept loop and every client task to stop. Safe to call
    /// from outside the runtime.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.broadcaster.close_all();
    }

    /// Stops accepting, closes all clients and waits for the listener to be released.
    pub async fn shutdown(self) {
        self.signal_shutdown();
        if let Err(e) = self.task.await {
            tracing::warn!(event = "realtime_join_failed", error = %e);
        }
        tracing::info!(event = "realtime_stopped", addr = %self.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    broadcaster: Broadcaster,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut clients = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let handle = broadcaster.register_client();
                    tracing::info!(event = "client_connected", client_id = handle.id(), peer = %peer);
                    clients.spawn(serve_client(stream, handle, shutdown.clone()));
                }
                Err(e) => {
                    let err = ConnectionError {
                        addr: listener
                            .local_addr()
                            .map(|a| a.to_string())
                            .unwrap_or_default(),
                        source: e,
                    };
                    tracing::error!(event = "realtime_accept_failed", error = %err);
                    break;
                }
            },
            Some(_) = clients.join_next(), if !clients.is_empty() => {}
        }
    }
    drop(listener);
    // Clients are not drained; pending writes are abandoned.
    clients.abort_all();
    while clients.join_next().await.is_some() {}
}

async fn serve_client(stream: TcpStream, mut handle: ClientHandle, mut shutdown: watch::Receiver<bool>) {
    let client_id = handle.id();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    // EOF on the read side only ends acks; a half-closed observer still
    // receives events until a write fails.
    let mut reading = true;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            incoming = lines.next_line(), if reading => match incoming {
                Ok(Some(_)) => handle.ack(),
                Ok(None) => {
                    tracing::debug!(event = "client_read_closed", client_id);
                    reading = false;
                }
                Err(e) => {
                    tracing::debug!(event = "client_disconnected", client_id, error = %e);
                    break;
                }
            },
            next = handle.recv() => match next {
                Some(event) => {
                    if let Err(e) = write_event(&mut write_half, client_id, &event).await {
                        tracing::warn!(event = "client_dropped", client_id, error = %e);
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = write_half.shutdown().await;
}

async fn write_event(
    out: &mut OwnedWriteHalf,
    client_id: u64,
    event: &LiveEvent,
) -> Result<(), ClientDeliveryError> {
    let mut line = serde_json::to_vec(event)
        .map_err(|source| ClientDeliveryError::Encode { client_id, source })?;
    line.push(b'\n');

    let write = async {
        out.write_all(&line).await?;
        out.flush().await
    };
    match tokio::time::timeout(WRITE_TIMEOUT, write).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(ClientDeliveryError::Io { client_id, source }),
        Err(_) => Err(ClientDeliveryError::Timeout {
            client_id,
            after_ms: WRITE_TIMEOUT.as_millis() as u64,
        }),
    }
}
