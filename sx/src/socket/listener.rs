//! Unix socket broker
//!
//! Each accepted connection gets a reader loop and a writer task. Replies
//! and deliveries share the writer's channel, so a connection sees them in
//! the order the broker produced them.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use eyre::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{FRAME_READ_LIMIT, MAX_FRAME_SIZE, discard_line, is_oversized};
use super::messages::{ClientFrame, ServerFrame};
use crate::error::TransportError;
use crate::router::{ConnectionId, TopicRouter};
use crate::sync::lock;

#[derive(Default)]
struct BrokerState {
    router: TopicRouter,
    connections: HashMap<ConnectionId, mpsc::UnboundedSender<ServerFrame>>,
    next_connection: ConnectionId,
}

/// Topic broker served over a Unix domain socket
#[derive(Debug, Clone)]
pub struct SocketBroker {
    socket_path: PathBuf,
}

impl SocketBroker {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until `shutdown` resolves, then remove the socket
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (listener, socket_path) = create_listener_at(&self.socket_path)?;
        info!(?socket_path, "Broker listening");

        let state = Arc::new(Mutex::new(BrokerState::default()));
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Broker shutdown requested");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let id = {
                            let mut state = lock(&state);
                            state.next_connection += 1;
                            state.next_connection
                        };
                        tokio::spawn(serve_connection(stream, id, Arc::clone(&state)));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
            }
        }

        cleanup_socket(&socket_path);
        Ok(())
    }
}

/// Bind a listener at `socket_path`, creating its directory and replacing a stale socket
pub fn create_listener_at(socket_path: &Path) -> Result<(UnixListener, PathBuf)> {
    debug!(?socket_path, "create_listener_at: creating broker socket");

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create socket directory")?;
    }

    if socket_path.exists() {
        debug!(?socket_path, "create_listener_at: removing stale socket");
        std::fs::remove_file(socket_path).context("Failed to remove stale socket")?;
    }

    let listener = UnixListener::bind(socket_path).context("Failed to bind broker socket")?;
    Ok((listener, socket_path.to_path_buf()))
}

/// Remove the socket file on shutdown
pub fn cleanup_socket(socket_path: &Path) {
    if socket_path.exists() {
        debug!(?socket_path, "cleanup_socket: removing socket file");
        if let Err(e) = std::fs::remove_file(socket_path) {
            warn!(?socket_path, error = %e, "Failed to remove socket file");
        }
    }
}

async fn serve_connection(stream: UnixStream, id: ConnectionId, state: Arc<Mutex<BrokerState>>) {
    debug!(connection = id, "serve_connection: accepted");
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    lock(&state).connections.insert(id, tx.clone());
    let writer = tokio::spawn(write_frames(write_half, rx, id));

    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();
    loop {
        line.clear();
        match (&mut reader).take(FRAME_READ_LIMIT).read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection = id, error = %e, "serve_connection: read failed");
                break;
            }
        }
        if is_oversized(&line) {
            let _ = tx.send(ServerFrame::Error {
                message: format!("Frame too large: more than {MAX_FRAME_SIZE} bytes"),
            });
            if let Err(e) = discard_line(&mut reader).await {
                debug!(connection = id, error = %e, "serve_connection: read failed");
                break;
            }
            continue;
        }
        let frame: ClientFrame = match serde_json::from_slice(&line) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = tx.send(ServerFrame::Error {
                    message: format!("Failed to parse frame: {e}"),
                });
                continue;
            }
        };

        let closing = matches!(frame, ClientFrame::Close);
        let reply = handle_frame(&state, id, frame).unwrap_or_else(|e| ServerFrame::Error { message: e.to_string() });
        let _ = tx.send(reply);
        if closing {
            break;
        }
    }

    {
        let mut state = lock(&state);
        state.connections.remove(&id);
        state.router.drop_connection(id);
    }
    drop(tx);
    let _ = writer.await;
    debug!(connection = id, "serve_connection: closed");
}

async fn write_frames(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<ServerFrame>, id: ConnectionId) {
    while let Some(frame) = rx.recv().await {
        let Ok(mut json) = serde_json::to_string(&frame) else {
            continue;
        };
        if json.len() > MAX_FRAME_SIZE {
            warn!(connection = id, bytes = json.len(), "write_frames: frame too large for client, dropping");
            continue;
        }
        json.push('\n');
        if let Err(e) = write_half.write_all(json.as_bytes()).await {
            debug!(connection = id, error = %e, "write_frames: peer went away");
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

fn handle_frame(state: &Mutex<BrokerState>, id: ConnectionId, frame: ClientFrame) -> Result<ServerFrame, TransportError> {
    let mut state = lock(state);
    match frame {
        ClientFrame::DeclareExchange { exchange } => {
            state.router.declare_exchange(&exchange);
            Ok(ServerFrame::Ok)
        }
        ClientFrame::DeclareQueue => Ok(ServerFrame::QueueDeclared {
            queue: state.router.declare_queue(id),
        }),
        ClientFrame::BindQueue {
            exchange,
            queue,
            pattern,
        } => {
            state.router.bind(&exchange, &queue, &pattern)?;
            Ok(ServerFrame::Ok)
        }
        ClientFrame::Consume { queue, .. } => {
            let (consumer_tag, backlog) = state.router.consume(id, &queue)?;
            if let Some(tx) = state.connections.get(&id) {
                for delivery in backlog {
                    let _ = tx.send(delivery.into());
                }
            }
            Ok(ServerFrame::ConsumeOk { consumer_tag })
        }
        ClientFrame::Cancel { consumer_tag } => {
            state.router.cancel(id, &consumer_tag)?;
            Ok(ServerFrame::Ok)
        }
        ClientFrame::Publish {
            exchange,
            routing_key,
            body,
        } => {
            let routed = state.router.route(&exchange, &routing_key, &body)?;
            for target in routed {
                if let Some(tx) = state.connections.get(&target.owner) {
                    let _ = tx.send(target.delivery.into());
                }
            }
            Ok(ServerFrame::Ok)
        }
        ClientFrame::Close => Ok(ServerFrame::Ok),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_listener_creates_parent_dir() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("subdir").join("broker.sock");

        let (_, path) = create_listener_at(&socket_path).unwrap();
        assert_eq!(path, socket_path);
        assert!(socket_path.exists());
    }

    #[tokio::test]
    async fn test_create_listener_removes_stale_socket() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("broker.sock");
        std::fs::write(&socket_path, "stale").unwrap();

        assert!(create_listener_at(&socket_path).is_ok());
    }

    #[test]
    fn test_cleanup_socket_handles_missing_file() {
        let temp = TempDir::new().unwrap();
        cleanup_socket(&temp.path().join("nonexistent.sock"));
    }

    #[test]
    fn test_handle_frame_publish_to_unknown_exchange() {
        let state = Mutex::new(BrokerState::default());
        let reply = handle_frame(
            &state,
            1,
            ClientFrame::Publish {
                exchange: "missing".to_string(),
                routing_key: "k".to_string(),
                body: "b".to_string(),
            },
        );
        assert!(matches!(reply, Err(TransportError::UnknownExchange { .. })));
    }

    #[tokio::test]
    async fn test_raw_client_round_trip() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("broker.sock");
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let broker = tokio::spawn(SocketBroker::new(&socket_path).run_until(async {
            let _ = shutdown_rx.await;
        }));
        while !socket_path.exists() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        write_half.write_all(b"{\"type\":\"DeclareQueue\"}\n").await.unwrap();
        let reply: ServerFrame = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(reply, ServerFrame::QueueDeclared { .. }));

        write_half.write_all(b"not json\n").await.unwrap();
        let reply: ServerFrame = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(reply, ServerFrame::Error { .. }));

        shutdown_tx.send(()).unwrap();
        broker.await.unwrap().unwrap();
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected_and_connection_recovers() {
        let temp = TempDir::new().unwrap();
        let socket_path = temp.path().join("broker.sock");
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let broker = tokio::spawn(SocketBroker::new(&socket_path).run_until(async {
            let _ = shutdown_rx.await;
        }));
        while !socket_path.exists() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let mut huge = vec![b'x'; MAX_FRAME_SIZE * 2];
        huge.push(b'\n');
        write_half.write_all(&huge).await.unwrap();
        let reply: ServerFrame = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(reply, ServerFrame::Error { ref message } if message.contains("too large")));

        // the rest of the oversized line was skipped, not parsed as frames
        write_half.write_all(b"{\"type\":\"DeclareQueue\"}\n").await.unwrap();
        let reply: ServerFrame = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(reply, ServerFrame::QueueDeclared { .. }));

        shutdown_tx.send(()).unwrap();
        broker.await.unwrap().unwrap();
    }
}
