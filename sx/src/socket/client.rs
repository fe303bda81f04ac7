//! Blocking client transport for the socket broker
//!
//! The transport owns a private current-thread runtime and drives every
//! socket operation through it, so from the outside it behaves like any
//! other blocking, single-threaded client.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::runtime::Runtime;
use tracing::{debug, warn};

use super::{FRAME_READ_LIMIT, MAX_FRAME_SIZE, is_oversized};
use super::messages::{ClientFrame, ServerFrame};
use crate::error::TransportError;
use crate::transport::{Connector, Delivery, Transport};

/// Default timeout for connecting and for each request/reply exchange
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens [`SocketTransport`] connections to a broker socket
#[derive(Debug, Clone)]
pub struct SocketConnector {
    socket_path: PathBuf,
    timeout: Duration,
}

impl SocketConnector {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set a custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check if the broker socket exists
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }
}

impl Connector for SocketConnector {
    type Transport = SocketTransport;

    fn open_connection(&self) -> Result<SocketTransport, TransportError> {
        SocketTransport::connect(&self.socket_path, self.timeout)
    }
}

/// One blocking connection to a [`SocketBroker`](super::SocketBroker)
pub struct SocketTransport {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    // holds a partial line across poll timeouts
    line: Vec<u8>,
    pending: VecDeque<Delivery>,
    timeout: Duration,
    open: bool,
    // dropped after the socket halves registered with it
    runtime: Runtime,
}

impl SocketTransport {
    pub fn connect(socket_path: &Path, timeout: Duration) -> Result<Self, TransportError> {
        debug!(?socket_path, "SocketTransport::connect: called");
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let stream = runtime
            .block_on(async { tokio::time::timeout(timeout, UnixStream::connect(socket_path)).await })
            .map_err(|_| TransportError::Timeout(timeout))??;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer,
            line: Vec::new(),
            pending: VecDeque::new(),
            timeout,
            open: true,
            runtime,
        })
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.open {
            Ok(())
        } else {
            Err(TransportError::ConnectionClosed)
        }
    }

    fn send_frame(&mut self, frame: &ClientFrame) -> Result<(), TransportError> {
        let mut json = serde_json::to_string(frame)?;
        if json.len() > MAX_FRAME_SIZE {
            return Err(TransportError::Protocol(format!("Frame too large: {} bytes", json.len())));
        }
        json.push('\n');

        let timeout = self.timeout;
        let Self { runtime, writer, .. } = self;
        let written = runtime
            .block_on(async {
                tokio::time::timeout(timeout, async {
                    writer.write_all(json.as_bytes()).await?;
                    writer.flush().await
                })
                .await
            })
            .map_err(|_| TransportError::Timeout(timeout))?;
        if let Err(e) = written {
            self.open = false;
            return Err(e.into());
        }
        Ok(())
    }

    /// Read one frame, waiting at most `limit`. `None` means nothing arrived.
    fn read_frame(&mut self, limit: Duration) -> Result<Option<ServerFrame>, TransportError> {
        let Self {
            runtime, reader, line, ..
        } = self;
        // bytes kept from an earlier timed-out read count against the cap
        let remaining = FRAME_READ_LIMIT.saturating_sub(line.len() as u64);
        let read = runtime.block_on(async {
            tokio::time::timeout(limit, (&mut *reader).take(remaining).read_until(b'\n', line)).await
        });
        match read {
            Err(_) => Ok(None),
            Ok(Err(e)) => {
                self.open = false;
                Err(e.into())
            }
            Ok(Ok(0)) => {
                self.open = false;
                Err(TransportError::ConnectionClosed)
            }
            Ok(Ok(_)) if is_oversized(&self.line) => {
                self.line.clear();
                self.open = false;
                Err(TransportError::Protocol(format!(
                    "Frame too large: more than {MAX_FRAME_SIZE} bytes"
                )))
            }
            Ok(Ok(_)) => {
                let frame = serde_json::from_slice(&self.line);
                self.line.clear();
                Ok(Some(frame?))
            }
        }
    }

    /// Send a request and wait for its reply, buffering deliveries that
    /// arrive first
    fn request(&mut self, frame: ClientFrame) -> Result<ServerFrame, TransportError> {
        self.ensure_open()?;
        self.send_frame(&frame)?;
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.read_frame(remaining)? {
                Some(ServerFrame::Deliver {
                    consumer_tag,
                    exchange,
                    routing_key,
                    body,
                }) => self.pending.push_back(Delivery {
                    consumer_tag,
                    exchange,
                    routing_key,
                    body,
                }),
                Some(ServerFrame::Error { message }) => return Err(TransportError::Broker(message)),
                Some(reply) => return Ok(reply),
                None => return Err(TransportError::Timeout(self.timeout)),
            }
        }
    }

    fn expect_ok(&mut self, frame: ClientFrame) -> Result<(), TransportError> {
        match self.request(frame)? {
            ServerFrame::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    fn absorb(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::Deliver {
                consumer_tag,
                exchange,
                routing_key,
                body,
            } => self.pending.push_back(Delivery {
                consumer_tag,
                exchange,
                routing_key,
                body,
            }),
            ServerFrame::Error { message } => warn!(%message, "Broker reported an error"),
            other => warn!(?other, "Unexpected frame while polling"),
        }
    }
}

fn unexpected(frame: &ServerFrame) -> TransportError {
    TransportError::Protocol(format!("Unexpected reply: {frame:?}"))
}

impl Transport for SocketTransport {
    fn declare_topic_exchange(&mut self, name: &str) -> Result<(), TransportError> {
        self.expect_ok(ClientFrame::DeclareExchange {
            exchange: name.to_string(),
        })
    }

    fn declare_exclusive_queue(&mut self) -> Result<String, TransportError> {
        match self.request(ClientFrame::DeclareQueue)? {
            ServerFrame::QueueDeclared { queue } => Ok(queue),
            other => Err(unexpected(&other)),
        }
    }

    fn bind_queue(&mut self, exchange: &str, queue: &str, pattern: &str) -> Result<(), TransportError> {
        self.expect_ok(ClientFrame::BindQueue {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            pattern: pattern.to_string(),
        })
    }

    fn basic_consume(&mut self, queue: &str, auto_ack: bool) -> Result<String, TransportError> {
        let frame = ClientFrame::Consume {
            queue: queue.to_string(),
            auto_ack,
        };
        match self.request(frame)? {
            ServerFrame::ConsumeOk { consumer_tag } => Ok(consumer_tag),
            other => Err(unexpected(&other)),
        }
    }

    fn basic_cancel(&mut self, consumer_tag: &str) -> Result<(), TransportError> {
        self.expect_ok(ClientFrame::Cancel {
            consumer_tag: consumer_tag.to_string(),
        })
    }

    fn publish(&mut self, exchange: &str, routing_key: &str, body: &str) -> Result<(), TransportError> {
        self.expect_ok(ClientFrame::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_string(),
        })
    }

    fn poll_once(&mut self, time_limit: Duration) -> Result<Vec<Delivery>, TransportError> {
        self.ensure_open()?;
        if self.pending.is_empty() {
            match self.read_frame(time_limit)? {
                Some(frame) => self.absorb(frame),
                None => return Ok(Vec::new()),
            }
        }
        // take whatever else is already readable
        while let Some(frame) = self.read_frame(Duration::ZERO)? {
            self.absorb(frame);
        }
        Ok(self.pending.drain(..).collect())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.ensure_open()?;
        debug!("SocketTransport::close: called");
        let reply = self.request(ClientFrame::Close);
        self.open = false;
        let Self { runtime, writer, .. } = self;
        let _ = runtime.block_on(writer.shutdown());
        if let Err(e) = reply {
            debug!(error = %e, "SocketTransport::close: broker did not confirm");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
