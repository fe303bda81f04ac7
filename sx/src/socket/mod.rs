//! Topic broker over a Unix domain socket
//!
//! `SocketBroker` serves the routing table to other processes; each
//! `SocketTransport` is one blocking connection to it. Frames are
//! newline-delimited JSON.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

pub mod client;
pub mod listener;
pub mod messages;

pub use client::{SocketConnector, SocketTransport};
pub use listener::{SocketBroker, cleanup_socket, create_listener_at};
pub use messages::{ClientFrame, ServerFrame};

/// Largest frame either side accepts
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Read cap per frame: the largest payload plus its newline
pub(crate) const FRAME_READ_LIMIT: u64 = MAX_FRAME_SIZE as u64 + 1;

/// True when `buf` filled the read cap without reaching a newline
pub(crate) fn is_oversized(buf: &[u8]) -> bool {
    buf.len() > MAX_FRAME_SIZE && buf.last() != Some(&b'\n')
}

/// Skip the rest of the current line without buffering it
pub(crate) async fn discard_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<()> {
    loop {
        let (consumed, done) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(());
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(i) => (i + 1, true),
                None => (available.len(), false),
            }
        };
        reader.consume(consumed);
        if done {
            return Ok(());
        }
    }
}
