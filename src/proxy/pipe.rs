//! Byte relay between a client connection and an upgrade backend
//!
//! One task per direction; each reports its terminal event on a shared
//! channel and the session acts on whichever arrives first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Relay read size, matching the session's initial burst buffer
pub(crate) const RELAY_BUF_SIZE: usize = 54 * 1024;

/// Terminal event of one relay direction
#[derive(Debug)]
pub enum PipeEnd {
    /// Source reached end of stream
    Eof,
    /// Read or write failed mid-relay
    Failed(std::io::Error),
}

/// Copy bytes from `src` to `dst` until EOF or failure
///
/// Forwarded byte counts accumulate into `copied` after each completed
/// write. The terminal event is sent on `done`; a dropped receiver is
/// ignored since the session may already be tearing down.
pub async fn relay_stream<S, D>(
    mut src: S,
    mut dst: D,
    copied: Arc<AtomicU64>,
    done: mpsc::Sender<PipeEnd>,
) where
    S: AsyncRead + Unpin,
    D: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    loop {
        match src.read(&mut buf).await {
            Ok(0) => {
                let _ = done.send(PipeEnd::Eof).await;
                return;
            }
            Ok(n) => {
                if let Err(e) = dst.write_all(&buf[..n]).await {
                    let _ = done.send(PipeEnd::Failed(e)).await;
                    return;
                }
                copied.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                let _ = done.send(PipeEnd::Failed(e)).await;
                return;
            }
        }
    }
}
