//! Leaf destinations for remote output that is not relayed to the operator.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;

/// Accumulates everything written to it, for inspecting short command output.
#[derive(Debug, Default)]
pub struct CaptureSink {
    buffer: Vec<u8>,
    limit: Option<usize>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` bytes; the rest is accepted and dropped.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit: Some(limit),
        }
    }

    pub fn contents(&self) -> &[u8] {
        &self.buffer
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.buffer).trim().to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl AsyncWrite for CaptureSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let take = match this.limit {
            Some(limit) => buf.len().min(limit.saturating_sub(this.buffer.len())),
            None => buf.len(),
        };
        this.buffer.extend_from_slice(&buf[..take]);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Drains a stream without keeping it, so the far end never blocks on us.
#[derive(Debug, Default)]
pub struct DiscardSink {
    discarded: u64,
}

impl DiscardSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

impl AsyncWrite for DiscardSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().discarded += buf.len() as u64;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
