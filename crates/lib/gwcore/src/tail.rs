//! Bounded-tail byte buffer capturing a subprocess's stderr, plus a
//! line-splitting writer that forwards to the structured logger.
//!
//! Stderr is both logged at error level and retained so the framing
//! adapter can surface it when the upstream exits unexpectedly.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::error;

/// Thread-safe bounded tail of the most recent bytes written to it.
pub struct TailBuffer {
    max_bytes: usize,
    buf: Mutex<VecDeque<u8>>,
}

impl TailBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            buf: Mutex::new(VecDeque::with_capacity(max_bytes.min(4096))),
        }
    }

    pub fn push_line(&self, line: &str) {
        let mut buf = self.buf.lock().expect("tail buffer mutex poisoned");
        for byte in line.bytes().chain(std::iter::once(b'\n')) {
            if buf.len() >= self.max_bytes {
                buf.pop_front();
            }
            buf.push_back(byte);
        }
    }

    pub fn snapshot(&self) -> String {
        let buf = self.buf.lock().expect("tail buffer mutex poisoned");
        String::from_utf8_lossy(&buf.iter().copied().collect::<Vec<u8>>()).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.lock().expect("tail buffer mutex poisoned").is_empty()
    }
}

/// Default tail capacity: enough for a handful of diagnostic lines without
/// holding an unbounded amount of upstream chatter.
pub const DEFAULT_TAIL_BYTES: usize = 16 * 1024;

/// Spawn a task that copies `reader` line-by-line to the structured logger
/// at error level and into `tail`, for as long as the stream stays open.
pub fn spawn_stderr_copier<R>(
    reader: R,
    tail: std::sync::Arc<TailBuffer>,
    source: String,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    error!(upstream = %source, "{line}");
                    tail.push_line(&line);
                }
                Ok(None) => break,
                Err(err) => {
                    error!(upstream = %source, error = %err, "stderr copier read error");
                    break;
                }
            }
        }
    })
}
