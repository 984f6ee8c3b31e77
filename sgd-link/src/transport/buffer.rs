//! Inbound byte buffer with pattern waiters.
//!
//! The read task appends every chunk it receives; foreground code waits for
//! a marker to show up and consumes the buffer up to that marker. Matching
//! always consumes from the front, so waits must be issued in the order the
//! device produces the markers.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{self, Instant};

use crate::error::{Error, Result};
use crate::tracing::prelude::*;

/// Bytes kept when nothing consumes the buffer; older bytes are dropped.
pub const MAX_BUFFERED: usize = 64 * 1024;

/// Accumulator shared between the read task and waiters.
#[derive(Debug, Default)]
pub struct InboundBuffer {
    data: Mutex<BytesMut>,
    appended: Notify,
}

impl InboundBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a received chunk and wake every pending waiter.
    pub fn append(&self, chunk: &[u8]) {
        {
            let mut data = self.data.lock();
            data.extend_from_slice(chunk);
            if data.len() > MAX_BUFFERED {
                let excess = data.len() - MAX_BUFFERED;
                trace!(dropped = excess, "Inbound buffer full");
                let _ = data.split_to(excess);
            }
        }
        self.appended.notify_waiters();
    }

    /// Discard everything received so far.
    pub fn clear(&self) {
        let mut data = self.data.lock();
        if !data.is_empty() {
            trace!(discarded = data.len(), "Clearing inbound buffer");
        }
        data.clear();
    }

    /// Copy of the unconsumed bytes.
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data.lock())
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until `pattern` appears, then consume and return everything up
    /// to and including it. On timeout the buffer is left as it was.
    pub async fn wait_for_pattern(&self, pattern: &str, timeout: Duration) -> Result<String> {
        let needle = pattern.as_bytes();
        self.wait_until(pattern, timeout, |data| {
            let end = find(data, needle)? + needle.len();
            Some(lossy(&data.split_to(end)))
        })
        .await
    }

    /// Wait for a completed line containing `needle`. Every line up to and
    /// including the match is consumed; the line is returned without its
    /// terminator. A trailing line with no newline yet is never matched.
    pub async fn wait_for_line(&self, needle: &str, timeout: Duration) -> Result<String> {
        let needle_bytes = needle.as_bytes();
        self.wait_until(needle, timeout, |data| {
            let mut start = 0;
            while let Some(offset) = data[start..].iter().position(|&b| b == b'\n') {
                let newline = start + offset;
                if find(&data[start..newline], needle_bytes).is_some() {
                    let consumed = data.split_to(newline + 1);
                    let line = strip_line_ending(&consumed[start..]);
                    return Some(lossy(line));
                }
                start = newline + 1;
            }
            None
        })
        .await
    }

    /// Wait for the first byte that belongs to `set`, consuming up to and
    /// including it.
    pub async fn wait_for_any_byte(&self, set: &[u8], timeout: Duration) -> Result<u8> {
        let what = hex::encode(set);
        self.wait_until(&what, timeout, |data| {
            let index = data.iter().position(|b| set.contains(b))?;
            let consumed = data.split_to(index + 1);
            Some(consumed[index])
        })
        .await
    }

    // Run `take` against the buffer each time it grows until it yields a
    // value or the deadline passes. The notification is armed before each
    // scan so an append racing with the scan still wakes us.
    async fn wait_until<T>(
        &self,
        what: &str,
        timeout: Duration,
        mut take: impl FnMut(&mut BytesMut) -> Option<T>,
    ) -> Result<T> {
        let deadline = Instant::now() + timeout;

        loop {
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let found = {
                let mut data = self.data.lock();
                take(&mut *data)
            };
            if let Some(found) = found {
                return Ok(found);
            }

            if time::timeout_at(deadline, appended).await.is_err() {
                debug!(what, timeout_ms = timeout.as_millis() as u64, "Wait timed out");
                return Err(Error::Timeout {
                    what: what.to_string(),
                    timeout,
                });
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
