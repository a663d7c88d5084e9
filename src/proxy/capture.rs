//! Head-and-tail body capture for audit notes

use crate::proxy::types::CaptureConfig;
use std::collections::VecDeque;

/// Keep the first `head` and last `tail` bytes of `body`, noting what was cut
///
/// Bodies no longer than `head + tail` come back unchanged.
pub fn truncate(body: &[u8], head: usize, tail: usize) -> String {
    if body.len() <= head.saturating_add(tail) {
        return String::from_utf8_lossy(body).into_owned();
    }
    render(&body[..head], body.len() - head - tail, &body[body.len() - tail..])
}

fn render(head: &[u8], omitted: usize, tail: &[u8]) -> String {
    format!(
        "{}...[omitted {omitted} bytes]...{}",
        String::from_utf8_lossy(head),
        String::from_utf8_lossy(tail)
    )
}

/// Streaming counterpart of [`truncate`]
///
/// Retains at most `head + tail` bytes regardless of how much is pushed.
#[derive(Debug, Clone)]
pub struct BoundedCapture {
    head_len: usize,
    tail_len: usize,
    head: Vec<u8>,
    tail: VecDeque<u8>,
    total: usize,
}

impl BoundedCapture {
    pub fn new(head: usize, tail: usize) -> Self {
        Self {
            head_len: head,
            tail_len: tail,
            head: Vec::with_capacity(head.min(8 * 1024)),
            tail: VecDeque::new(),
            total: 0,
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(*config.head.as_ref(), *config.tail.as_ref())
    }

    pub fn push(&mut self, mut bytes: &[u8]) {
        self.total += bytes.len();

        let room = self.head_len - self.head.len();
        if room > 0 {
            let take = room.min(bytes.len());
            self.head.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
        }

        if bytes.len() >= self.tail_len {
            self.tail.clear();
            self.tail.extend(&bytes[bytes.len() - self.tail_len..]);
        } else {
            self.tail.extend(bytes);
            let excess = self.tail.len().saturating_sub(self.tail_len);
            self.tail.drain(..excess);
        }
    }

    /// Bytes pushed so far
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn render(&self) -> String {
        let (front, back) = self.tail.as_slices();
        let tail = [front, back].concat();
        if self.total <= self.head_len + self.tail_len {
            let mut all = self.head.clone();
            all.extend_from_slice(&tail);
            return String::from_utf8_lossy(&all).into_owned();
        }
        render(&self.head, self.total - self.head_len - self.tail_len, &tail)
    }
}
