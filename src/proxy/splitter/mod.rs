//! Protocol framing for upstream response bodies
//!
//! A [`ChunkSplitter`] turns a continuous byte stream into discrete logical
//! chunks (an SSE event, a JSON document, a length-prefixed binary frame). The
//! response pipeline feeds each chunk through the filter chain in read order.
//!
//! ## Contract
//!
//! | Outcome                    | Meaning                                         |
//! |----------------------------|-------------------------------------------------|
//! | `Ok(SplitOutcome::Chunk)`  | complete chunk, more data expected              |
//! | `Ok(SplitOutcome::Last)`   | final chunk, still carrying data; stream closed |
//! | `Ok(SplitOutcome::End)`    | clean end, nothing left                         |
//! | `Err(_)`                   | fatal, the stream must be aborted               |
//!
//! An empty `Chunk` is a contract violation and is reported by callers as
//! [`SplitError::EmptyChunk`].

pub mod decompress;
pub mod event_stream;
pub mod fixed_size;
pub mod new_line;
pub mod selector;
pub mod sse;
pub mod whole_stream;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt};

pub use decompress::{DecoderFactory, DecompressingSplitter};
pub use event_stream::EventStreamSplitter;
pub use fixed_size::FixedSizeSplitter;
pub use new_line::NewLineSplitter;
pub use selector::SplitterSelector;
pub use sse::SseSplitter;
pub use whole_stream::WholeStreamSplitter;

/// Upstream body as seen by a splitter
pub type BodyReader = Box<dyn AsyncBufRead + Send + Unpin>;

/// Result of one `next_chunk` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitOutcome {
    /// A complete chunk; more data is expected
    Chunk(Bytes),
    /// The last chunk of the stream, still carrying data
    Last(Bytes),
    /// Clean end of stream
    End,
}

impl SplitOutcome {
    /// Wrap a possibly partial buffer read up to end-of-stream
    pub(crate) fn last_or_end(buf: Vec<u8>) -> Self {
        if buf.is_empty() {
            Self::End
        } else {
            Self::Last(Bytes::from(buf))
        }
    }
}

/// Framing errors
#[derive(Error, Debug)]
pub enum SplitError {
    #[error("splitter returned empty chunk without error")]
    EmptyChunk,

    #[error("invalid event-stream frame: {0}")]
    Frame(String),

    #[error("unsupported content-encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("body exceeds the {0}-byte limit")]
    TooLarge(usize),

    #[error("upstream read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Wire framing a splitter implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SplitterKind {
    FixedSize,
    NewLine,
    ServerSentEvents,
    WholeStream,
    EventStream,
}

impl fmt::Display for SplitterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FixedSize => "fixed_size",
            Self::NewLine => "new_line",
            Self::ServerSentEvents => "sse",
            Self::WholeStream => "whole_stream",
            Self::EventStream => "event_stream",
        };
        f.write_str(name)
    }
}

/// Stateful protocol framer, created once per response stream
#[async_trait]
pub trait ChunkSplitter: Send {
    /// The framing this splitter implements
    fn kind(&self) -> SplitterKind;

    /// Whether this splitter can frame a body of the given content type
    fn is_compatible(&self, _content_type: &str) -> bool {
        true
    }

    /// Read the next logical chunk from `reader`
    async fn next_chunk(&mut self, reader: &mut BodyReader) -> Result<SplitOutcome, SplitError>;
}

/// Fill `buf` from `reader`, stopping early only at end of stream
pub(crate) async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
