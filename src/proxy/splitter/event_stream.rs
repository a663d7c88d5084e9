//! AWS event-stream framing (`application/vnd.amazon.eventstream`)
//!
//! Each message starts with an 8-byte prelude: a big-endian `u32` total
//! length followed by a big-endian `u32` headers length. The total length
//! covers the whole message, prelude and trailing CRC included. Frames are
//! forwarded opaque; nothing is stripped or validated beyond the length.

use crate::proxy::splitter::{
    read_full, BodyReader, ChunkSplitter, SplitError, SplitOutcome, SplitterKind,
};
use crate::proxy::types::MaxFrameSize;
use async_trait::async_trait;
use bytes::Bytes;

/// Content type this framing is restricted to
pub const EVENT_STREAM_CONTENT_TYPE: &str = "application/vnd.amazon.eventstream";

const PRELUDE_LEN: usize = 8;
/// Prelude, prelude CRC and message CRC with no headers and no payload
const MIN_FRAME_LEN: usize = 16;

/// One length-prefixed binary frame per chunk
pub struct EventStreamSplitter {
    max_frame: usize,
}

impl EventStreamSplitter {
    pub fn new(max_frame: MaxFrameSize) -> Self {
        Self {
            max_frame: *max_frame.as_ref(),
        }
    }
}

impl Default for EventStreamSplitter {
    fn default() -> Self {
        Self {
            max_frame: 16 * 1024 * 1024,
        }
    }
}

#[async_trait]
impl ChunkSplitter for EventStreamSplitter {
    fn kind(&self) -> SplitterKind {
        SplitterKind::EventStream
    }

    fn is_compatible(&self, content_type: &str) -> bool {
        content_type.starts_with(EVENT_STREAM_CONTENT_TYPE)
    }

    async fn next_chunk(&mut self, reader: &mut BodyReader) -> Result<SplitOutcome, SplitError> {
        let mut prelude = [0u8; PRELUDE_LEN];
        let got = read_full(reader, &mut prelude).await?;
        if got < PRELUDE_LEN {
            return Ok(SplitOutcome::last_or_end(prelude[..got].to_vec()));
        }

        let total = u32::from_be_bytes([prelude[0], prelude[1], prelude[2], prelude[3]]) as usize;
        if total < MIN_FRAME_LEN {
            return Err(SplitError::Frame(format!(
                "declared length {total} is below the {MIN_FRAME_LEN}-byte minimum"
            )));
        }
        if total > self.max_frame {
            return Err(SplitError::Frame(format!(
                "declared length {total} exceeds the {}-byte limit",
                self.max_frame
            )));
        }

        let mut frame = vec![0u8; total];
        frame[..PRELUDE_LEN].copy_from_slice(&prelude);
        let got = read_full(reader, &mut frame[PRELUDE_LEN..]).await?;
        if PRELUDE_LEN + got < total {
            frame.truncate(PRELUDE_LEN + got);
            return Ok(SplitOutcome::Last(Bytes::from(frame)));
        }
        Ok(SplitOutcome::Chunk(Bytes::from(frame)))
    }
}
