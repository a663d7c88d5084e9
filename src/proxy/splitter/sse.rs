//! Server-Sent Events framing

use crate::proxy::splitter::{BodyReader, ChunkSplitter, SplitError, SplitOutcome, SplitterKind};
use async_trait::async_trait;
use bytes::BytesMut;
use memchr::memmem;
use tokio::io::AsyncBufReadExt;

const EVENT_DELIMITER: &[u8] = b"\n\n";

/// One SSE event per chunk, the blank-line delimiter included
#[derive(Default)]
pub struct SseSplitter {
    pending: BytesMut,
    // Bytes of `pending` already searched for a delimiter
    scanned: usize,
}

impl SseSplitter {
    fn take_event(&mut self) -> Option<BytesMut> {
        let from = self.scanned.saturating_sub(EVENT_DELIMITER.len() - 1);
        match memmem::find(&self.pending[from..], EVENT_DELIMITER) {
            Some(pos) => {
                self.scanned = 0;
                Some(self.pending.split_to(from + pos + EVENT_DELIMITER.len()))
            }
            None => {
                self.scanned = self.pending.len();
                None
            }
        }
    }
}

#[async_trait]
impl ChunkSplitter for SseSplitter {
    fn kind(&self) -> SplitterKind {
        SplitterKind::ServerSentEvents
    }

    async fn next_chunk(&mut self, reader: &mut BodyReader) -> Result<SplitOutcome, SplitError> {
        loop {
            if let Some(event) = self.take_event() {
                return Ok(SplitOutcome::Chunk(event.freeze()));
            }

            let available = reader.fill_buf().await?;
            if available.is_empty() {
                let rest = self.pending.split().to_vec();
                self.scanned = 0;
                return Ok(SplitOutcome::last_or_end(rest));
            }
            let n = available.len();
            self.pending.extend_from_slice(available);
            reader.consume(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::splitter::test_support::{concat, drain, reader, segmented};
    use bytes::Bytes;

    #[tokio::test]
    async fn test_single_event_round_trip() {
        let input = b"event: x\ndata: y\n\n";
        let mut splitter = SseSplitter::default();
        let mut body = reader(input);

        let outcomes = drain(&mut splitter, &mut body).await;

        assert_eq!(
            outcomes,
            vec![
                SplitOutcome::Chunk(Bytes::from_static(input)),
                SplitOutcome::End
            ]
        );
    }

    #[tokio::test]
    async fn test_delimiter_split_across_reads() {
        let mut splitter = SseSplitter::default();
        let mut body = segmented(&[b"data: a\n", b"\ndata: b", b"\n\n"]);

        let outcomes = drain(&mut splitter, &mut body).await;

        assert_eq!(
            outcomes,
            vec![
                SplitOutcome::Chunk(Bytes::from_static(b"data: a\n\n")),
                SplitOutcome::Chunk(Bytes::from_static(b"data: b\n\n")),
                SplitOutcome::End,
            ]
        );
    }

    #[tokio::test]
    async fn test_several_events_in_one_read() {
        let mut splitter = SseSplitter::default();
        let mut body = reader(b"data: 1\n\ndata: 2\n\ndata: [DONE]\n\n");

        let outcomes = drain(&mut splitter, &mut body).await;

        assert_eq!(outcomes.len(), 4);
        assert_eq!(
            outcomes[2],
            SplitOutcome::Chunk(Bytes::from_static(b"data: [DONE]\n\n"))
        );
    }

    #[tokio::test]
    async fn test_partial_event_at_eof_is_last() {
        let mut splitter = SseSplitter::default();
        let mut body = segmented(&[b"data: 1\n\n", b"data: trunc"]);

        let outcomes = drain(&mut splitter, &mut body).await;

        assert_eq!(
            outcomes,
            vec![
                SplitOutcome::Chunk(Bytes::from_static(b"data: 1\n\n")),
                SplitOutcome::Last(Bytes::from_static(b"data: trunc")),
            ]
        );
        assert_eq!(concat(&outcomes), b"data: 1\n\ndata: trunc");
    }
}
