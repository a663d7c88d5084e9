//! Fixed-size framing for opaque bodies

use crate::proxy::splitter::{BodyReader, ChunkSplitter, SplitError, SplitOutcome, SplitterKind};
use crate::proxy::types::{ChunkSize, DEFAULT_CHUNK_SIZE};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncReadExt;

/// Emits whatever a single read returns, up to `size` bytes
pub struct FixedSizeSplitter {
    size: usize,
}

impl FixedSizeSplitter {
    pub fn new(size: ChunkSize) -> Self {
        Self {
            size: *size.as_ref(),
        }
    }
}

impl Default for FixedSizeSplitter {
    fn default() -> Self {
        Self {
            size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[async_trait]
impl ChunkSplitter for FixedSizeSplitter {
    fn kind(&self) -> SplitterKind {
        SplitterKind::FixedSize
    }

    async fn next_chunk(&mut self, reader: &mut BodyReader) -> Result<SplitOutcome, SplitError> {
        let mut buf = vec![0u8; self.size];
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(SplitOutcome::End);
        }
        buf.truncate(n);
        Ok(SplitOutcome::Chunk(Bytes::from(buf)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::splitter::test_support::{concat, drain, reader, segmented};

    #[tokio::test]
    async fn test_reads_at_most_chunk_size() {
        let mut splitter = FixedSizeSplitter::new(ChunkSize::try_new(4).unwrap());
        let mut body = reader(b"abcdefghij");

        let outcomes = drain(&mut splitter, &mut body).await;

        assert_eq!(
            outcomes,
            vec![
                SplitOutcome::Chunk(Bytes::from_static(b"abcd")),
                SplitOutcome::Chunk(Bytes::from_static(b"efgh")),
                SplitOutcome::Chunk(Bytes::from_static(b"ij")),
                SplitOutcome::End,
            ]
        );
    }

    #[tokio::test]
    async fn test_does_not_wait_for_a_full_chunk() {
        let mut splitter = FixedSizeSplitter::default();
        let mut body = segmented(&[b"ab", b"cd"]);

        let first = splitter.next_chunk(&mut body).await.unwrap();
        assert_eq!(first, SplitOutcome::Chunk(Bytes::from_static(b"ab")));

        let rest = drain(&mut splitter, &mut body).await;
        assert_eq!(concat(&rest), b"cd");
    }

    #[tokio::test]
    async fn test_empty_body_ends_immediately() {
        let mut splitter = FixedSizeSplitter::default();
        let mut body = reader(b"");
        assert_eq!(
            splitter.next_chunk(&mut body).await.unwrap(),
            SplitOutcome::End
        );
    }
}
