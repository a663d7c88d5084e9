//! Whole-body framing for non-streaming JSON and error bodies

use crate::proxy::splitter::{BodyReader, ChunkSplitter, SplitError, SplitOutcome, SplitterKind};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;

/// Reads the entire body in one call
#[derive(Debug, Default, Clone, Copy)]
pub struct WholeStreamSplitter {
    limit: Option<usize>,
}

impl WholeStreamSplitter {
    /// Refuse bodies longer than `limit` bytes, counted after decoding
    pub fn bounded(limit: usize) -> Self {
        Self { limit: Some(limit) }
    }
}

#[async_trait]
impl ChunkSplitter for WholeStreamSplitter {
    fn kind(&self) -> SplitterKind {
        SplitterKind::WholeStream
    }

    async fn next_chunk(&mut self, reader: &mut BodyReader) -> Result<SplitOutcome, SplitError> {
        let mut body = Vec::new();
        match self.limit {
            Some(limit) => {
                reader.take(limit as u64 + 1).read_to_end(&mut body).await?;
                if body.len() > limit {
                    return Err(SplitError::TooLarge(limit));
                }
            }
            None => {
                reader.read_to_end(&mut body).await?;
            }
        }
        Ok(SplitOutcome::last_or_end(body))
    }
}
