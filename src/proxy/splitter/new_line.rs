//! Newline-delimited framing (JSON lines, NDJSON streams)

use crate::proxy::splitter::{BodyReader, ChunkSplitter, SplitError, SplitOutcome, SplitterKind};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncBufReadExt;

/// One line per chunk, trailing `\n` included
#[derive(Default)]
pub struct NewLineSplitter;

#[async_trait]
impl ChunkSplitter for NewLineSplitter {
    fn kind(&self) -> SplitterKind {
        SplitterKind::NewLine
    }

    async fn next_chunk(&mut self, reader: &mut BodyReader) -> Result<SplitOutcome, SplitError> {
        let mut line = Vec::new();
        reader.read_until(b'\n', &mut line).await?;
        if line.last() == Some(&b'\n') {
            Ok(SplitOutcome::Chunk(Bytes::from(line)))
        } else {
            Ok(SplitOutcome::last_or_end(line))
        }
    }
}
