//! Transparent decompression in front of any splitter
//!
//! The decision is taken on the first `next_chunk` call and held for the
//! rest of the stream: either every read goes through a decoding reader, or
//! the raw body is handed straight to the wrapped splitter.

use crate::proxy::context::RequestContext;
use crate::proxy::splitter::{BodyReader, ChunkSplitter, SplitError, SplitOutcome, SplitterKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncBufRead, AsyncRead, ReadBuf};

/// Builds a decoding reader for a content-encoding
pub type DecoderFactory =
    Arc<dyn Fn(&str, BodyReader) -> Result<BodyReader, SplitError> + Send + Sync>;

/// The built-in factory: gzip, deflate (zlib) and brotli
pub fn default_decoder_factory() -> DecoderFactory {
    Arc::new(decoding_reader)
}

/// Wrap `inner` in a reader that inflates `encoding`
pub fn decoding_reader(encoding: &str, inner: BodyReader) -> Result<BodyReader, SplitError> {
    let sink = DecodedSink::default();
    let decoder = match encoding.trim().to_ascii_lowercase().as_str() {
        "gzip" | "x-gzip" => Decoder::Gzip(Box::new(flate2::write::GzDecoder::new(sink.clone()))),
        "deflate" => Decoder::Zlib(flate2::write::ZlibDecoder::new(sink.clone())),
        "br" => Decoder::Brotli(Box::new(brotli::DecompressorWriter::new(sink.clone(), 4096))),
        other => return Err(SplitError::UnsupportedEncoding(other.to_string())),
    };
    Ok(Box::new(DecodedReader::new(inner, decoder, sink)))
}

/// Whether a content-encoding value asks for decoding
pub fn needs_decoding(encoding: &str) -> bool {
    let encoding = encoding.trim();
    !encoding.is_empty() && !encoding.eq_ignore_ascii_case("identity")
}

enum DecodeState {
    Undecided,
    PassThrough,
    Decoding(BodyReader),
}

/// Decorator that inflates a compressed upstream body for its inner splitter
pub struct DecompressingSplitter {
    inner: Box<dyn ChunkSplitter>,
    ctx: Arc<RequestContext>,
    header_encoding: Option<String>,
    factory: DecoderFactory,
    state: DecodeState,
}

impl DecompressingSplitter {
    /// `header_encoding` is the response `Content-Encoding`, consulted only
    /// when the request context has no recorded encoding
    pub fn new(
        inner: Box<dyn ChunkSplitter>,
        ctx: Arc<RequestContext>,
        header_encoding: Option<String>,
        factory: DecoderFactory,
    ) -> Self {
        Self {
            inner,
            ctx,
            header_encoding,
            factory,
            state: DecodeState::Undecided,
        }
    }

    fn decide(&mut self, reader: &mut BodyReader) -> Result<(), SplitError> {
        let encoding = self
            .ctx
            .response_encoding()
            .or_else(|| self.header_encoding.clone());

        self.state = match encoding {
            Some(encoding) if needs_decoding(&encoding) => {
                let raw = std::mem::replace(reader, Box::new(tokio::io::empty()));
                tracing::debug!(request_id = %self.ctx.request_id(), %encoding, "decoding upstream body");
                DecodeState::Decoding((self.factory)(&encoding, raw)?)
            }
            _ => DecodeState::PassThrough,
        };
        Ok(())
    }
}

#[async_trait]
impl ChunkSplitter for DecompressingSplitter {
    fn kind(&self) -> SplitterKind {
        self.inner.kind()
    }

    fn is_compatible(&self, content_type: &str) -> bool {
        self.inner.is_compatible(content_type)
    }

    async fn next_chunk(&mut self, reader: &mut BodyReader) -> Result<SplitOutcome, SplitError> {
        if matches!(self.state, DecodeState::Undecided) {
            self.decide(reader)?;
        }
        match &mut self.state {
            DecodeState::Decoding(decoded) => self.inner.next_chunk(decoded).await,
            _ => self.inner.next_chunk(reader).await,
        }
    }
}

/// Shared output buffer the write-side decoders inflate into
#[derive(Clone, Default)]
struct DecodedSink(Arc<Mutex<Vec<u8>>>);

impl DecodedSink {
    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl Write for DecodedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Write-side decoder that must be finished explicitly
///
/// Dropping a decoder discards its trailer checks, so end of input always
/// goes through [`Decoder::finish`].
enum Decoder {
    Gzip(Box<flate2::write::GzDecoder<DecodedSink>>),
    Zlib(flate2::write::ZlibDecoder<DecodedSink>),
    Brotli(Box<brotli::DecompressorWriter<DecodedSink>>),
}

impl Decoder {
    fn feed(&mut self, compressed: &[u8]) -> io::Result<()> {
        match self {
            Self::Gzip(d) => d.write_all(compressed).and_then(|()| d.flush()),
            Self::Zlib(d) => d.write_all(compressed).and_then(|()| d.flush()),
            Self::Brotli(d) => d.write_all(compressed).and_then(|()| d.flush()),
        }
    }

    /// Flush the tail and verify the stream ended where the format says it does
    fn finish(&mut self) -> io::Result<()> {
        match self {
            Self::Gzip(d) => d.try_finish(),
            Self::Zlib(d) => d.try_finish(),
            Self::Brotli(d) => d.close(),
        }
    }
}

pin_project! {
    /// Buffered reader over the decoder output
    struct DecodedReader<R> {
        #[pin]
        inner: R,
        decoder: Option<Decoder>,
        sink: DecodedSink,
        out: Vec<u8>,
        pos: usize,
    }
}

impl<R> DecodedReader<R> {
    fn new(inner: R, decoder: Decoder, sink: DecodedSink) -> Self {
        Self {
            inner,
            decoder: Some(decoder),
            sink,
            out: Vec::new(),
            pos: 0,
        }
    }
}

impl<R: AsyncBufRead> AsyncBufRead for DecodedReader<R> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let mut this = self.project();
        while *this.pos >= this.out.len() {
            let Some(decoder) = this.decoder.as_mut() else {
                break;
            };
            this.out.clear();
            *this.pos = 0;

            let compressed = ready!(this.inner.as_mut().poll_fill_buf(cx))?;
            if compressed.is_empty() {
                let finished = decoder.finish();
                this.decoder.take();
                finished?;
            } else {
                let n = compressed.len();
                decoder.feed(compressed)?;
                this.inner.as_mut().consume(n);
            }
            this.out.extend(this.sink.take());
        }
        Poll::Ready(Ok(&this.out[*this.pos..]))
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        let this = self.project();
        *this.pos = (*this.pos + amt).min(this.out.len());
    }
}

impl<R: AsyncBufRead> AsyncRead for DecodedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let available = ready!(self.as_mut().poll_fill_buf(cx))?;
        let n = available.len().min(buf.remaining());
        buf.put_slice(&available[..n]);
        self.consume(n);
        Poll::Ready(Ok(()))
    }
}
