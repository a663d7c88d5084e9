//! Property tests for the splitter contract
//!
//! For any body and any way the transport slices it, a splitter must:
//! - never return an empty `Chunk`
//! - stop after `Last` or `End`
//! - hand back every byte exactly once, in order

use bytes::Bytes;
use llm_relay::proxy::splitter::{
    BodyReader, ChunkSplitter, EventStreamSplitter, FixedSizeSplitter, NewLineSplitter,
    SplitOutcome, SseSplitter, WholeStreamSplitter,
};
use llm_relay::proxy::types::ChunkSize;
use proptest::prelude::*;
use tokio_util::io::StreamReader;

fn sliced(body: &[u8], cuts: &[usize]) -> BodyReader {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (body.len() + 1)).collect();
    points.sort_unstable();
    for point in points {
        if point > start {
            pieces.push(Bytes::copy_from_slice(&body[start..point]));
            start = point;
        }
    }
    if start < body.len() {
        pieces.push(Bytes::copy_from_slice(&body[start..]));
    }
    let stream = futures_util::stream::iter(pieces.into_iter().map(Ok::<_, std::io::Error>));
    Box::new(StreamReader::new(stream))
}

/// Drain a splitter and return its chunks, checking the contract on the way
fn drain(splitter: &mut dyn ChunkSplitter, mut reader: BodyReader) -> Vec<Bytes> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    runtime.block_on(async {
        let mut chunks = Vec::new();
        loop {
            match splitter.next_chunk(&mut reader).await.unwrap() {
                SplitOutcome::Chunk(chunk) => {
                    assert!(!chunk.is_empty(), "empty chunk without error");
                    chunks.push(chunk);
                }
                SplitOutcome::Last(chunk) => {
                    assert!(!chunk.is_empty(), "empty last chunk");
                    chunks.push(chunk);
                    return chunks;
                }
                SplitOutcome::End => return chunks,
            }
        }
    })
}

fn joined(chunks: &[Bytes]) -> Vec<u8> {
    chunks.iter().flat_map(|c| c.iter().copied()).collect()
}

fn sse_body() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(
        prop_oneof![
            Just(b"data: ".to_vec()),
            Just(b"\n".to_vec()),
            Just(b"\n\n".to_vec()),
            Just(b"event: delta\n".to_vec()),
            "[a-z{}\":0-9 ]{0,12}".prop_map(String::into_bytes),
        ],
        0..24,
    )
    .prop_map(|parts| parts.concat())
}

/// Event-stream frames with empty headers: prelude, prelude CRC, payload, message CRC
fn event_stream_frames() -> impl Strategy<Value = Vec<Vec<u8>>> {
    proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 0..6).prop_map(
        |payloads| {
            payloads
                .into_iter()
                .map(|payload| {
                    let total = (16 + payload.len()) as u32;
                    let mut frame = Vec::with_capacity(total as usize);
                    frame.extend_from_slice(&total.to_be_bytes());
                    frame.extend_from_slice(&0u32.to_be_bytes());
                    frame.extend_from_slice(&[0xAA; 4]);
                    frame.extend_from_slice(&payload);
                    frame.extend_from_slice(&[0xBB; 4]);
                    frame
                })
                .collect()
        },
    )
}

proptest! {
    #[test]
    fn fixed_size_is_lossless(
        body in proptest::collection::vec(any::<u8>(), 0..512),
        size in 1usize..64,
        cuts in proptest::collection::vec(any::<usize>(), 0..8),
    ) {
        let mut splitter = FixedSizeSplitter::new(ChunkSize::try_new(size).unwrap());
        let chunks = drain(&mut splitter, sliced(&body, &cuts));
        prop_assert_eq!(joined(&chunks), body);
        prop_assert!(chunks.iter().all(|c| c.len() <= size));
    }

    #[test]
    fn new_line_is_lossless(
        body in proptest::collection::vec(prop_oneof![Just(b'\n'), any::<u8>()], 0..256),
        cuts in proptest::collection::vec(any::<usize>(), 0..8),
    ) {
        let chunks = drain(&mut NewLineSplitter, sliced(&body, &cuts));
        prop_assert_eq!(joined(&chunks), body);
        if let Some((_, complete)) = chunks.split_last() {
            prop_assert!(complete.iter().all(|c| c.ends_with(b"\n")));
        }
    }

    #[test]
    fn sse_is_lossless(
        body in sse_body(),
        cuts in proptest::collection::vec(any::<usize>(), 0..8),
    ) {
        let chunks = drain(&mut SseSplitter::default(), sliced(&body, &cuts));
        prop_assert_eq!(joined(&chunks), body);
        if let Some((_, events)) = chunks.split_last() {
            prop_assert!(events.iter().all(|c| c.ends_with(b"\n\n")));
        }
    }

    #[test]
    fn whole_stream_yields_at_most_one_chunk(
        body in proptest::collection::vec(any::<u8>(), 0..512),
        cuts in proptest::collection::vec(any::<usize>(), 0..8),
    ) {
        let chunks = drain(&mut WholeStreamSplitter::default(), sliced(&body, &cuts));
        prop_assert!(chunks.len() <= 1);
        prop_assert_eq!(joined(&chunks), body);
    }

    #[test]
    fn event_stream_is_lossless_under_truncation(
        frames in event_stream_frames(),
        keep in any::<usize>(),
        cuts in proptest::collection::vec(any::<usize>(), 0..8),
    ) {
        let full = frames.concat();
        let body = &full[..keep % (full.len() + 1)];

        let chunks = drain(&mut EventStreamSplitter::default(), sliced(body, &cuts));

        prop_assert_eq!(joined(&chunks), body.to_vec());
        if let Some((_, complete)) = chunks.split_last() {
            for (chunk, frame) in complete.iter().zip(&frames) {
                prop_assert_eq!(&chunk[..], &frame[..]);
            }
        }
    }
}
