//! `streamPackets(byteStream, observer)` — the central streaming contract
//! of `spec.md` §4.3.
//!
//! Wraps an inbound byte stream so every complete pkt-line frame preceding
//! the first flush is delivered to a [`FrameSink`] exactly once, in order,
//! strictly before it reaches the outbound consumer, while the outbound
//! stream itself reproduces the inbound bytes losslessly. See the module
//! doc on [`PktLineInspectStream`] for the state machine.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use tokio::sync::oneshot;

use crate::pktline::PacketIter;

/// Per-frame callback driven by [`PktLineInspectStream`]. Implementations
/// match the frame against a service-specific grammar and record commands
/// and capabilities; a non-matching frame is passed too and the sink
/// decides whether to ignore it (`spec.md` §9 Open Questions: the bundled
/// sinks ignore, never raise `MalformedCommand`).
pub trait FrameSink: Send {
    fn on_frame(&mut self, frame: &[u8]);
}

/// A sink that observes nothing; used for advertisement requests, which
/// `spec.md` §3 guarantees have no wire-level body to parse.
pub struct NullSink;

impl FrameSink for NullSink {
    fn on_frame(&mut self, _frame: &[u8]) {}
}

impl FrameSink for Box<dyn FrameSink> {
    fn on_frame(&mut self, frame: &[u8]) {
        (**self).on_frame(frame);
    }
}

enum Stage {
    /// Accumulating bytes from `inner`, scanning for the first flush.
    Scanning,
    /// About to emit the zero-length initialisation marker.
    EmitMarker,
    /// Replaying the buffered pre-flush bytes (frames + flush itself).
    EmitPending,
    /// Parsing finished; bytes from `inner` flow through unmodified.
    Passthrough,
    Done,
}

/// The `S'` of `spec.md` §4.3: wraps an inbound `Stream<Item =
/// io::Result<Bytes>>`, running `sink` over every frame before the first
/// flush, then emitting a zero-length handshake chunk, then replaying the
/// scanned bytes, then passing the rest of `inner` through untouched.
///
/// Cancellation (dropping this stream before it completes) simply drops
/// `inner` and the accumulated buffer with it — nothing is held open on
/// the caller's behalf (§5 "Cancellation").
pub struct PktLineInspectStream<St, Sink> {
    inner: St,
    sink: Option<Sink>,
    buf: BytesMut,
    pending: VecDeque<Bytes>,
    stage: Stage,
    initialised_tx: Option<oneshot::Sender<()>>,
}

impl<St, Sink> PktLineInspectStream<St, Sink>
where
    St: Stream<Item = io::Result<Bytes>> + Unpin,
    Sink: FrameSink,
{
    /// Builds the wrapped stream together with a [`oneshot::Receiver`] that
    /// resolves once the preamble (all frames up to and including the
    /// first flush) has been scanned — the signal `Context::initialise`
    /// awaits.
    pub fn new(inner: St, sink: Sink) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                inner,
                sink: Some(sink),
                buf: BytesMut::new(),
                pending: VecDeque::new(),
                stage: Stage::Scanning,
                initialised_tx: Some(tx),
            },
            rx,
        )
    }

    /// Scans whatever is currently buffered. Returns `Ok(true)` once a
    /// flush has been found (and every preceding frame delivered to the
    /// sink), `Ok(false)` if more bytes are needed, `Err` on a malformed
    /// frame.
    ///
    /// Bytes consumed by complete frames are split off `self.buf` into
    /// `self.pending` on every call, flush or not, so `self.buf` only ever
    /// holds the dangling partial frame. That's what keeps a frame seen
    /// in an earlier call from being handed to the sink again: the next
    /// scan starts from offset 0 of a buffer that no longer contains it.
    fn try_drain_buffer(&mut self) -> Result<bool, io::Error> {
        let mut iter = PacketIter::new(&self.buf, true, true);
        let mut frames: Vec<Vec<u8>> = Vec::new();
        loop {
            match iter.next() {
                Some(Ok(frame)) => frames.push(frame.to_vec()),
                Some(Err(e)) => {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, e));
                }
                None => break,
            }
        }

        let flushed = iter.flushed();
        let consumed = iter.position();

        if let Some(sink) = self.sink.as_mut() {
            for frame in &frames {
                sink.on_frame(frame);
            }
        }

        if consumed > 0 {
            let scanned = self.buf.split_to(consumed).freeze();
            self.pending.push_back(scanned);
        }

        Ok(flushed)
    }

    fn mark_initialised(&mut self) {
        if let Some(tx) = self.initialised_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl<St, Sink> Stream for PktLineInspectStream<St, Sink>
where
    St: Stream<Item = io::Result<Bytes>> + Unpin,
    Sink: FrameSink + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match self.stage {
                Stage::Scanning => match self.try_drain_buffer() {
                    Ok(true) => {
                        self.mark_initialised();
                        self.stage = Stage::EmitMarker;
                    }
                    Ok(false) => match Pin::new(&mut self.inner).poll_next(cx) {
                        Poll::Ready(Some(Ok(chunk))) => {
                            self.buf.extend_from_slice(&chunk);
                        }
                        Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                        Poll::Ready(None) => {
                            if self.buf.is_empty() {
                                // No flush ever appeared, but nothing was
                                // left dangling either (e.g. an empty
                                // body) — treat as initialised-with-nothing.
                                self.mark_initialised();
                                self.stage = Stage::EmitMarker;
                            } else {
                                self.stage = Stage::Done;
                                return Poll::Ready(Some(Err(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    crate::error::GatewayError::IncompletePacket,
                                ))));
                            }
                        }
                        Poll::Pending => return Poll::Pending,
                    },
                    Err(e) => {
                        self.stage = Stage::Done;
                        return Poll::Ready(Some(Err(e)));
                    }
                },
                Stage::EmitMarker => {
                    self.stage = Stage::EmitPending;
                    return Poll::Ready(Some(Ok(Bytes::new())));
                }
                Stage::EmitPending => {
                    if let Some(chunk) = self.pending.pop_front() {
                        return Poll::Ready(Some(Ok(chunk)));
                    }
                    self.stage = Stage::Passthrough;
                }
                Stage::Passthrough => {
                    return Pin::new(&mut self.inner).poll_next(cx);
                }
                Stage::Done => return Poll::Ready(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct RecordingSink(Arc<Mutex<Vec<Vec<u8>>>>);

    impl FrameSink for RecordingSink {
        fn on_frame(&mut self, frame: &[u8]) {
            self.0.lock().unwrap().push(frame.to_vec());
        }
    }

    fn chunked(chunks: Vec<&'static [u8]>) -> impl Stream<Item = io::Result<Bytes>> + Unpin {
        tokio_stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c))))
    }

    #[tokio::test]
    async fn observes_exactly_once_and_preserves_bytes() {
        let input = chunked(vec![b"0009want\n", b"0000", b"PACKBYTES"]);
        let sink = RecordingSink::default();
        let (stream, init) = PktLineInspectStream::new(input, sink.clone());
        tokio::pin!(stream);

        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }

        init.await.unwrap();
        assert_eq!(sink.0.lock().unwrap().as_slice(), &[b"want\n".to_vec()]);
        assert_eq!(collected, b"0009want\n0000PACKBYTES");
    }

    #[tokio::test]
    async fn frame_spanning_chunk_boundary_is_reassembled() {
        let input = chunked(vec![b"0009wa", b"nt\n0000"]);
        let sink = RecordingSink::default();
        let (stream, _init) = PktLineInspectStream::new(input, sink.clone());
        tokio::pin!(stream);

        while stream.next().await.is_some() {}

        assert_eq!(sink.0.lock().unwrap().as_slice(), &[b"want\n".to_vec()]);
    }

    #[tokio::test]
    async fn truncated_stream_yields_incomplete_packet() {
        let input = chunked(vec![b"0020short"]);
        let sink = RecordingSink::default();
        let (stream, _init) = PktLineInspectStream::new(input, sink);
        tokio::pin!(stream);

        let err = loop {
            match stream.next().await {
                Some(Err(e)) => break e,
                Some(Ok(_)) => continue,
                None => panic!("expected an error before end of stream"),
            }
        };
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn empty_body_initialises_with_no_frames() {
        let input = chunked(vec![]);
        let sink = RecordingSink::default();
        let (stream, init) = PktLineInspectStream::new(input, sink.clone());
        tokio::pin!(stream);

        while stream.next().await.is_some() {}
        init.await.unwrap();
        assert!(sink.0.lock().unwrap().is_empty());
    }
}
