// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The framed control connection: one codec that reads and writes RTSP
//! requests, responses, and `$`-interleaved binary frames over a single
//! byte stream, plus the bounded write queue every connection drains
//! through exactly one task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::{Error, Result};

/// Limit on a text message (request line + headers + body) before the
/// connection is declared broken.
pub(crate) const MAX_MESSAGE_SIZE: usize = 512 * 1024;

/// Type-erased byte stream, so plain TCP and TLS connections share a code
/// path.
pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// One item on the wire.
#[derive(Debug)]
pub enum Item {
    Msg(rtsp_types::Message<Vec<u8>>),
    Frame { channel: u8, payload: Bytes },
}

/// Codec for [`Item`]s. Text messages are delegated to `rtsp-types`;
/// interleaved frames are handled directly so their payloads stay zero-copy.
pub struct Codec {
    bytes_read: Arc<AtomicU64>,
    bytes_written: Arc<AtomicU64>,
}

impl Codec {
    pub fn new() -> Self {
        Codec {
            bytes_read: Arc::new(AtomicU64::new(0)),
            bytes_written: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared counters, readable while the codec is owned by the framed
    /// transport.
    pub fn counters(&self) -> (Arc<AtomicU64>, Arc<AtomicU64>) {
        (self.bytes_read.clone(), self.bytes_written.clone())
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for Codec {
    type Item = Item;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Item>> {
        if src.is_empty() {
            return Ok(None);
        }
        if src[0] == b'$' {
            if src.len() < 4 {
                return Ok(None);
            }
            let len = usize::from(u16::from_be_bytes([src[2], src[3]]));
            if src.len() < 4 + len {
                src.reserve(4 + len - src.len());
                return Ok(None);
            }
            let channel = src[1];
            src.advance(4);
            let payload = src.split_to(len).freeze();
            self.bytes_read.fetch_add(4 + len as u64, Ordering::Relaxed);
            return Ok(Some(Item::Frame { channel, payload }));
        }
        match rtsp_types::Message::<Vec<u8>>::parse(&src[..]) {
            Ok((msg, consumed)) => {
                src.advance(consumed);
                self.bytes_read.fetch_add(consumed as u64, Ordering::Relaxed);
                Ok(Some(Item::Msg(msg)))
            }
            Err(rtsp_types::ParseError::Incomplete(_)) => {
                if src.len() > MAX_MESSAGE_SIZE {
                    return Err(Error::MalformedMessage(format!(
                        "message exceeds {} bytes",
                        MAX_MESSAGE_SIZE
                    )));
                }
                Ok(None)
            }
            Err(e) => Err(Error::MalformedMessage(format!("{:?}", e))),
        }
    }
}

impl Encoder<Item> for Codec {
    type Error = Error;

    fn encode(&mut self, item: Item, dst: &mut BytesMut) -> Result<()> {
        let before = dst.len();
        match item {
            Item::Msg(msg) => {
                let mut buf = Vec::with_capacity(256);
                msg.write(&mut buf)
                    .map_err(|e| Error::MalformedMessage(format!("{:?}", e)))?;
                dst.extend_from_slice(&buf);
            }
            Item::Frame { channel, payload } => {
                if payload.len() > usize::from(u16::MAX) {
                    return Err(Error::BadInterleavedFrame(format!(
                        "frame of {} bytes can't be interleaved",
                        payload.len()
                    )));
                }
                dst.reserve(4 + payload.len());
                dst.put_u8(b'$');
                dst.put_u8(channel);
                dst.put_u16(payload.len() as u16);
                dst.extend_from_slice(&payload);
            }
        }
        self.bytes_written
            .fetch_add((dst.len() - before) as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// Builds the framed transport over any byte stream.
pub(crate) fn framed<S: AsyncStream>(stream: S) -> Framed<S, Codec> {
    Framed::new(stream, Codec::new())
}

/// Handle to a connection's write queue.
///
/// RTP/RTCP data uses `try_send_data`: full queue means the frame is
/// dropped (best-effort, counted by the caller). Control messages use
/// `send_control` and exert back-pressure instead. There is deliberately
/// no way to write to the socket without going through the queue.
#[derive(Clone)]
pub(crate) struct WriteQueue {
    tx: mpsc::Sender<Item>,
}

impl WriteQueue {
    pub(crate) fn new(capacity: usize) -> (Self, mpsc::Receiver<Item>) {
        let (tx, rx) = mpsc::channel(capacity);
        (WriteQueue { tx }, rx)
    }

    pub(crate) async fn send_control(&self, item: Item) -> Result<()> {
        self.tx.send(item).await.map_err(|_| Error::Terminated)
    }

    /// Best-effort enqueue; returns whether the item was accepted.
    pub(crate) fn try_send_data(&self, item: Item) -> bool {
        self.tx.try_send(item).is_ok()
    }
}

/// Drains a write queue into the sink. Runs until the queue's senders are
/// gone or a write fails; the first error is returned so the owner can
/// propagate it to the read side.
pub(crate) async fn drain_writes<S: AsyncStream>(
    mut sink: futures::stream::SplitSink<Framed<S, Codec>, Item>,
    mut rx: mpsc::Receiver<Item>,
    write_timeout: Duration,
) -> Result<()> {
    while let Some(item) = rx.recv().await {
        match tokio::time::timeout(write_timeout, sink.send(item)).await {
            Ok(r) => r?,
            Err(_) => return Err(Error::WriteTimeout),
        }
    }
    Ok(())
}

/// Returns the `CSeq` of a message as a `u32`, given the raw header value.
pub(crate) fn parse_cseq(value: Option<&rtsp_types::HeaderValue>) -> Option<u32> {
    value.and_then(|v| v.as_str().trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Vec<Item> {
        let mut codec = Codec::new();
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(item) = codec.decode(&mut buf).unwrap() {
            out.push(item);
        }
        out
    }

    #[test]
    fn decodes_request_then_frame() {
        let input = b"OPTIONS rtsp://example.com/s RTSP/1.0\r\nCSeq: 1\r\n\r\n$\x02\x00\x03abc";
        let items = decode_all(input);
        assert_eq!(items.len(), 2);
        match &items[0] {
            Item::Msg(rtsp_types::Message::Request(req)) => {
                assert_eq!(req.method(), rtsp_types::Method::Options);
            }
            other => panic!("wrong item: {:?}", other),
        }
        match &items[1] {
            Item::Frame { channel, payload } => {
                assert_eq!(*channel, 2);
                assert_eq!(&payload[..], b"abc");
            }
            other => panic!("wrong item: {:?}", other),
        }
    }

    #[test]
    fn decodes_message_with_body() {
        let input =
            b"DESCRIBE rtsp://h/p RTSP/1.0\r\nCSeq: 2\r\nContent-Length: 4\r\n\r\nv=0\n";
        let items = decode_all(input);
        assert_eq!(items.len(), 1);
        match &items[0] {
            Item::Msg(rtsp_types::Message::Request(req)) => {
                assert_eq!(req.body().as_slice(), b"v=0\n");
            }
            other => panic!("wrong item: {:?}", other),
        }
    }

    #[test]
    fn incomplete_returns_none() {
        let mut codec = Codec::new();
        let mut buf = BytesMut::from(&b"OPTIONS rtsp://h/p RTSP/1.0\r\nCSeq"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        // Truncated interleaved frame too.
        let mut buf = BytesMut::from(&b"$\x00\x00\x10abc"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn malformed_is_fatal() {
        let mut codec = Codec::new();
        let mut buf = BytesMut::from(&b"NOT AN RTSP LINE AT ALL\rgarbage\r\n\r\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn encode_frame_roundtrip() {
        let mut codec = Codec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Item::Frame {
                    channel: 1,
                    payload: Bytes::from_static(b"\x80\x00"),
                },
                &mut buf,
            )
            .unwrap();
        assert_eq!(&buf[..], b"$\x01\x00\x02\x80\x00");
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(decoded, Item::Frame { channel: 1, .. }));
    }

    #[test]
    fn counters_track_both_directions() {
        let mut codec = Codec::new();
        let (read, written) = codec.counters();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Item::Frame {
                    channel: 0,
                    payload: Bytes::from_static(b"abcd"),
                },
                &mut buf,
            )
            .unwrap();
        assert_eq!(written.load(Ordering::Relaxed), 8);
        codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(read.load(Ordering::Relaxed), 8);
    }
}
