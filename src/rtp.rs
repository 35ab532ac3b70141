// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP packet handling; see [RFC 3550](https://datatracker.ietf.org/doc/html/rfc3550).

use bytes::Bytes;
use pretty_hex::PrettyHex;

use crate::{Error, Result};

/// Returns `subset`'s position within `buf`, or `None` if it isn't one of
/// `buf`'s subslices.
fn as_range(buf: &[u8], subset: &[u8]) -> Option<std::ops::Range<usize>> {
    let buf_start = buf.as_ptr() as usize;
    let subset_start = subset.as_ptr() as usize;
    if subset_start < buf_start || subset_start + subset.len() > buf_start + buf.len() {
        return None;
    }
    let start = subset_start - buf_start;
    Some(start..start + subset.len())
}

/// An RTP packet, parsed header plus zero-copy payload and raw bytes.
///
/// `loss` is filled by the receive path: the number of skipped sequence
/// numbers since the previous delivered packet on the same stream.
#[derive(Clone)]
pub struct Packet {
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub mark: bool,
    pub loss: u16,
    pub payload: Bytes,
    raw: Bytes,
}

impl Packet {
    /// Parses a datagram or interleaved frame into a packet.
    pub fn parse(data: Bytes) -> Result<Packet> {
        let reader = rtp_rs::RtpReader::new(&data[..]).map_err(|e| {
            Error::MalformedMessage(format!(
                "corrupt RTP header: {:?}\n{:#?}",
                e,
                data.hex_dump()
            ))
        })?;
        let sequence_number = u16::from_be_bytes([data[2], data[3]]); // I don't like rtp_rs::Seq.
        let payload_type = reader.payload_type();
        let timestamp = reader.timestamp();
        let ssrc = reader.ssrc();
        let mark = reader.mark();
        // A tail slice would be wrong for padded packets: the reader's
        // payload excludes the trailing pad bytes, so locate it by range.
        let payload_range = as_range(&data, reader.payload()).ok_or_else(|| {
            Error::MalformedMessage(format!(
                "RTP payload outside the packet\n{:#?}",
                data.hex_dump()
            ))
        })?;
        let payload = data.slice(payload_range);
        Ok(Packet {
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            mark,
            loss: 0,
            payload,
            raw: data,
        })
    }

    /// Builds a packet from parts, marshaling the wire form eagerly so the
    /// write paths can fan the same buffer out without re-encoding.
    pub fn new(
        payload_type: u8,
        sequence_number: u16,
        timestamp: u32,
        ssrc: u32,
        mark: bool,
        payload: &[u8],
    ) -> Result<Packet> {
        let raw = rtp_rs::RtpPacketBuilder::new()
            .payload_type(payload_type)
            .marked(mark)
            .sequence(rtp_rs::Seq::from(sequence_number))
            .timestamp(timestamp)
            .ssrc(ssrc)
            .payload(payload)
            .build()
            .map_err(|e| Error::MalformedMessage(format!("can't build RTP packet: {:?}", e)))?;
        let raw = Bytes::from(raw);
        let payload = raw.slice(raw.len() - payload.len()..);
        Ok(Packet {
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            mark,
            loss: 0,
            payload,
            raw,
        })
    }

    /// The full wire form.
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("payload_type", &self.payload_type)
            .field("sequence_number", &self.sequence_number)
            .field("timestamp", &self.timestamp)
            .field("ssrc", &self.ssrc)
            .field("mark", &self.mark)
            .field("loss", &self.loss)
            .field("payload", &self.payload.hex_dump())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_then_parse() {
        let p = Packet::new(96, 0x1234, 0xdead_beef, 0x0102_0304, true, b"payload").unwrap();
        let q = Packet::parse(p.raw().clone()).unwrap();
        assert_eq!(q.payload_type, 96);
        assert_eq!(q.sequence_number, 0x1234);
        assert_eq!(q.timestamp, 0xdead_beef);
        assert_eq!(q.ssrc, 0x0102_0304);
        assert!(q.mark);
        assert_eq!(&q.payload[..], b"payload");
    }

    #[test]
    fn padded_packet_payload_excludes_padding() {
        // P bit set, payload "abcd", then four pad bytes (last one is the
        // pad count per RFC 3550 section 5.1).
        let mut raw = vec![
            0xA0, 0x60, 0x00, 0x01, // V=2 P=1, pt=96, seq=1
            0x00, 0x00, 0x00, 0x02, // timestamp
            0x00, 0x00, 0x00, 0x03, // ssrc
        ];
        raw.extend_from_slice(b"abcd");
        raw.extend_from_slice(&[0x00, 0x00, 0x00, 0x04]);
        let p = Packet::parse(Bytes::from(raw)).unwrap();
        assert_eq!(p.sequence_number, 1);
        assert_eq!(&p.payload[..], b"abcd");
    }

    #[test]
    fn rejects_garbage() {
        assert!(Packet::parse(Bytes::from_static(b"ab")).is_err());
        assert!(Packet::parse(Bytes::from_static(b"\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00")).is_err());
    }
}
