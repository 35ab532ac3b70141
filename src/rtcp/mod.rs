// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTCP wire handling and the periodic report loops; see
//! [RFC 3550](https://datatracker.ietf.org/doc/html/rfc3550).
//!
//! Only sender reports and receiver reports are modeled; other packet kinds
//! pass through as [`Packet::Unknown`]. No compound-packet rules are
//! enforced beyond iterating whatever the buffer holds.

use bytes::{BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

use crate::NtpTimestamp;

pub(crate) mod receiver;
pub(crate) mod sender;

pub use receiver::RtcpReceiver;
pub use sender::RtcpSender;

pub const PT_SENDER_REPORT: u8 = 200;
pub const PT_RECEIVER_REPORT: u8 = 201;

/// One RTCP packet within a compound buffer.
#[derive(Debug)]
pub enum Packet<'a> {
    SenderReport(SenderReportRef<'a>),
    ReceiverReport(ReceiverReportRef<'a>),
    Unknown(UnknownRef<'a>),
}

impl<'a> Packet<'a> {
    /// Parses one packet, returning it and the rest of the buffer.
    pub fn parse(buf: &'a [u8]) -> Result<(Packet<'a>, &'a [u8]), String> {
        if buf.len() < 4 {
            return Err(format!("truncated RTCP header ({} bytes)", buf.len()));
        }
        let ver = buf[0] >> 6;
        if ver != 2 {
            return Err(format!("RTCP packet with version {}", ver));
        }
        let count = usize::from(buf[0] & 0x1F);
        let pt = buf[1];
        let len = (usize::from(u16::from_be_bytes([buf[2], buf[3]])) + 1) * 4;
        if len > buf.len() {
            return Err(format!(
                "RTCP packet length {} exceeds buffer {}",
                len,
                buf.len()
            ));
        }
        let (this, rest) = buf.split_at(len);
        let pkt = match pt {
            PT_SENDER_REPORT => {
                if this.len() < 28 || this.len() < 28 + count * 24 {
                    return Err("truncated RTCP SR".to_owned());
                }
                Packet::SenderReport(SenderReportRef { buf: this, count })
            }
            PT_RECEIVER_REPORT => {
                if this.len() < 8 || this.len() < 8 + count * 24 {
                    return Err("truncated RTCP RR".to_owned());
                }
                Packet::ReceiverReport(ReceiverReportRef { buf: this, count })
            }
            _ => Packet::Unknown(UnknownRef { buf: this }),
        };
        Ok((pkt, rest))
    }

    /// Iterates a compound buffer.
    pub fn parse_compound(mut buf: &'a [u8]) -> Result<SmallVec<[Packet<'a>; 2]>, String> {
        let mut out = SmallVec::new();
        while !buf.is_empty() {
            let (pkt, rest) = Packet::parse(buf)?;
            out.push(pkt);
            buf = rest;
        }
        Ok(out)
    }
}

/// A view of a sender report.
#[derive(Copy, Clone)]
pub struct SenderReportRef<'a> {
    buf: &'a [u8],
    count: usize,
}

impl<'a> SenderReportRef<'a> {
    fn u32_at(&self, i: usize) -> u32 {
        u32::from_be_bytes([self.buf[i], self.buf[i + 1], self.buf[i + 2], self.buf[i + 3]])
    }

    pub fn ssrc(&self) -> u32 {
        self.u32_at(4)
    }

    pub fn ntp_timestamp(&self) -> NtpTimestamp {
        NtpTimestamp((u64::from(self.u32_at(8)) << 32) | u64::from(self.u32_at(12)))
    }

    pub fn rtp_timestamp(&self) -> u32 {
        self.u32_at(16)
    }

    pub fn packet_count(&self) -> u32 {
        self.u32_at(20)
    }

    pub fn octet_count(&self) -> u32 {
        self.u32_at(24)
    }

    pub fn report_count(&self) -> usize {
        self.count
    }
}

impl<'a> std::fmt::Debug for SenderReportRef<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderReport")
            .field("ssrc", &self.ssrc())
            .field("ntp_timestamp", &self.ntp_timestamp())
            .field("rtp_timestamp", &self.rtp_timestamp())
            .field("packet_count", &self.packet_count())
            .field("octet_count", &self.octet_count())
            .finish()
    }
}

/// A view of a receiver report.
#[derive(Copy, Clone)]
pub struct ReceiverReportRef<'a> {
    buf: &'a [u8],
    count: usize,
}

impl<'a> ReceiverReportRef<'a> {
    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]])
    }

    pub fn reception_reports(&self) -> impl Iterator<Item = ReceptionReport> + 'a {
        let buf = self.buf;
        (0..self.count).map(move |i| ReceptionReport::parse(&buf[8 + i * 24..8 + (i + 1) * 24]))
    }
}

impl<'a> std::fmt::Debug for ReceiverReportRef<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverReport")
            .field("ssrc", &self.ssrc())
            .field("reports", &self.reception_reports().collect::<Vec<_>>())
            .finish()
    }
}

/// An RTCP packet kind the engine doesn't interpret.
#[derive(Copy, Clone, Debug)]
pub struct UnknownRef<'a> {
    buf: &'a [u8],
}

impl<'a> UnknownRef<'a> {
    pub fn payload_type(&self) -> u8 {
        self.buf[1]
    }
}

/// One reception report block, owned.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReceptionReport {
    pub ssrc: u32,
    pub fraction_lost: u8,
    /// 24-bit cumulative count of lost packets.
    pub cumulative_lost: u32,
    pub extended_highest_sequence: u32,
    pub jitter: u32,
    /// Middle 32 bits of the last SR's NTP timestamp, or 0.
    pub last_sr: u32,
    /// Delay since that SR in 1/65536 s units, or 0.
    pub delay_since_last_sr: u32,
}

impl ReceptionReport {
    fn parse(b: &[u8]) -> ReceptionReport {
        let u32_at = |i: usize| u32::from_be_bytes([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        ReceptionReport {
            ssrc: u32_at(0),
            fraction_lost: b[4],
            cumulative_lost: u32_at(4) & 0x00FF_FFFF,
            extended_highest_sequence: u32_at(8),
            jitter: u32_at(12),
            last_sr: u32_at(16),
            delay_since_last_sr: u32_at(20),
        }
    }

    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u32(self.ssrc);
        buf.put_u32((u32::from(self.fraction_lost) << 24) | (self.cumulative_lost & 0x00FF_FFFF));
        buf.put_u32(self.extended_highest_sequence);
        buf.put_u32(self.jitter);
        buf.put_u32(self.last_sr);
        buf.put_u32(self.delay_since_last_sr);
    }
}

fn put_header(buf: &mut BytesMut, count: usize, pt: u8, words_after_header: usize) {
    buf.put_u8(0x80 | (count as u8 & 0x1F));
    buf.put_u8(pt);
    buf.put_u16(words_after_header as u16);
}

/// Builds a sender report.
pub fn marshal_sender_report(
    ssrc: u32,
    ntp: NtpTimestamp,
    rtp_timestamp: u32,
    packet_count: u32,
    octet_count: u32,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(28);
    put_header(&mut buf, 0, PT_SENDER_REPORT, 6);
    buf.put_u32(ssrc);
    buf.put_u64(ntp.0);
    buf.put_u32(rtp_timestamp);
    buf.put_u32(packet_count);
    buf.put_u32(octet_count);
    buf.freeze()
}

/// Builds a receiver report with one reception block per entry.
pub fn marshal_receiver_report(ssrc: u32, reports: &[ReceptionReport]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + reports.len() * 24);
    put_header(
        &mut buf,
        reports.len(),
        PT_RECEIVER_REPORT,
        1 + reports.len() * 6,
    );
    buf.put_u32(ssrc);
    for r in reports {
        r.write_to(&mut buf);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sr_roundtrip() {
        let ntp = NtpTimestamp(0x1122_3344_5566_7788);
        let buf = marshal_sender_report(0xDEAD_BEEF, ntp, 90_000, 7, 4_096);
        assert_eq!(buf.len(), 28);
        let pkts = Packet::parse_compound(&buf).unwrap();
        assert_eq!(pkts.len(), 1);
        match &pkts[0] {
            Packet::SenderReport(sr) => {
                assert_eq!(sr.ssrc(), 0xDEAD_BEEF);
                assert_eq!(sr.ntp_timestamp(), ntp);
                assert_eq!(sr.rtp_timestamp(), 90_000);
                assert_eq!(sr.packet_count(), 7);
                assert_eq!(sr.octet_count(), 4_096);
            }
            other => panic!("wrong packet: {:?}", other),
        }
    }

    #[test]
    fn rr_roundtrip() {
        let report = ReceptionReport {
            ssrc: 0x0102_0304,
            fraction_lost: 12,
            cumulative_lost: 34,
            extended_highest_sequence: 0x0001_0002,
            jitter: 56,
            last_sr: 0x4567_89AB,
            delay_since_last_sr: 655_36,
        };
        let buf = marshal_receiver_report(0xAABB_CCDD, &[report.clone()]);
        assert_eq!(buf.len(), 32);
        let pkts = Packet::parse_compound(&buf).unwrap();
        match &pkts[0] {
            Packet::ReceiverReport(rr) => {
                assert_eq!(rr.ssrc(), 0xAABB_CCDD);
                let blocks: Vec<_> = rr.reception_reports().collect();
                assert_eq!(blocks, vec![report]);
            }
            other => panic!("wrong packet: {:?}", other),
        }
    }

    #[test]
    fn compound_with_unknown() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&marshal_sender_report(1, NtpTimestamp(2), 3, 4, 5));
        // An SDES packet (pt=202) with an empty body.
        buf.extend_from_slice(&[0x80, 202, 0x00, 0x00]);
        let pkts = Packet::parse_compound(&buf).unwrap();
        assert_eq!(pkts.len(), 2);
        assert!(matches!(&pkts[1], Packet::Unknown(u) if u.payload_type() == 202));
    }

    #[test]
    fn rejects_garbage() {
        assert!(Packet::parse(&[0x80, 200]).is_err()); // truncated header
        assert!(Packet::parse(&[0x40, 200, 0x00, 0x00]).is_err()); // version 1
        assert!(Packet::parse(&[0x80, 200, 0x00, 0x20, 0, 0, 0, 0]).is_err()); // bad length
    }
}
