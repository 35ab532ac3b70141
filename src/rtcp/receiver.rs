// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Periodic RTCP receiver reports and reception statistics for an inbound
//! RTP stream.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::rtcp::ReceptionReport;

/// Tracks reception statistics for one inbound SSRC and emits a receiver
/// report on a fixed period.
///
/// Also the stream's liveness witness: every RTP or RTCP packet refreshes
/// an arrival instant the owner polls through [`RtcpReceiver::is_alive`].
pub struct RtcpReceiver {
    inner: Arc<Mutex<Inner>>,
    handle: tokio::task::JoinHandle<()>,
}

struct Inner {
    clock_rate: NonZeroU32,
    receiver_ssrc: u32,
    source: Option<Source>,
    last_received: Option<Instant>,
    epoch: Instant,
}

struct Source {
    ssrc: u32,
    base_ext_seq: u32,
    max_ext_seq: u32,
    received: u64,
    expected_prior: u32,
    received_prior: u32,
    transit: Option<i64>,
    jitter: f64,
    last_sr_middle: Option<u32>,
    last_sr_instant: Option<Instant>,
}

impl Source {
    fn new(ssrc: u32, seq: u16) -> Source {
        Source {
            ssrc,
            base_ext_seq: u32::from(seq),
            max_ext_seq: u32::from(seq),
            received: 1,
            expected_prior: 0,
            received_prior: 0,
            transit: None,
            jitter: 0.0,
            last_sr_middle: None,
            last_sr_instant: None,
        }
    }

    fn update_seq(&mut self, seq: u16) {
        let cycles = self.max_ext_seq & 0xFFFF_0000;
        let prev = (self.max_ext_seq & 0xFFFF) as u16;
        let ext = if seq < prev && prev.wrapping_sub(seq) > 0x8000 {
            // Wrapped around.
            cycles.wrapping_add(0x1_0000) | u32::from(seq)
        } else {
            cycles | u32::from(seq)
        };
        if ext > self.max_ext_seq {
            self.max_ext_seq = ext;
        }
        self.received += 1;
    }

    /// RFC 3550 section A.8.
    fn update_jitter(&mut self, rtp_timestamp: u32, arrival_units: i64) {
        let transit = arrival_units - i64::from(rtp_timestamp);
        if let Some(prev) = self.transit {
            let d = (transit - prev).abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.transit = Some(transit);
    }

    fn reception_report(&mut self, now: Instant) -> ReceptionReport {
        let expected = self.max_ext_seq.wrapping_sub(self.base_ext_seq).wrapping_add(1);
        let lost = i64::from(expected) - self.received as i64;
        let cumulative_lost = lost.max(0).min(0x00FF_FFFF) as u32;

        let expected_interval = expected.wrapping_sub(self.expected_prior);
        let received_interval = (self.received as u32).wrapping_sub(self.received_prior);
        let lost_interval = expected_interval.saturating_sub(received_interval);
        let fraction_lost = if expected_interval == 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval) as u8
        };
        self.expected_prior = expected;
        self.received_prior = self.received as u32;

        let (last_sr, delay_since_last_sr) = match (self.last_sr_middle, self.last_sr_instant) {
            (Some(m), Some(at)) => {
                let delay = now.saturating_duration_since(at);
                (m, (delay.as_secs_f64() * 65_536.0) as u32)
            }
            _ => (0, 0),
        };

        ReceptionReport {
            ssrc: self.ssrc,
            fraction_lost,
            cumulative_lost,
            extended_highest_sequence: self.max_ext_seq,
            jitter: self.jitter as u32,
            last_sr,
            delay_since_last_sr,
        }
    }
}

impl RtcpReceiver {
    pub fn new(
        clock_rate: NonZeroU32,
        receiver_ssrc: u32,
        period: Duration,
        on_packet: Box<dyn Fn(Bytes) + Send + Sync>,
    ) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            clock_rate,
            receiver_ssrc,
            source: None,
            last_received: None,
            epoch: Instant::now(),
        }));
        let inner2 = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                interval.tick().await;
                let report = {
                    let mut s = inner2.lock().expect("rtcp receiver poisoned");
                    let receiver_ssrc = s.receiver_ssrc;
                    s.source.as_mut().map(|src| {
                        let block = src.reception_report(Instant::now());
                        crate::rtcp::marshal_receiver_report(receiver_ssrc, &[block])
                    })
                };
                if let Some(r) = report {
                    on_packet(r);
                }
            }
        });
        RtcpReceiver { inner, handle }
    }

    /// Observes an inbound RTP packet, after reordering.
    pub fn process_packet(&self, pkt: &crate::rtp::Packet) {
        let now = Instant::now();
        let mut s = self.inner.lock().expect("rtcp receiver poisoned");
        s.last_received = Some(now);
        let arrival_units = (now.saturating_duration_since(s.epoch).as_secs_f64()
            * f64::from(s.clock_rate.get())) as i64;
        match &mut s.source {
            Some(src) if src.ssrc == pkt.ssrc => {
                src.update_seq(pkt.sequence_number);
                src.update_jitter(pkt.timestamp, arrival_units);
            }
            Some(_) => {
                log::debug!(
                    "ignoring RTP with unexpected ssrc={:08x} in receiver stats",
                    pkt.ssrc
                );
            }
            None => {
                let mut src = Source::new(pkt.ssrc, pkt.sequence_number);
                src.update_jitter(pkt.timestamp, arrival_units);
                s.source = Some(src);
            }
        }
    }

    /// Observes an inbound RTCP sender report.
    pub fn process_sender_report(&self, sr: &crate::rtcp::SenderReportRef<'_>) {
        let mut s = self.inner.lock().expect("rtcp receiver poisoned");
        s.last_received = Some(Instant::now());
        if let Some(src) = &mut s.source {
            if src.ssrc == sr.ssrc() {
                src.last_sr_middle = Some(sr.ntp_timestamp().middle_bits());
                src.last_sr_instant = Some(Instant::now());
            }
        }
    }

    /// Marks arrival of any other traffic that proves the stream alive.
    pub fn note_alive(&self) {
        self.inner.lock().expect("rtcp receiver poisoned").last_received = Some(Instant::now());
    }

    /// Whether any RTP or RTCP arrived within `timeout`. `false` before the
    /// first packet too, so the owner's check loop also catches streams
    /// that never start.
    pub fn is_alive(&self, timeout: Duration) -> bool {
        match self.inner.lock().expect("rtcp receiver poisoned").last_received {
            Some(at) => at.elapsed() < timeout,
            None => false,
        }
    }
}

impl Drop for RtcpReceiver {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtcp::Packet;

    fn packet(seq: u16, ts: u32) -> crate::rtp::Packet {
        crate::rtp::Packet::new(96, seq, ts, 0x1111, false, b"x").unwrap()
    }

    #[tokio::test]
    async fn emits_rr_with_loss_stats() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let r = RtcpReceiver::new(
            NonZeroU32::new(90_000).unwrap(),
            0x2222,
            Duration::from_millis(50),
            Box::new(move |b| {
                let _ = tx.send(b);
            }),
        );
        // Sequence numbers 10, 11, 14: two skipped.
        r.process_packet(&packet(10, 0));
        r.process_packet(&packet(11, 3_000));
        r.process_packet(&packet(14, 12_000));

        let report = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no RR within deadline")
            .unwrap();
        let pkts = Packet::parse_compound(&report).unwrap();
        match &pkts[0] {
            Packet::ReceiverReport(rr) => {
                assert_eq!(rr.ssrc(), 0x2222);
                let blocks: Vec<_> = rr.reception_reports().collect();
                assert_eq!(blocks.len(), 1);
                assert_eq!(blocks[0].ssrc, 0x1111);
                assert_eq!(blocks[0].extended_highest_sequence, 14);
                assert_eq!(blocks[0].cumulative_lost, 2);
            }
            other => panic!("wrong packet: {:?}", other),
        }
    }

    #[tokio::test]
    async fn liveness() {
        let r = RtcpReceiver::new(
            NonZeroU32::new(8_000).unwrap(),
            1,
            Duration::from_secs(10),
            Box::new(|_| {}),
        );
        assert!(!r.is_alive(Duration::from_secs(1)));
        r.process_packet(&packet(1, 0));
        assert!(r.is_alive(Duration::from_secs(1)));
    }

    #[test]
    fn extended_seq_wraps() {
        let mut src = Source::new(1, 65_534);
        src.update_seq(65_535);
        src.update_seq(0);
        src.update_seq(1);
        assert_eq!(src.max_ext_seq, 0x1_0001);
        assert_eq!(src.received, 4);
    }
}
