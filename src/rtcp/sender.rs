// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Periodic RTCP sender reports for an outbound RTP stream.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::NtpTimestamp;

/// Emits a sender report on a fixed period, mapping NTP wall-clock time to
/// the stream's RTP timestamps.
///
/// The mapping is anchored at the most recent outbound packet whose
/// timestamp is known to satisfy PTS==DTS; report timestamps extrapolate
/// from that anchor at the format's clock rate. Until a first anchor is
/// captured, no report is sent at all.
pub struct RtcpSender {
    inner: Arc<Mutex<Inner>>,
    handle: tokio::task::JoinHandle<()>,
}

struct Inner {
    clock_rate: NonZeroU32,
    ssrc: Option<u32>,
    last_ntp: Option<NtpTimestamp>,
    last_rtp_timestamp: Option<u32>,
    packet_count: u32,
    octet_count: u32,
}

impl Inner {
    fn build_report(&self, now: NtpTimestamp) -> Option<Bytes> {
        let ssrc = self.ssrc?;
        let last_ntp = self.last_ntp?;
        let last_rtp = self.last_rtp_timestamp?;
        let elapsed = now.0.saturating_sub(last_ntp.0); // 32.32 fixed point
        let rtp_delta =
            ((u128::from(elapsed) * u128::from(self.clock_rate.get())) >> 32) as u32;
        Some(crate::rtcp::marshal_sender_report(
            ssrc,
            now,
            last_rtp.wrapping_add(rtp_delta),
            self.packet_count,
            self.octet_count,
        ))
    }
}

impl RtcpSender {
    pub fn new(
        clock_rate: NonZeroU32,
        period: Duration,
        on_packet: Box<dyn Fn(Bytes) + Send + Sync>,
    ) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            clock_rate,
            ssrc: None,
            last_ntp: None,
            last_rtp_timestamp: None,
            packet_count: 0,
            octet_count: 0,
        }));
        let inner2 = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                interval.tick().await;
                let report = inner2
                    .lock()
                    .expect("rtcp sender poisoned")
                    .build_report(NtpTimestamp::now());
                if let Some(r) = report {
                    on_packet(r);
                }
            }
        });
        RtcpSender { inner, handle }
    }

    /// Observes an outbound RTP packet.
    pub fn process_packet(&self, pkt: &crate::rtp::Packet, now: NtpTimestamp, pts_equals_dts: bool) {
        let mut s = self.inner.lock().expect("rtcp sender poisoned");
        s.ssrc = Some(pkt.ssrc);
        if pts_equals_dts {
            s.last_ntp = Some(now);
            s.last_rtp_timestamp = Some(pkt.timestamp);
        }
        s.packet_count = s.packet_count.wrapping_add(1);
        s.octet_count = s.octet_count.wrapping_add(pkt.payload.len() as u32);
    }

    /// The SSRC observed on the stream, once a packet has passed through.
    pub fn ssrc(&self) -> Option<u32> {
        self.inner.lock().expect("rtcp sender poisoned").ssrc
    }
}

impl Drop for RtcpSender {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
