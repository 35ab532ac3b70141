// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP 1.0 client and server library.
//!
//! `fovea` implements the protocol engine of [RFC
//! 2326](https://datatracker.ietf.org/doc/html/rfc2326): the client and
//! server session state machines, the framed control connection, RTP/RTCP
//! transport over UDP (unicast or multicast) and TCP-interleaved channels,
//! sequence-number reordering, and periodic RTCP sender/receiver reports.
//! Codec depacketization, beyond the per-format predicates SDP and RTCP
//! need, is out of scope.
//!
//! Everything is built on tokio. Each long-lived object (server, connection,
//! session, stream) owns a task; tasks communicate through bounded channels,
//! and every connection funnels its writes through a single drain task so
//! that responses, RTP frames, and RTCP frames never tear on the wire.

pub mod auth;
pub mod client;
mod error;
pub mod format;
pub mod headers;
pub mod media;
pub mod rtcp;
pub mod rtp;
pub mod server;

#[doc(hidden)]
pub mod conn;
#[doc(hidden)]
pub mod reorder;
#[doc(hidden)]
pub mod transport;

pub use error::{Error, Result};

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch (1970-01-01).
const UNIX_TO_NTP_OFFSET_SECS: u64 = 2_208_988_800;

/// A wall-clock time represented as a 64-bit fixed-point NTP timestamp:
/// seconds since the NTP epoch in the upper half, fraction in the lower.
///
/// Used only inside RTCP sender reports; all scheduling is monotonic.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NtpTimestamp(pub u64);

impl NtpTimestamp {
    /// The current wall-clock time.
    pub fn now() -> Self {
        let now = time::get_time(); // (sec, nsec) since the Unix epoch
        Self::from_unix_parts(now.sec, now.nsec as u32)
    }

    pub(crate) fn from_unix_parts(sec: i64, nsec: u32) -> Self {
        let sec = (sec as u64).wrapping_add(UNIX_TO_NTP_OFFSET_SECS);
        let frac = ((u64::from(nsec) << 32) / 1_000_000_000) as u32;
        NtpTimestamp((sec << 32) | u64::from(frac))
    }

    /// The middle 32 bits, as echoed in receiver reports' LSR field.
    pub fn middle_bits(self) -> u32 {
        ((self.0 >> 16) & 0xFFFF_FFFF) as u32
    }
}

impl std::fmt::Debug for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NtpTimestamp({:#018x})", self.0)
    }
}

impl std::fmt::Display for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sec_since_epoch = (self.0 >> 32) as u32;
        let frac = (self.0 & 0xFFFF_FFFF) as u32;
        write!(f, "{}.{:09}", sec_since_epoch, frac_to_nanos(frac))
    }
}

fn frac_to_nanos(frac: u32) -> u32 {
    ((u64::from(frac) * 1_000_000_000) >> 32) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ntp_from_unix() {
        // 2021-05-01T00:00:00Z.
        let t = NtpTimestamp::from_unix_parts(1_619_827_200, 0);
        assert_eq!(t.0 >> 32, 1_619_827_200 + UNIX_TO_NTP_OFFSET_SECS);
        assert_eq!(t.0 & 0xFFFF_FFFF, 0);

        // Half a second is half the fixed-point range.
        let t = NtpTimestamp::from_unix_parts(0, 500_000_000);
        assert_eq!(t.0 & 0xFFFF_FFFF, 0x8000_0000);
    }

    #[test]
    fn ntp_middle_bits() {
        let t = NtpTimestamp(0x0123_4567_89ab_cdef);
        assert_eq!(t.middle_bits(), 0x4567_89ab);
    }
}
