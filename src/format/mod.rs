// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTP payload formats: the mapping between an SDP payload type and the
//! codec-level facts the engine needs (clock rate, rtpmap/fmtp attributes,
//! and whether a packet's RTP timestamp is an authoritative PTS==DTS point
//! for RTCP sender reports).
//!
//! Formats are a closed enum; operations dispatch on the tag. Codecs the
//! engine doesn't know end up as [`Generic`], which still resolves a clock
//! rate from the static payload-type table or the rtpmap.

use std::collections::HashMap;

use once_cell::sync::Lazy;

pub(crate) mod generic;
pub(crate) mod h264;
pub(crate) mod h265;
pub(crate) mod mpeg4_audio;
pub(crate) mod opus;
pub(crate) mod simple;
pub(crate) mod vp8;
pub(crate) mod vp9;

pub use generic::Generic;
pub use h264::H264;
pub use h265::H265;
pub use mpeg4_audio::Mpeg4Audio;
pub use opus::Opus;
pub use simple::{G711, G722, Lpcm, Mjpeg, Mpeg2Audio, Mpeg2Video, Vorbis};
pub use vp8::Vp8;
pub use vp9::Vp9;

/// Clock rates of the static payload types assigned in
/// <https://www.iana.org/assignments/rtp-parameters/rtp-parameters.xhtml>.
static STATIC_CLOCK_RATES: Lazy<HashMap<u8, u32>> = Lazy::new(|| {
    let mut m = HashMap::new();
    for &pt in &[0u8, 1, 2, 3, 4, 5, 7, 8, 9, 12, 13, 15, 18] {
        m.insert(pt, 8_000);
    }
    m.insert(6, 16_000);
    m.insert(10, 44_100);
    m.insert(11, 44_100);
    m.insert(16, 11_025);
    m.insert(17, 22_050);
    for &pt in &[14u8, 25, 26, 28, 31, 32, 33, 34] {
        m.insert(pt, 90_000);
    }
    m
});

pub(crate) fn static_clock_rate(payload_type: u8) -> Option<u32> {
    STATIC_CLOCK_RATES.get(&payload_type).copied()
}

/// Splits an `rtpmap` attribute value (`encoding/clock[/params]`) into the
/// lowercased encoding name and the remainder.
pub(crate) fn split_rtpmap(rtpmap: &str) -> (String, &str) {
    match rtpmap.find('/') {
        Some(i) => (rtpmap[..i].to_ascii_lowercase(), &rtpmap[i + 1..]),
        None => (rtpmap.to_ascii_lowercase(), ""),
    }
}

/// Parses an `fmtp` attribute value into `(key, value)` pairs with
/// lowercased keys. Malformed entries are skipped, as cameras routinely
/// send trailing semicolons and stray spaces.
pub(crate) fn parse_fmtp(fmtp: &str) -> Vec<(String, String)> {
    fmtp.split(';')
        .filter_map(|kv| {
            let kv = kv.trim();
            if kv.is_empty() {
                return None;
            }
            let i = kv.find('=')?;
            Some((kv[..i].to_ascii_lowercase(), kv[i + 1..].to_owned()))
        })
        .collect()
}

/// A format of a media: a codec plus the payload type used to ship it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Format {
    G711(G711),
    G722(G722),
    Generic(Generic),
    H264(H264),
    H265(H265),
    Lpcm(Lpcm),
    Mjpeg(Mjpeg),
    Mpeg2Audio(Mpeg2Audio),
    Mpeg2Video(Mpeg2Video),
    Mpeg4Audio(Mpeg4Audio),
    Opus(Opus),
    Vorbis(Vorbis),
    Vp8(Vp8),
    Vp9(Vp9),
}

impl Format {
    /// Builds a format from the pieces of an SDP media description relevant
    /// to one payload type. `rtpmap` and `fmtp` are the attribute values
    /// with the leading payload type already stripped.
    pub fn unmarshal(
        media_type: &str,
        payload_type: u8,
        rtpmap: Option<&str>,
        fmtp: Option<&str>,
    ) -> Result<Format, String> {
        let (codec, clock) = match rtpmap {
            Some(r) => {
                let (codec, rest) = split_rtpmap(r);
                (codec, rest.to_owned())
            }
            None => (String::new(), String::new()),
        };
        let fmtp = fmtp.map(parse_fmtp).unwrap_or_default();

        Ok(match media_type {
            "video" => match (payload_type, codec.as_str(), clock.as_str()) {
                (26, _, _) => Format::Mjpeg(Mjpeg),
                (32, _, _) => Format::Mpeg2Video(Mpeg2Video),
                (_, "h264", "90000") => Format::H264(H264::unmarshal(payload_type, &fmtp)?),
                (_, "h265", "90000") => Format::H265(H265::unmarshal(payload_type, &fmtp)?),
                (_, "vp8", "90000") => Format::Vp8(Vp8::unmarshal(payload_type, &fmtp)?),
                (_, "vp9", "90000") => Format::Vp9(Vp9::unmarshal(payload_type, &fmtp)?),
                _ => Format::Generic(Generic::unmarshal(payload_type, rtpmap, fmtp)?),
            },
            "audio" => match (payload_type, codec.as_str()) {
                (0, _) => Format::G711(G711 { mu_law: true }),
                (8, _) => Format::G711(G711 { mu_law: false }),
                (9, _) => Format::G722(G722),
                (14, _) => Format::Mpeg2Audio(Mpeg2Audio),
                (_, "l8") | (_, "l16") | (_, "l24") => {
                    Format::Lpcm(Lpcm::unmarshal(payload_type, &codec, &clock)?)
                }
                (_, "mpeg4-generic") => {
                    Format::Mpeg4Audio(Mpeg4Audio::unmarshal(payload_type, &clock, &fmtp)?)
                }
                (_, "vorbis") => Format::Vorbis(Vorbis::unmarshal(payload_type, &clock, &fmtp)?),
                (_, "opus") => Format::Opus(Opus::unmarshal(payload_type, &clock, &fmtp)?),
                _ => Format::Generic(Generic::unmarshal(payload_type, rtpmap, fmtp)?),
            },
            _ => Format::Generic(Generic::unmarshal(payload_type, rtpmap, fmtp)?),
        })
    }

    /// A short codec name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Format::G711(f) if f.mu_law => "PCMU",
            Format::G711(_) => "PCMA",
            Format::G722(_) => "G722",
            Format::Generic(_) => "Generic",
            Format::H264(_) => "H264",
            Format::H265(_) => "H265",
            Format::Lpcm(_) => "LPCM",
            Format::Mjpeg(_) => "M-JPEG",
            Format::Mpeg2Audio(_) => "MPEG-2 audio",
            Format::Mpeg2Video(_) => "MPEG-2 video",
            Format::Mpeg4Audio(_) => "MPEG-4 audio",
            Format::Opus(_) => "Opus",
            Format::Vorbis(_) => "Vorbis",
            Format::Vp8(_) => "VP8",
            Format::Vp9(_) => "VP9",
        }
    }

    pub fn payload_type(&self) -> u8 {
        match self {
            Format::G711(f) => {
                if f.mu_law {
                    0
                } else {
                    8
                }
            }
            Format::G722(_) => 9,
            Format::Generic(f) => f.payload_type,
            Format::H264(f) => f.payload_type,
            Format::H265(f) => f.payload_type,
            Format::Lpcm(f) => f.payload_type,
            Format::Mjpeg(_) => 26,
            Format::Mpeg2Audio(_) => 14,
            Format::Mpeg2Video(_) => 32,
            Format::Mpeg4Audio(f) => f.payload_type,
            Format::Opus(f) => f.payload_type,
            Format::Vorbis(f) => f.payload_type,
            Format::Vp8(f) => f.payload_type,
            Format::Vp9(f) => f.payload_type,
        }
    }

    /// The RTP clock rate. Non-zero for every variant except a [`Generic`]
    /// whose payload type is unassigned and whose rtpmap is absent; such a
    /// format must not reach the RTCP timestamp math.
    pub fn clock_rate(&self) -> u32 {
        match self {
            Format::G711(_) | Format::G722(_) => 8_000,
            Format::Generic(f) => f.clock_rate,
            Format::H264(_) | Format::H265(_) => 90_000,
            Format::Lpcm(f) => f.sample_rate,
            Format::Mjpeg(_) | Format::Mpeg2Video(_) => 90_000,
            Format::Mpeg2Audio(_) => 90_000,
            Format::Mpeg4Audio(f) => f.sample_rate,
            Format::Opus(_) => 48_000,
            Format::Vorbis(f) => f.sample_rate,
            Format::Vp8(_) | Format::Vp9(_) => 90_000,
        }
    }

    /// Encodes the format as `(rtpmap value, fmtp pairs)`, both without the
    /// leading payload type. Static payload types return no rtpmap.
    pub fn marshal(&self) -> (Option<String>, Vec<(String, String)>) {
        match self {
            Format::G711(f) => (
                Some(if f.mu_law {
                    "PCMU/8000".to_owned()
                } else {
                    "PCMA/8000".to_owned()
                }),
                Vec::new(),
            ),
            Format::G722(_) => (Some("G722/8000".to_owned()), Vec::new()),
            Format::Generic(f) => (f.rtpmap.clone(), f.fmtp.clone()),
            Format::H264(f) => f.marshal(),
            Format::H265(f) => f.marshal(),
            Format::Lpcm(f) => f.marshal(),
            Format::Mjpeg(_) => (Some("JPEG/90000".to_owned()), Vec::new()),
            Format::Mpeg2Audio(_) => (None, Vec::new()),
            Format::Mpeg2Video(_) => (None, Vec::new()),
            Format::Mpeg4Audio(f) => f.marshal(),
            Format::Opus(f) => f.marshal(),
            Format::Vorbis(f) => f.marshal(),
            Format::Vp8(f) => f.marshal(),
            Format::Vp9(f) => f.marshal(),
        }
    }

    /// Whether an RTP packet with this payload carries a timestamp whose
    /// presentation and decoding instants coincide, making it eligible as
    /// the NTP↔RTP anchor of a sender report.
    ///
    /// Only H.264 actually inspects the payload (IDR presence); all other
    /// codecs answer `true`, so B-frame-capable codecs other than H.264 may
    /// anchor sender reports slightly off. Known limitation.
    pub fn pts_equals_dts(&self, payload: &[u8]) -> bool {
        match self {
            Format::H264(f) => f.rtp_payload_contains_idr(payload),
            _ => true,
        }
    }
}
