// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The formats that carry no interesting parameters: fixed-payload-type
//! audio/video codecs plus LPCM and Vorbis.

use bytes::Bytes;

/// G.711: PCMU (payload type 0) or PCMA (payload type 8), 8 kHz.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct G711 {
    pub mu_law: bool,
}

/// G.722, payload type 9. RFC 3551: the RTP clock rate is 8 kHz even though
/// the codec samples at 16 kHz, an acknowledged historical error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct G722;

/// Motion JPEG, payload type 26, 90 kHz.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mjpeg;

/// MPEG-1/2 audio, payload type 14, 90 kHz.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mpeg2Audio;

/// MPEG-1/2 video, payload type 32, 90 kHz.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mpeg2Video;

/// Uncompressed linear PCM (`L8`/`L16`/`L24`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lpcm {
    pub payload_type: u8,
    pub bit_depth: u32,
    pub sample_rate: u32,
    pub channels: Option<u32>,
}

impl Lpcm {
    pub(crate) fn unmarshal(payload_type: u8, codec: &str, clock: &str) -> Result<Self, String> {
        let bit_depth = match codec {
            "l8" => 8,
            "l16" => 16,
            "l24" => 24,
            _ => return Err(format!("invalid LPCM codec ({})", codec)),
        };
        let mut parts = clock.splitn(2, '/');
        let sample_rate: u32 = parts
            .next()
            .unwrap_or("")
            .parse()
            .map_err(|_| format!("invalid clock ({})", clock))?;
        let channels = match parts.next() {
            Some(c) => Some(c.parse().map_err(|_| format!("invalid clock ({})", clock))?),
            None => None,
        };
        Ok(Lpcm {
            payload_type,
            bit_depth,
            sample_rate,
            channels,
        })
    }

    pub(crate) fn marshal(&self) -> (Option<String>, Vec<(String, String)>) {
        let rtpmap = match self.channels {
            Some(c) => format!("L{}/{}/{}", self.bit_depth, self.sample_rate, c),
            None => format!("L{}/{}", self.bit_depth, self.sample_rate),
        };
        (Some(rtpmap), Vec::new())
    }
}

/// Vorbis; see [RFC 5215](https://datatracker.ietf.org/doc/html/rfc5215).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vorbis {
    pub payload_type: u8,
    pub sample_rate: u32,
    pub channels: u32,
    /// The base64 `configuration` parameter (identification, comment, and
    /// setup headers).
    pub configuration: Option<Bytes>,
}

impl Vorbis {
    pub(crate) fn unmarshal(
        payload_type: u8,
        clock: &str,
        fmtp: &[(String, String)],
    ) -> Result<Self, String> {
        let mut parts = clock.splitn(2, '/');
        let sample_rate: u32 = parts
            .next()
            .unwrap_or("")
            .parse()
            .map_err(|_| format!("invalid clock ({})", clock))?;
        let channels: u32 = parts
            .next()
            .ok_or_else(|| format!("invalid clock ({})", clock))?
            .parse()
            .map_err(|_| format!("invalid clock ({})", clock))?;
        let mut configuration = None;
        for (k, v) in fmtp {
            if k == "configuration" {
                configuration = Some(Bytes::from(
                    base64::decode(v).map_err(|_| format!("invalid configuration ({})", v))?,
                ));
            }
        }
        Ok(Vorbis {
            payload_type,
            sample_rate,
            channels,
            configuration,
        })
    }

    pub(crate) fn marshal(&self) -> (Option<String>, Vec<(String, String)>) {
        let mut fmtp = Vec::new();
        if let Some(c) = &self.configuration {
            fmtp.push(("configuration".to_owned(), base64::encode(c)));
        }
        (
            Some(format!("VORBIS/{}/{}", self.sample_rate, self.channels)),
            fmtp,
        )
    }
}
