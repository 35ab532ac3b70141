// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Opus format; see [RFC 7587](https://datatracker.ietf.org/doc/html/rfc7587).

/// Opus. RFC 7587: the RTP timestamp always runs at 48 kHz and the rtpmap
/// channel count is always 2, regardless of the coded audio.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Opus {
    pub payload_type: u8,
    pub is_stereo: bool,
}

impl Opus {
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
        if sample_rate != 48_000 {
            return Err(format!("invalid sample rate: {}", sample_rate));
        }
        let channels: u32 = parts
            .next()
            .ok_or_else(|| format!("invalid clock ({})", clock))?
            .parse()
            .map_err(|_| format!("invalid clock ({})", clock))?;
        if channels != 2 {
            return Err(format!("invalid channel count: {}", channels));
        }

        let mut is_stereo = false;
        for (k, v) in fmtp {
            if k == "sprop-stereo" {
                is_stereo = v == "1";
            }
        }
        Ok(Opus {
            payload_type,
            is_stereo,
        })
    }

    pub(crate) fn marshal(&self) -> (Option<String>, Vec<(String, String)>) {
        (
            Some("opus/48000/2".to_owned()),
            vec![(
                "sprop-stereo".to_owned(),
                if self.is_stereo { "1" } else { "0" }.to_owned(),
            )],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_clock() {
        assert!(Opus::unmarshal(111, "44100/2", &[]).is_err());
        assert!(Opus::unmarshal(111, "48000/1", &[]).is_err());
        assert!(Opus::unmarshal(111, "48000", &[]).is_err());
    }

    #[test]
    fn stereo_flag() {
        let f = Opus::unmarshal(111, "48000/2", &[("sprop-stereo".to_owned(), "1".to_owned())])
            .unwrap();
        assert!(f.is_stereo);
        let (rtpmap, fmtp) = f.marshal();
        assert_eq!(rtpmap.as_deref(), Some("opus/48000/2"));
        assert_eq!(fmtp, vec![("sprop-stereo".to_owned(), "1".to_owned())]);
    }
}
