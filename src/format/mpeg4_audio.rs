// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! MPEG-4 audio (AAC) format; see [RFC 3640](https://datatracker.ietf.org/doc/html/rfc3640).

use bytes::Bytes;

/// AAC carried as `mpeg4-generic`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mpeg4Audio {
    pub payload_type: u8,
    pub sample_rate: u32,
    pub channels: Option<u32>,
    pub profile_level_id: Option<u32>,
    /// The raw AudioSpecificConfig from the `config` parameter.
    pub config: Option<Bytes>,
    pub size_length: Option<u32>,
    pub index_length: Option<u32>,
    pub index_delta_length: Option<u32>,
}

impl Mpeg4Audio {
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
        let channels = match parts.next() {
            Some(c) => Some(c.parse().map_err(|_| format!("invalid clock ({})", clock))?),
            None => None,
        };

        let mut f = Mpeg4Audio {
            payload_type,
            sample_rate,
            channels,
            profile_level_id: None,
            config: None,
            size_length: None,
            index_length: None,
            index_delta_length: None,
        };
        fn num(k: &str, v: &str) -> Result<u32, String> {
            v.parse().map_err(|_| format!("invalid {} ({})", k, v))
        }
        for (k, v) in fmtp {
            match k.as_str() {
                "profile-level-id" => f.profile_level_id = Some(num(k, v)?),
                "config" => {
                    f.config = Some(Bytes::from(
                        hex::decode(v).map_err(|_| format!("invalid config ({})", v))?,
                    ))
                }
                "sizelength" => f.size_length = Some(num(k, v)?),
                "indexlength" => f.index_length = Some(num(k, v)?),
                "indexdeltalength" => f.index_delta_length = Some(num(k, v)?),
                _ => {}
            }
        }
        Ok(f)
    }

    pub(crate) fn marshal(&self) -> (Option<String>, Vec<(String, String)>) {
        let rtpmap = match self.channels {
            Some(c) => format!("mpeg4-generic/{}/{}", self.sample_rate, c),
            None => format!("mpeg4-generic/{}", self.sample_rate),
        };
        let mut fmtp = vec![("streamtype".to_owned(), "5".to_owned()),
            ("mode".to_owned(), "AAC-hbr".to_owned())];
        if let Some(v) = self.profile_level_id {
            fmtp.push(("profile-level-id".to_owned(), v.to_string()));
        }
        if let Some(c) = &self.config {
            fmtp.push(("config".to_owned(), hex::encode(c)));
        }
        if let Some(v) = self.size_length {
            fmtp.push(("sizelength".to_owned(), v.to_string()));
        }
        if let Some(v) = self.index_length {
            fmtp.push(("indexlength".to_owned(), v.to_string()));
        }
        if let Some(v) = self.index_delta_length {
            fmtp.push(("indexdeltalength".to_owned(), v.to_string()));
        }
        (Some(rtpmap), fmtp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aac_fmtp() {
        let f = Mpeg4Audio::unmarshal(
            96,
            "48000/2",
            &crate::format::parse_fmtp(
                "profile-level-id=1; mode=AAC-hbr; sizelength=13; indexlength=3; indexdeltalength=3; config=1190",
            ),
        )
        .unwrap();
        assert_eq!(f.sample_rate, 48_000);
        assert_eq!(f.channels, Some(2));
        assert_eq!(f.size_length, Some(13));
        assert_eq!(f.config.as_deref(), Some(&[0x11, 0x90][..]));
    }
}
