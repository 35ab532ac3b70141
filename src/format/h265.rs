// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! H.265 format; see [RFC 7798](https://datatracker.ietf.org/doc/html/rfc7798).

use bytes::Bytes;

/// H.265, clock rate 90000, parameter sets in `sprop-vps`/`sprop-sps`/`sprop-pps`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct H265 {
    pub payload_type: u8,
    pub vps: Option<Bytes>,
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
}

fn decode_sprop(key: &str, v: &str) -> Result<Bytes, String> {
    base64::decode(v)
        .map(Bytes::from)
        .map_err(|_| format!("invalid {} ({})", key, v))
}

impl H265 {
    pub(crate) fn unmarshal(
        payload_type: u8,
        fmtp: &[(String, String)],
    ) -> Result<Self, String> {
        let mut f = H265 {
            payload_type,
            vps: None,
            sps: None,
            pps: None,
        };
        for (k, v) in fmtp {
            match k.as_str() {
                "sprop-vps" => f.vps = Some(decode_sprop(k, v)?),
                "sprop-sps" => f.sps = Some(decode_sprop(k, v)?),
                "sprop-pps" => f.pps = Some(decode_sprop(k, v)?),
                _ => {}
            }
        }
        Ok(f)
    }

    pub(crate) fn marshal(&self) -> (Option<String>, Vec<(String, String)>) {
        let mut fmtp = Vec::new();
        if let Some(vps) = &self.vps {
            fmtp.push(("sprop-vps".to_owned(), base64::encode(vps)));
        }
        if let Some(sps) = &self.sps {
            fmtp.push(("sprop-sps".to_owned(), base64::encode(sps)));
        }
        if let Some(pps) = &self.pps {
            fmtp.push(("sprop-pps".to_owned(), base64::encode(pps)));
        }
        (Some("H265/90000".to_owned()), fmtp)
    }
}
