// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! VP8 format; see [RFC 7741](https://datatracker.ietf.org/doc/html/rfc7741).

/// VP8, clock rate 90000.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vp8 {
    pub payload_type: u8,
    pub max_fr: Option<u32>,
    pub max_fs: Option<u32>,
}

impl Vp8 {
    pub(crate) fn unmarshal(
        payload_type: u8,
        fmtp: &[(String, String)],
    ) -> Result<Self, String> {
        let mut f = Vp8 {
            payload_type,
            max_fr: None,
            max_fs: None,
        };
        for (k, v) in fmtp {
            match k.as_str() {
                "max-fr" => {
                    f.max_fr = Some(v.parse().map_err(|_| format!("invalid max-fr ({})", v))?)
                }
                "max-fs" => {
                    f.max_fs = Some(v.parse().map_err(|_| format!("invalid max-fs ({})", v))?)
                }
                _ => {}
            }
        }
        Ok(f)
    }

    pub(crate) fn marshal(&self) -> (Option<String>, Vec<(String, String)>) {
        let mut fmtp = Vec::new();
        if let Some(v) = self.max_fr {
            fmtp.push(("max-fr".to_owned(), v.to_string()));
        }
        if let Some(v) = self.max_fs {
            fmtp.push(("max-fs".to_owned(), v.to_string()));
        }
        (Some("VP8/90000".to_owned()), fmtp)
    }
}
