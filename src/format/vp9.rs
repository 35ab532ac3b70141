// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! VP9 format (payload draft); clock rate 90000.

/// VP9, clock rate 90000.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vp9 {
    pub payload_type: u8,
    pub max_fr: Option<u32>,
    pub max_fs: Option<u32>,
    pub profile_id: Option<u32>,
}

impl Vp9 {
    pub(crate) fn unmarshal(
        payload_type: u8,
        fmtp: &[(String, String)],
    ) -> Result<Self, String> {
        let mut f = Vp9 {
            payload_type,
            max_fr: None,
            max_fs: None,
            profile_id: None,
        };
        for (k, v) in fmtp {
            match k.as_str() {
                "max-fr" => {
                    f.max_fr = Some(v.parse().map_err(|_| format!("invalid max-fr ({})", v))?)
                }
                "max-fs" => {
                    f.max_fs = Some(v.parse().map_err(|_| format!("invalid max-fs ({})", v))?)
                }
                "profile-id" => {
                    f.profile_id =
                        Some(v.parse().map_err(|_| format!("invalid profile-id ({})", v))?)
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
        if let Some(v) = self.profile_id {
            fmtp.push(("profile-id".to_owned(), v.to_string()));
        }
        (Some("VP9/90000".to_owned()), fmtp)
    }
}
