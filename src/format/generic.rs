// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Catch-all for codecs the engine has no specific knowledge of.

use crate::format::{split_rtpmap, static_clock_rate};

/// A format whose codec is unknown. The clock rate still resolves, from the
/// static payload-type table or the rtpmap, so RTCP keeps working; a clock
/// rate of zero means neither source had one and the format must stay out
/// of timestamp math.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Generic {
    pub payload_type: u8,
    pub rtpmap: Option<String>,
    pub fmtp: Vec<(String, String)>,
    pub clock_rate: u32,
}

impl Generic {
    pub(crate) fn unmarshal(
        payload_type: u8,
        rtpmap: Option<&str>,
        fmtp: Vec<(String, String)>,
    ) -> Result<Self, String> {
        let clock_rate = match static_clock_rate(payload_type) {
            Some(rate) => rate,
            None => match rtpmap {
                Some(r) => {
                    let (_, rest) = split_rtpmap(r);
                    let clock = rest.splitn(2, '/').next().unwrap_or("");
                    clock.parse().unwrap_or(0)
                }
                None => 0,
            },
        };
        Ok(Generic {
            payload_type,
            rtpmap: rtpmap.map(str::to_owned),
            fmtp,
            clock_rate,
        })
    }
}
