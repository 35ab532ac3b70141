// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! H.264 format; see [RFC 6184](https://datatracker.ietf.org/doc/html/rfc6184).

use bytes::Bytes;
use h264_reader::nal::{NalHeader, UnitType};

/// H.264, clock rate 90000, out-of-band parameter sets in
/// `sprop-parameter-sets`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct H264 {
    pub payload_type: u8,
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
    pub packetization_mode: Option<u32>,
}

impl H264 {
    pub(crate) fn unmarshal(
        payload_type: u8,
        fmtp: &[(String, String)],
    ) -> Result<Self, String> {
        let mut f = H264 {
            payload_type,
            sps: None,
            pps: None,
            packetization_mode: None,
        };
        for (k, v) in fmtp {
            match k.as_str() {
                "sprop-parameter-sets" => {
                    let mut sets = v.split(',');
                    if let (Some(sps), Some(pps)) = (sets.next(), sets.next()) {
                        f.sps = Some(Bytes::from(base64::decode(sps).map_err(|_| {
                            format!("invalid sprop-parameter-sets ({})", v)
                        })?));
                        f.pps = Some(Bytes::from(base64::decode(pps).map_err(|_| {
                            format!("invalid sprop-parameter-sets ({})", v)
                        })?));
                    }
                }
                "packetization-mode" => {
                    f.packetization_mode = Some(
                        v.parse()
                            .map_err(|_| format!("invalid packetization-mode ({})", v))?,
                    );
                }
                _ => {}
            }
        }
        Ok(f)
    }

    pub(crate) fn marshal(&self) -> (Option<String>, Vec<(String, String)>) {
        let mut fmtp = Vec::new();
        if let Some(mode) = self.packetization_mode {
            fmtp.push(("packetization-mode".to_owned(), mode.to_string()));
        }
        let mut sets = Vec::new();
        if let Some(sps) = &self.sps {
            sets.push(base64::encode(sps));
        }
        if let Some(pps) = &self.pps {
            sets.push(base64::encode(pps));
        }
        if !sets.is_empty() {
            fmtp.push(("sprop-parameter-sets".to_owned(), sets.join(",")));
        }
        if let Some(sps) = &self.sps {
            if sps.len() >= 4 {
                fmtp.push((
                    "profile-level-id".to_owned(),
                    hex::encode_upper(&sps[1..4]),
                ));
            }
        }
        (Some("H264/90000".to_owned()), fmtp)
    }

    /// Whether an RTP payload contains an IDR slice, without depacketizing.
    /// Handles single NAL units plus the STAP-A and FU-A packetizations.
    pub(crate) fn rtp_payload_contains_idr(&self, payload: &[u8]) -> bool {
        if payload.is_empty() {
            return false;
        }
        match payload[0] & 0x1F {
            24 => {
                // STAP-A: 2-byte size prefix before each NALU.
                let mut rest = &payload[1..];
                while !rest.is_empty() {
                    if rest.len() < 2 {
                        return false;
                    }
                    let size = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
                    rest = &rest[2..];
                    if size == 0 || size > rest.len() {
                        return false;
                    }
                    if is_idr(rest[0]) {
                        return true;
                    }
                    rest = &rest[size..];
                }
                false
            }
            28 => {
                // FU-A: the type of the fragmented NALU is in the FU header;
                // only the fragment with the start bit counts.
                if payload.len() < 2 || (payload[1] >> 7) != 1 {
                    return false;
                }
                is_idr(payload[1])
            }
            _ => is_idr(payload[0]),
        }
    }
}

fn is_idr(header_byte: u8) -> bool {
    matches!(
        NalHeader::new(header_byte & 0x7F).map(|h| h.nal_unit_type()),
        Ok(UnitType::SliceLayerWithoutPartitioningIdr)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h264() -> H264 {
        H264 {
            payload_type: 96,
            sps: None,
            pps: None,
            packetization_mode: None,
        }
    }

    #[test]
    fn idr_single_nalu() {
        assert!(h264().rtp_payload_contains_idr(&[0x65, 0x88, 0x84]));
        assert!(!h264().rtp_payload_contains_idr(&[0x41, 0x9a, 0x00])); // non-IDR slice
        assert!(!h264().rtp_payload_contains_idr(&[]));
    }

    #[test]
    fn idr_stap_a() {
        // SPS (7) then IDR (5), each with a 2-byte size.
        let payload = [0x18, 0x00, 0x01, 0x67, 0x00, 0x02, 0x65, 0x88];
        assert!(h264().rtp_payload_contains_idr(&payload));

        // Truncated size field.
        assert!(!h264().rtp_payload_contains_idr(&[0x18, 0x00]));
        // Size past the end.
        assert!(!h264().rtp_payload_contains_idr(&[0x18, 0x00, 0x09, 0x65]));
    }

    #[test]
    fn idr_fu_a() {
        // Start fragment of an IDR.
        assert!(h264().rtp_payload_contains_idr(&[0x7C, 0x85, 0x00]));
        // Continuation fragment: not counted.
        assert!(!h264().rtp_payload_contains_idr(&[0x7C, 0x05, 0x00]));
        // Start fragment of a non-IDR slice.
        assert!(!h264().rtp_payload_contains_idr(&[0x7C, 0x81, 0x00]));
    }
}
