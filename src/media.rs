// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Media descriptions: the bridge between SDP media sections and the
//! engine's [`Format`](crate::format::Format) registry, plus control-URL
//! resolution against `Content-Base`.

use std::io::Cursor;

use smallvec::SmallVec;
use url::Url;

use crate::format::Format;
use crate::{Error, Result};

use sdp::common_description::{Address, Attribute, ConnectionInformation};
use sdp::media_description::{MediaDescription, MediaName, RangedPort};
use sdp::session_description::{Origin, SessionDescription, TimeDescription, Timing};

/// The type of a media stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MediaType {
    Video,
    Audio,
    Application,
}

impl MediaType {
    fn as_str(self) -> &'static str {
        match self {
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Application => "application",
        }
    }
}

/// The declared direction of a media stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Sendonly,
    Recvonly,
    Sendrecv,
}

/// One media stream: a type, an optional direction, a control attribute,
/// and one or more formats.
#[derive(Clone, Debug, PartialEq)]
pub struct Media {
    pub media_type: MediaType,
    pub direction: Option<Direction>,
    pub control: String,
    pub formats: SmallVec<[Format; 2]>,
}

fn format_attribute<'a>(
    attributes: &'a [Attribute],
    payload_type: u8,
    key: &str,
) -> Option<&'a str> {
    attributes.iter().find_map(|a| {
        if a.key != key {
            return None;
        }
        let v = a.value.as_deref()?.trim();
        let i = v.find(' ')?;
        if v[..i].parse::<u8>().ok()? == payload_type {
            Some(v[i + 1..].trim())
        } else {
            None
        }
    })
}

impl Media {
    pub(crate) fn unmarshal(md: &MediaDescription) -> Result<Media> {
        let media_type = match md.media_name.media.as_str() {
            "video" => MediaType::Video,
            "audio" => MediaType::Audio,
            "application" => MediaType::Application,
            other => {
                return Err(Error::MalformedMessage(format!(
                    "unsupported media type {:?}",
                    other
                )));
            }
        };

        let mut direction = None;
        let mut control = String::new();
        for a in &md.attributes {
            match a.key.as_str() {
                "sendonly" => direction = Some(Direction::Sendonly),
                "recvonly" => direction = Some(Direction::Recvonly),
                "sendrecv" => direction = Some(Direction::Sendrecv),
                "control" => control = a.value.clone().unwrap_or_default(),
                _ => {}
            }
        }

        let mut formats = SmallVec::new();
        for pt_str in &md.media_name.formats {
            let payload_type: u8 = pt_str.parse().map_err(|_| {
                Error::MalformedMessage(format!("invalid payload type {:?}", pt_str))
            })?;
            if payload_type & 0x80 != 0 {
                return Err(Error::MalformedMessage(format!(
                    "invalid payload type {}",
                    payload_type
                )));
            }
            let rtpmap = format_attribute(&md.attributes, payload_type, "rtpmap");
            let fmtp = format_attribute(&md.attributes, payload_type, "fmtp");
            formats.push(
                Format::unmarshal(media_type.as_str(), payload_type, rtpmap, fmtp)
                    .map_err(Error::MalformedMessage)?,
            );
        }
        if formats.is_empty() {
            return Err(Error::MalformedMessage("media has no formats".to_owned()));
        }

        Ok(Media {
            media_type,
            direction,
            control,
            formats,
        })
    }

    pub(crate) fn marshal(&self) -> MediaDescription {
        let mut attributes = vec![Attribute {
            key: "control".to_owned(),
            value: Some(self.control.clone()),
        }];
        if let Some(d) = self.direction {
            attributes.push(Attribute {
                key: match d {
                    Direction::Sendonly => "sendonly",
                    Direction::Recvonly => "recvonly",
                    Direction::Sendrecv => "sendrecv",
                }
                .to_owned(),
                value: None,
            });
        }

        let mut pt_strs = Vec::with_capacity(self.formats.len());
        for f in &self.formats {
            let pt = f.payload_type();
            pt_strs.push(pt.to_string());
            let (rtpmap, fmtp) = f.marshal();
            if let Some(rtpmap) = rtpmap {
                attributes.push(Attribute {
                    key: "rtpmap".to_owned(),
                    value: Some(format!("{} {}", pt, rtpmap)),
                });
            }
            if !fmtp.is_empty() {
                let joined = fmtp
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join("; ");
                attributes.push(Attribute {
                    key: "fmtp".to_owned(),
                    value: Some(format!("{} {}", pt, joined)),
                });
            }
        }

        MediaDescription {
            media_name: MediaName {
                media: self.media_type.as_str().to_owned(),
                port: RangedPort {
                    value: 0,
                    range: None,
                },
                protos: vec!["RTP".to_owned(), "AVP".to_owned()],
                formats: pt_strs,
            },
            media_title: None,
            connection_information: None,
            bandwidth: Vec::new(),
            encryption_key: None,
            attributes,
        }
    }

    /// Resolves the media's control attribute to an absolute URL.
    ///
    /// An empty control means the base itself. An absolute `rtsp(s)://`
    /// control keeps its path but inherits host and credentials from the
    /// base. A relative control is appended to the base: after the query
    /// when the control itself starts with `?`, after the path otherwise.
    pub fn url(&self, content_base: &Url) -> Result<Url> {
        if self.control.is_empty() {
            return Ok(content_base.clone());
        }
        if self.control.starts_with("rtsp://") || self.control.starts_with("rtsps://") {
            let mut u = Url::parse(&self.control)
                .map_err(|e| Error::InvalidUrl(format!("control attribute: {}", e)))?;
            if let Some(host) = content_base.host_str() {
                u.set_host(Some(host))
                    .map_err(|e| Error::InvalidUrl(e.to_string()))?;
            }
            let _ = u.set_port(content_base.port());
            let _ = u.set_username(content_base.username());
            let _ = u.set_password(content_base.password());
            return Ok(u);
        }
        let mut base = content_base.to_string();
        if !self.control.starts_with('?') && !base.ends_with('/') {
            base.push('/');
        }
        Url::parse(&(base + &self.control))
            .map_err(|e| Error::InvalidUrl(format!("control attribute: {}", e)))
    }

    /// The first format carrying the given payload type.
    pub fn format_by_payload_type(&self, payload_type: u8) -> Option<&Format> {
        self.formats
            .iter()
            .find(|f| f.payload_type() == payload_type)
    }
}

/// Parses an `application/sdp` body into medias.
pub fn unmarshal_sdp(body: &[u8]) -> Result<Vec<Media>> {
    let sd = SessionDescription::unmarshal(&mut Cursor::new(body))
        .map_err(|e| Error::MalformedMessage(format!("invalid SDP: {}", e)))?;
    if sd.media_descriptions.is_empty() {
        return Err(Error::MalformedMessage("SDP has no medias".to_owned()));
    }
    sd.media_descriptions.iter().map(Media::unmarshal).collect()
}

/// Encodes medias into an `application/sdp` body. `origin_address` lands in
/// the `o=` and `c=` lines; the medias' control attributes are emitted
/// verbatim, so callers that need absolute controls rewrite them first.
pub fn marshal_sdp(medias: &[Media], origin_address: &str) -> String {
    let sd = SessionDescription {
        version: 0,
        origin: Origin {
            username: "-".to_owned(),
            session_id: 0,
            session_version: 0,
            network_type: "IN".to_owned(),
            address_type: "IP4".to_owned(),
            unicast_address: origin_address.to_owned(),
        },
        session_name: "Stream".to_owned(),
        session_information: None,
        uri: None,
        email_address: None,
        phone_number: None,
        connection_information: Some(ConnectionInformation {
            network_type: "IN".to_owned(),
            address_type: "IP4".to_owned(),
            address: Some(Address {
                address: origin_address.to_owned(),
                ttl: None,
                range: None,
            }),
        }),
        bandwidth: Vec::new(),
        time_descriptions: vec![TimeDescription {
            timing: Timing {
                start_time: 0,
                stop_time: 0,
            },
            repeat_times: Vec::new(),
        }],
        time_zones: Vec::new(),
        encryption_key: None,
        attributes: vec![Attribute {
            key: "control".to_owned(),
            value: Some("*".to_owned()),
        }],
        media_descriptions: medias.iter().map(Media::marshal).collect(),
    };
    sd.marshal()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Format, G711};

    fn h264_media() -> Media {
        Media {
            media_type: MediaType::Video,
            direction: None,
            control: "trackID=0".to_owned(),
            formats: smallvec::smallvec![Format::unmarshal(
                "video",
                96,
                Some("H264/90000"),
                Some("packetization-mode=1"),
            )
            .unwrap()],
        }
    }

    #[test]
    fn sdp_roundtrip() {
        let medias = vec![
            h264_media(),
            Media {
                media_type: MediaType::Audio,
                direction: Some(Direction::Recvonly),
                control: "trackID=1".to_owned(),
                formats: smallvec::smallvec![Format::G711(G711 { mu_law: true })],
            },
        ];
        let body = marshal_sdp(&medias, "192.0.2.1");
        assert!(body.contains("m=video 0 RTP/AVP 96"));
        assert!(body.contains("a=rtpmap:96 H264/90000"));
        assert!(body.contains("m=audio 0 RTP/AVP 0"));

        let parsed = unmarshal_sdp(body.as_bytes()).unwrap();
        assert_eq!(parsed, medias);
    }

    #[test]
    fn control_url_resolution() {
        let base = Url::parse("rtsp://h/p/").unwrap();
        let m = h264_media();
        assert_eq!(m.url(&base).unwrap().as_str(), "rtsp://h/p/trackID=0");

        // No trailing slash on the base.
        let base = Url::parse("rtsp://h/p").unwrap();
        assert_eq!(m.url(&base).unwrap().as_str(), "rtsp://h/p/trackID=0");

        // Empty control falls back to the base.
        let mut m2 = h264_media();
        m2.control = String::new();
        assert_eq!(m2.url(&base).unwrap(), base);

        // Absolute control inherits host and credentials.
        let base = Url::parse("rtsp://user:pw@h:8554/p").unwrap();
        let mut m3 = h264_media();
        m3.control = "rtsp://other/p/trackID=3".to_owned();
        assert_eq!(
            m3.url(&base).unwrap().as_str(),
            "rtsp://user:pw@h:8554/p/trackID=3"
        );
    }

    #[test]
    fn rejects_empty_or_bad_sdp() {
        assert!(unmarshal_sdp(b"v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=x\r\nt=0 0\r\n").is_err());
        assert!(unmarshal_sdp(b"garbage").is_err());
    }
}
