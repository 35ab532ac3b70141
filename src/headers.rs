// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed `Transport` and `Session` headers; see [RFC 2326 section
//! 12.39](https://datatracker.ietf.org/doc/html/rfc2326#section-12.39) and
//! 12.37. `rtsp-types` keeps headers as flat strings; these two carry enough
//! structure (negotiated ports, channels, timeouts) to deserve real types.

use std::net::IpAddr;

use crate::{Error, Result};

/// Lower transport of a `Transport` header: `RTP/AVP[/UDP]` or `RTP/AVP/TCP`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
}

/// `unicast` / `multicast` delivery parameter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Unicast,
    Multicast,
}

/// `mode=play` / `mode=record` parameter (quotes optional on the wire).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransportMode {
    Play,
    Record,
}

/// A parsed `Transport` header.
///
/// Only the first comma-separated alternative is considered; cameras and
/// servers that offer several put the preferred one first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transport {
    pub protocol: Option<Protocol>,
    pub delivery: Option<Delivery>,
    pub client_port: Option<(u16, u16)>,
    pub server_port: Option<(u16, u16)>,
    /// `port=a-b`: the group ports of a multicast delivery.
    pub port: Option<(u16, u16)>,
    pub interleaved: Option<(u8, u8)>,
    pub ttl: Option<u8>,
    pub destination: Option<IpAddr>,
    pub ssrc: Option<u32>,
    pub mode: Option<TransportMode>,
}

fn parse_port_pair(v: &str) -> Result<(u16, u16)> {
    let mut it = v.splitn(2, '-');
    let first = it.next().unwrap_or("");
    let a: u16 = first
        .parse()
        .map_err(|_| Error::MalformedMessage(format!("bad port {:?}", first)))?;
    let b = match it.next() {
        Some(second) => second
            .parse()
            .map_err(|_| Error::MalformedMessage(format!("bad port {:?}", second)))?,
        None => a
            .checked_add(1)
            .ok_or_else(|| Error::MalformedMessage(format!("port {} has no successor", a)))?,
    };
    Ok((a, b))
}

fn parse_channel_pair(v: &str) -> Result<(u8, u8)> {
    let (a, b) = parse_port_pair(v)?;
    if a > 255 || b > 255 {
        return Err(Error::BadInterleavedFrame(format!(
            "channel out of range: {}-{}",
            a, b
        )));
    }
    Ok((a as u8, b as u8))
}

impl Transport {
    pub fn parse(value: &str) -> Result<Self> {
        let first = value.split(',').next().unwrap_or("");
        let mut t = Transport::default();
        for (i, part) in first.split(';').enumerate() {
            let part = part.trim();
            if i == 0 {
                t.protocol = match part {
                    "RTP/AVP" | "RTP/AVP/UDP" => Some(Protocol::Udp),
                    "RTP/AVP/TCP" => Some(Protocol::Tcp),
                    _ => {
                        return Err(Error::UnsupportedTransport(part.to_owned()));
                    }
                };
                continue;
            }
            match part {
                "unicast" => t.delivery = Some(Delivery::Unicast),
                "multicast" => t.delivery = Some(Delivery::Multicast),
                _ => {
                    let (key, v) = match part.find('=') {
                        Some(p) => (&part[..p], &part[p + 1..]),
                        None => continue, // unknown valueless parameter
                    };
                    match key {
                        "client_port" => t.client_port = Some(parse_port_pair(v)?),
                        "server_port" => t.server_port = Some(parse_port_pair(v)?),
                        "port" => t.port = Some(parse_port_pair(v)?),
                        "interleaved" => t.interleaved = Some(parse_channel_pair(v)?),
                        "ttl" => {
                            t.ttl = Some(v.parse().map_err(|_| {
                                Error::MalformedMessage(format!("bad ttl {:?}", v))
                            })?)
                        }
                        "destination" => {
                            t.destination = Some(v.parse().map_err(|_| {
                                Error::MalformedMessage(format!("bad destination {:?}", v))
                            })?)
                        }
                        "ssrc" => {
                            t.ssrc = Some(u32::from_str_radix(v, 16).map_err(|_| {
                                Error::MalformedMessage(format!("bad ssrc {:?}", v))
                            })?)
                        }
                        "mode" => {
                            t.mode = match v.trim_matches('"').to_ascii_lowercase().as_str() {
                                "play" => Some(TransportMode::Play),
                                "record" | "receive" => Some(TransportMode::Record),
                                _ => {
                                    return Err(Error::MalformedMessage(format!(
                                        "bad mode {:?}",
                                        v
                                    )));
                                }
                            }
                        }
                        _ => {} // ignore unknown parameters
                    }
                }
            }
        }
        Ok(t)
    }

    pub fn marshal(&self) -> String {
        let mut s = String::with_capacity(64);
        s.push_str(match self.protocol {
            Some(Protocol::Tcp) => "RTP/AVP/TCP",
            _ => "RTP/AVP",
        });
        match self.delivery {
            Some(Delivery::Unicast) => s.push_str(";unicast"),
            Some(Delivery::Multicast) => s.push_str(";multicast"),
            None => {}
        }
        if let Some(d) = self.destination {
            s.push_str(&format!(";destination={}", d));
        }
        if let Some((a, b)) = self.client_port {
            s.push_str(&format!(";client_port={}-{}", a, b));
        }
        if let Some((a, b)) = self.server_port {
            s.push_str(&format!(";server_port={}-{}", a, b));
        }
        if let Some((a, b)) = self.port {
            s.push_str(&format!(";port={}-{}", a, b));
        }
        if let Some((a, b)) = self.interleaved {
            s.push_str(&format!(";interleaved={}-{}", a, b));
        }
        if let Some(ttl) = self.ttl {
            s.push_str(&format!(";ttl={}", ttl));
        }
        if let Some(ssrc) = self.ssrc {
            s.push_str(&format!(";ssrc={:08X}", ssrc));
        }
        match self.mode {
            Some(TransportMode::Play) => s.push_str(";mode=play"),
            Some(TransportMode::Record) => s.push_str(";mode=record"),
            None => {}
        }
        s
    }
}

/// A parsed `Session` header: the opaque token plus the server-advertised
/// timeout on responses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub timeout: Option<u64>,
}

impl Session {
    pub fn parse(value: &str) -> Result<Self> {
        let mut it = value.split(';');
        let id = it.next().unwrap_or("").trim();
        if id.is_empty() {
            return Err(Error::MalformedMessage("empty Session header".to_owned()));
        }
        let mut timeout = None;
        for p in it {
            if let Some(v) = p.trim().strip_prefix("timeout=") {
                timeout = Some(v.parse().map_err(|_| {
                    Error::MalformedMessage(format!("bad session timeout {:?}", v))
                })?);
            }
        }
        Ok(Session {
            id: id.to_owned(),
            timeout,
        })
    }

    pub fn marshal(&self) -> String {
        match self.timeout {
            Some(t) => format!("{};timeout={}", self.id, t),
            None => self.id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_udp() {
        let t = Transport::parse("RTP/AVP;unicast;client_port=30000-30001").unwrap();
        assert_eq!(t.protocol, Some(Protocol::Udp));
        assert_eq!(t.delivery, Some(Delivery::Unicast));
        assert_eq!(t.client_port, Some((30000, 30001)));
        assert_eq!(t.interleaved, None);
        assert_eq!(
            t.marshal(),
            "RTP/AVP;unicast;client_port=30000-30001"
        );
    }

    #[test]
    fn transport_tcp() {
        let t = Transport::parse("RTP/AVP/TCP;unicast;interleaved=0-1;mode=\"PLAY\"").unwrap();
        assert_eq!(t.protocol, Some(Protocol::Tcp));
        assert_eq!(t.interleaved, Some((0, 1)));
        assert_eq!(t.mode, Some(TransportMode::Play));
    }

    #[test]
    fn transport_multicast() {
        let t = Transport::parse(
            "RTP/AVP;multicast;destination=239.255.0.1;port=5000-5001;ttl=16",
        )
        .unwrap();
        assert_eq!(t.delivery, Some(Delivery::Multicast));
        assert_eq!(t.destination, Some("239.255.0.1".parse().unwrap()));
        assert_eq!(t.port, Some((5000, 5001)));
        assert_eq!(t.ttl, Some(16));
    }

    #[test]
    fn transport_first_alternative_wins() {
        let t = Transport::parse("RTP/AVP/TCP;interleaved=2-3,RTP/AVP;client_port=1-2").unwrap();
        assert_eq!(t.protocol, Some(Protocol::Tcp));
        assert_eq!(t.client_port, None);
    }

    #[test]
    fn single_port_at_max_is_rejected() {
        assert!(matches!(
            Transport::parse("RTP/AVP;unicast;client_port=65535"),
            Err(Error::MalformedMessage(_))
        ));
        // A single value below the top still implies the odd successor.
        let t = Transport::parse("RTP/AVP;unicast;client_port=30000").unwrap();
        assert_eq!(t.client_port, Some((30000, 30001)));
    }

    #[test]
    fn transport_rejects_unknown_proto() {
        assert!(matches!(
            Transport::parse("RAW/RAW/UDP;unicast"),
            Err(Error::UnsupportedTransport(_))
        ));
    }

    #[test]
    fn session_header() {
        let s = Session::parse("38737028;timeout=60").unwrap();
        assert_eq!(s.id, "38737028");
        assert_eq!(s.timeout, Some(60));
        assert_eq!(s.marshal(), "38737028;timeout=60");

        let s = Session::parse("38737028").unwrap();
        assert_eq!(s.timeout, None);
        assert_eq!(s.marshal(), "38737028");
    }
}
