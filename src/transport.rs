// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! UDP transport plumbing: even/odd RTP+RTCP socket pairs, multicast
//! variants, and the shared receive loop with peer matching and the
//! maximum-packet-size drop rule. The TCP-interleaved transport needs no
//! sockets; it rides the control connection via channel numbers.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::{Error, Result};

/// Default maximum packet size, sized to fit a 1500-byte Ethernet MTU
/// minus IP and UDP headers.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1472;

/// A pair of UDP sockets bound to consecutive even/odd local ports.
pub(crate) struct UdpPair {
    pub(crate) rtp: Arc<UdpSocket>,
    pub(crate) rtcp: Arc<UdpSocket>,
    pub(crate) rtp_port: u16,
    pub(crate) rtcp_port: u16,
}

impl UdpPair {
    /// Binds a pair within `range` (even RTP port), or anywhere when no
    /// range is configured.
    pub(crate) async fn bind(range: Option<(u16, u16)>) -> Result<UdpPair> {
        for _ in 0..64 {
            let rtp_port = match range {
                Some((min, max)) => {
                    let min = (min + 1) & !1;
                    if max <= min {
                        return Err(Error::UdpPortAllocation);
                    }
                    let span = u32::from((max - min) / 2).max(1);
                    // thread_rng is !Send; don't hold it across an await.
                    let slot = rand::thread_rng().gen_range(0..span) as u16;
                    min + slot * 2
                }
                None => {
                    // Grab an ephemeral port and round down to even.
                    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
                    let p = probe.local_addr()?.port();
                    drop(probe);
                    p & !1
                }
            };
            if rtp_port == 0 {
                continue;
            }
            let rtp = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, rtp_port)).await {
                Ok(s) => s,
                Err(_) => continue,
            };
            let rtcp = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, rtp_port + 1)).await {
                Ok(s) => s,
                Err(_) => continue,
            };
            return Ok(UdpPair {
                rtp: Arc::new(rtp),
                rtcp: Arc::new(rtcp),
                rtp_port,
                rtcp_port: rtp_port + 1,
            });
        }
        Err(Error::UdpPortAllocation)
    }

    /// Binds a pair joined to a multicast group, for the receiving side.
    pub(crate) async fn bind_multicast(group: Ipv4Addr, rtp_port: u16) -> Result<UdpPair> {
        // The port comes off the wire; a topmost value has no RTCP slot.
        let rtcp_port = rtp_port.checked_add(1).ok_or(Error::UdpPortAllocation)?;
        let rtp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, rtp_port)).await?;
        rtp.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        let rtcp = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, rtcp_port)).await?;
        rtcp.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        Ok(UdpPair {
            rtp: Arc::new(rtp),
            rtcp: Arc::new(rtcp),
            rtp_port,
            rtcp_port,
        })
    }
}

/// The sending half of a server's multicast media: one socket pair with a
/// TTL, addressed at the group.
pub(crate) struct MulticastWriter {
    pub(crate) group: Ipv4Addr,
    pub(crate) pair: UdpPair,
}

impl MulticastWriter {
    pub(crate) async fn bind(group: Ipv4Addr, ttl: u32) -> Result<MulticastWriter> {
        let pair = UdpPair::bind(None).await?;
        pair.rtp.set_multicast_ttl_v4(ttl)?;
        pair.rtcp.set_multicast_ttl_v4(ttl)?;
        Ok(MulticastWriter { group, pair })
    }

    pub(crate) async fn send_rtp(&self, data: &[u8]) -> Result<()> {
        self.pair
            .rtp
            .send_to(data, (self.group, self.pair.rtp_port))
            .await?;
        Ok(())
    }

    pub(crate) async fn send_rtcp(&self, data: &[u8]) -> Result<()> {
        self.pair
            .rtcp
            .send_to(data, (self.group, self.pair.rtcp_port))
            .await?;
        Ok(())
    }
}

/// Allocates multicast group addresses from a configured base/prefix.
pub(crate) struct MulticastAllocator {
    base: u32,
    size: u32,
    next: u32,
}

impl MulticastAllocator {
    pub(crate) fn new(base: Ipv4Addr, prefix: u8) -> MulticastAllocator {
        let size = 1u32 << (32 - u32::from(prefix.min(32)));
        MulticastAllocator {
            base: u32::from(base),
            size,
            next: 0,
        }
    }

    pub(crate) fn next(&mut self) -> Ipv4Addr {
        let addr = self.base + (self.next % self.size);
        self.next = self.next.wrapping_add(1);
        Ipv4Addr::from(addr)
    }
}

/// Spawns the receive loop for one UDP socket.
///
/// Datagrams from an unexpected peer are ignored; datagrams larger than
/// `max_packet_size` are dropped and logged. The loop ends when the socket
/// errors or the consumer goes away.
pub(crate) fn spawn_recv_loop(
    socket: Arc<UdpSocket>,
    expected_peer: Option<SocketAddr>,
    max_packet_size: usize,
    tx: mpsc::Sender<Bytes>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65_536];
        loop {
            let (n, peer) = match socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    log::debug!("UDP receive loop ending: {}", e);
                    return;
                }
            };
            if let Some(expected) = expected_peer {
                if !peer_matches(expected, peer) {
                    continue;
                }
            }
            if n > max_packet_size {
                log::debug!("dropping {}-byte datagram over the size limit", n);
                continue;
            }
            if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                return;
            }
        }
    })
}

fn peer_matches(expected: SocketAddr, actual: SocketAddr) -> bool {
    if expected.port() != actual.port() {
        return false;
    }
    match (expected.ip(), actual.ip()) {
        (IpAddr::V4(e), IpAddr::V4(a)) => e == a,
        (IpAddr::V4(e), IpAddr::V6(a)) => a.to_ipv4().map_or(false, |a| a == e),
        (IpAddr::V6(e), IpAddr::V6(a)) => e == a,
        (IpAddr::V6(e), IpAddr::V4(a)) => e.to_ipv4().map_or(false, |e| e == a),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_even_odd_pair() {
        let pair = UdpPair::bind(None).await.unwrap();
        assert_eq!(pair.rtp_port % 2, 0);
        assert_eq!(pair.rtcp_port, pair.rtp_port + 1);
    }

    #[tokio::test]
    async fn binds_within_range() {
        let pair = UdpPair::bind(Some((40_000, 40_100))).await.unwrap();
        assert!((40_000..40_100).contains(&pair.rtp_port));
        assert_eq!(pair.rtp_port % 2, 0);
    }

    #[tokio::test]
    async fn recv_loop_filters_and_limits() {
        let pair = UdpPair::bind(None).await.unwrap();
        let dest: SocketAddr = format!("127.0.0.1:{}", pair.rtp_port).parse().unwrap();

        let good = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let bad = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let good_addr = good.local_addr().unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        spawn_recv_loop(pair.rtp.clone(), Some(good_addr), 16, tx);

        bad.send_to(b"ignored", dest).await.unwrap();
        good.send_to(&[0u8; 32], dest).await.unwrap(); // over the limit
        good.send_to(b"ok", dest).await.unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got[..], b"ok");
    }

    #[test]
    fn multicast_allocator_wraps() {
        let mut a = MulticastAllocator::new(Ipv4Addr::new(239, 255, 0, 0), 30);
        let first = a.next();
        a.next();
        a.next();
        a.next();
        assert_eq!(a.next(), first);
    }
}
