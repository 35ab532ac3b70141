// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A published stream: the fan-out point from one `write_packet_rtp` call
//! to every unicast reader and the optional multicast group, with RTCP
//! sender-report bookkeeping per format.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;

use crate::conn::{Item, WriteQueue};
use crate::media::Media;
use crate::rtcp::RtcpSender;
use crate::rtp;
use crate::server::{SessionHandle, SessionMsg};
use crate::transport::MulticastWriter;
use crate::{Error, NtpTimestamp, Result};

/// One reader's delivery endpoint for one media.
pub(crate) enum ReaderMedia {
    Udp {
        rtp: Arc<UdpSocket>,
        rtcp: Arc<UdpSocket>,
        rtp_peer: SocketAddr,
        rtcp_peer: SocketAddr,
    },
    Tcp {
        queue: WriteQueue,
        channels: (u8, u8),
    },
}

/// A subscribed reader session.
pub(crate) struct StreamReader {
    session: SessionHandle,
    medias: HashMap<usize, ReaderMedia>,
    max_drops: usize,
    consecutive_drops: usize,
}

impl StreamReader {
    pub(crate) fn new(
        session: SessionHandle,
        medias: HashMap<usize, ReaderMedia>,
        max_drops: usize,
    ) -> StreamReader {
        StreamReader {
            session,
            medias,
            max_drops,
            consecutive_drops: 0,
        }
    }
}

struct MediaState {
    senders: HashMap<u8, Arc<RtcpSender>>,
    multicast: Option<Arc<MulticastWriter>>,
}

struct Inner {
    readers: HashMap<String, StreamReader>,
    media_state: Vec<MediaState>,
    closed: bool,
}

/// A server-side source of RTP/RTCP packets, created by the application
/// and handed out from `on_describe`/`on_setup` handlers.
pub struct ServerStream {
    medias: Vec<Media>,
    sender_report_period: Duration,
    disable_sender_reports: bool,
    inner: Mutex<Inner>,
    weak_self: Mutex<Weak<ServerStream>>,
}

impl ServerStream {
    pub fn new(medias: Vec<Media>) -> Arc<ServerStream> {
        Self::with_options(medias, Duration::from_secs(10), false)
    }

    pub fn with_options(
        medias: Vec<Media>,
        sender_report_period: Duration,
        disable_sender_reports: bool,
    ) -> Arc<ServerStream> {
        let media_state = medias
            .iter()
            .map(|_| MediaState {
                senders: HashMap::new(),
                multicast: None,
            })
            .collect();
        let stream = Arc::new(ServerStream {
            medias,
            sender_report_period,
            disable_sender_reports,
            inner: Mutex::new(Inner {
                readers: HashMap::new(),
                media_state,
                closed: false,
            }),
            weak_self: Mutex::new(Weak::new()),
        });
        *stream.weak_self.lock().expect("stream poisoned") = Arc::downgrade(&stream);
        stream
    }

    pub fn medias(&self) -> &[Media] {
        &self.medias
    }

    /// Writes one RTP packet to every reader of `media_idx`.
    ///
    /// The wire form is marshaled once; slow TCP readers shed packets and,
    /// past `write_queue_size` consecutive drops, are kicked entirely so
    /// they can't hold up anyone else.
    pub async fn write_packet_rtp(&self, media_idx: usize, pkt: &rtp::Packet) -> Result<()> {
        let media = self
            .medias
            .get(media_idx)
            .ok_or_else(|| Error::MalformedMessage(format!("no media {}", media_idx)))?;
        let data = pkt.raw().clone();

        // RTCP sender bookkeeping, creating the per-format sender lazily.
        if !self.disable_sender_reports {
            if let Some(format) = media.format_by_payload_type(pkt.payload_type) {
                let pts_equals_dts = format.pts_equals_dts(&pkt.payload);
                if let Some(sender) = self.sender_for(media_idx, pkt.payload_type) {
                    sender.process_packet(pkt, NtpTimestamp::now(), pts_equals_dts);
                }
            }
        }

        let (udp_targets, multicast) = self.fan_out_tcp(media_idx, &data, false);
        for (socket, peer) in udp_targets {
            if let Err(e) = socket.send_to(&data, peer).await {
                log::debug!("RTP fan-out to {} failed: {}", peer, e);
            }
        }
        if let Some(m) = multicast {
            let _ = m.send_rtp(&data).await;
        }
        Ok(())
    }

    /// Writes one RTCP packet to every reader of `media_idx`.
    pub async fn write_packet_rtcp(&self, media_idx: usize, data: &[u8]) -> Result<()> {
        if media_idx >= self.medias.len() {
            return Err(Error::MalformedMessage(format!("no media {}", media_idx)));
        }
        let data = Bytes::copy_from_slice(data);
        let (udp_targets, multicast) = self.fan_out_tcp(media_idx, &data, true);
        for (socket, peer) in udp_targets {
            if let Err(e) = socket.send_to(&data, peer).await {
                log::debug!("RTCP fan-out to {} failed: {}", peer, e);
            }
        }
        if let Some(m) = multicast {
            let _ = m.send_rtcp(&data).await;
        }
        Ok(())
    }

    /// TCP enqueues happen under the lock (they never block); UDP and
    /// multicast targets are snapshotted for sending outside it.
    #[allow(clippy::type_complexity)]
    fn fan_out_tcp(
        &self,
        media_idx: usize,
        data: &Bytes,
        is_rtcp: bool,
    ) -> (
        Vec<(Arc<UdpSocket>, SocketAddr)>,
        Option<Arc<MulticastWriter>>,
    ) {
        let mut inner = self.inner.lock().expect("stream poisoned");
        let mut udp = Vec::new();
        let mut kicked = Vec::new();
        for (id, reader) in inner.readers.iter_mut() {
            let endpoint = match reader.medias.get(&media_idx) {
                Some(e) => e,
                None => continue,
            };
            match endpoint {
                ReaderMedia::Udp {
                    rtp,
                    rtcp,
                    rtp_peer,
                    rtcp_peer,
                } => {
                    if is_rtcp {
                        udp.push((rtcp.clone(), *rtcp_peer));
                    } else {
                        udp.push((rtp.clone(), *rtp_peer));
                    }
                }
                ReaderMedia::Tcp { queue, channels } => {
                    let channel = if is_rtcp { channels.1 } else { channels.0 };
                    if queue.try_send_data(Item::Frame {
                        channel,
                        payload: data.clone(),
                    }) {
                        reader.consecutive_drops = 0;
                    } else {
                        reader.consecutive_drops += 1;
                        if reader.consecutive_drops > reader.max_drops {
                            kicked.push(id.clone());
                        }
                    }
                }
            }
        }
        for id in kicked {
            if let Some(reader) = inner.readers.remove(&id) {
                log::warn!("dropping slow reader session {}", id);
                let _ = reader.session.tx.try_send(SessionMsg::Kick);
            }
        }
        let multicast = inner
            .media_state
            .get(media_idx)
            .and_then(|m| m.multicast.clone());
        (udp, multicast)
    }

    fn sender_for(&self, media_idx: usize, payload_type: u8) -> Option<Arc<RtcpSender>> {
        let mut inner = self.inner.lock().expect("stream poisoned");
        if inner.closed {
            return None;
        }
        let state = inner.media_state.get_mut(media_idx)?;
        if let Some(s) = state.senders.get(&payload_type) {
            return Some(s.clone());
        }
        let clock_rate = NonZeroU32::new(
            self.medias[media_idx]
                .format_by_payload_type(payload_type)?
                .clock_rate(),
        )?;
        let weak = self.weak_self.lock().expect("stream poisoned").clone();
        let sender = Arc::new(RtcpSender::new(
            clock_rate,
            self.sender_report_period,
            Box::new(move |report| {
                if let Some(stream) = weak.upgrade() {
                    tokio::spawn(async move {
                        let _ = stream.write_packet_rtcp(media_idx, &report).await;
                    });
                }
            }),
        ));
        state.senders.insert(payload_type, sender.clone());
        Some(sender)
    }

    /// Lazily allocates the media's multicast writer; returns the group
    /// and the `(rtp, rtcp)` ports readers should listen on.
    pub(crate) async fn ensure_multicast(
        &self,
        media_idx: usize,
        group: Ipv4Addr,
        ttl: u32,
    ) -> Result<(Ipv4Addr, (u16, u16))> {
        if let Some(existing) = self
            .inner
            .lock()
            .expect("stream poisoned")
            .media_state
            .get(media_idx)
            .and_then(|m| m.multicast.clone())
        {
            return Ok((
                existing.group,
                (existing.pair.rtp_port, existing.pair.rtcp_port),
            ));
        }
        let writer = Arc::new(MulticastWriter::bind(group, ttl).await?);
        let mut inner = self.inner.lock().expect("stream poisoned");
        let state = inner
            .media_state
            .get_mut(media_idx)
            .ok_or_else(|| Error::MalformedMessage(format!("no media {}", media_idx)))?;
        let writer = state.multicast.get_or_insert(writer).clone();
        Ok((
            writer.group,
            (writer.pair.rtp_port, writer.pair.rtcp_port),
        ))
    }

    pub(crate) fn add_reader(&self, public_id: String, reader: StreamReader) {
        let mut inner = self.inner.lock().expect("stream poisoned");
        if inner.closed {
            let _ = reader.session.tx.try_send(SessionMsg::Kick);
            return;
        }
        inner.readers.insert(public_id, reader);
    }

    pub(crate) fn remove_reader(&self, public_id: &str) {
        self.inner
            .lock()
            .expect("stream poisoned")
            .readers
            .remove(public_id);
    }

    /// The number of subscribed unicast readers.
    pub fn reader_count(&self) -> usize {
        self.inner.lock().expect("stream poisoned").readers.len()
    }

    /// Unsubscribes every reader (kicking their sessions) and stops the
    /// report loops. Further writes are no-ops.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("stream poisoned");
        inner.closed = true;
        for (_, reader) in inner.readers.drain() {
            let _ = reader.session.tx.try_send(SessionMsg::Kick);
        }
        for state in &mut inner.media_state {
            state.senders.clear();
            state.multicast = None;
        }
    }
}
