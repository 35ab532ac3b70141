// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! One server-side RTSP session: the six-state machine, the transport
//! choice locked at first SETUP, the keepalive deadline, and the media
//! plumbing for both directions. The session owns all of its mutable state
//! inside one task; connections talk to it through its message channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::conn::{Item, WriteQueue};
use crate::headers::{Delivery, Protocol, Transport, TransportMode};
use crate::media::Media;
use crate::reorder::Reorderer;
use crate::rtcp::{self, RtcpReceiver};
use crate::rtp;
use crate::server::conn::{handler_error_response, request_info};
use crate::server::stream::{ReaderMedia, StreamReader};
use crate::server::{
    base_response, ConnId, SessionHandle, SessionInfo, SessionMsg, SessionReply, SessionRequest,
    Shared,
};
use crate::transport::{spawn_recv_loop, UdpPair};
use crate::Error;

const MULTICAST_TTL: u8 = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SessState {
    Initial,
    PrePlay,
    Play,
    PreRecord,
    Record,
}

impl SessState {
    fn name(self) -> &'static str {
        match self {
            SessState::Initial => "Initial",
            SessState::PrePlay => "PrePlay",
            SessState::Play => "Play",
            SessState::PreRecord => "PreRecord",
            SessState::Record => "Record",
        }
    }

    fn allows(self, method: &rtsp_types::Method) -> bool {
        use rtsp_types::Method::*;
        let common = matches!(method, Options | GetParameter | SetParameter | Teardown);
        common
            || match self {
                SessState::Initial => matches!(method, Announce | Setup),
                SessState::PrePlay => matches!(method, Setup | Play),
                SessState::Play => matches!(method, Pause),
                SessState::PreRecord => matches!(method, Setup | Record),
                SessState::Record => matches!(method, Pause),
            }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum TransportKind {
    Udp,
    Multicast,
    Tcp,
}

enum SetupKind {
    Udp {
        pair: UdpPair,
        rtp_peer: SocketAddr,
        rtcp_peer: SocketAddr,
    },
    Multicast,
    Tcp {
        channels: (u8, u8),
    },
}

struct Setup {
    media_idx: usize,
    kind: SetupKind,
}

struct Session {
    shared: Arc<Shared>,
    handle: SessionHandle,
    state: SessState,
    path: String,
    announced: Option<Vec<Media>>,
    stream: Option<Arc<crate::server::ServerStream>>,
    setups: Vec<Setup>,
    kind: Option<TransportKind>,
    owner: Option<(ConnId, WriteQueue)>,
    deadline: tokio::time::Instant,
    media_tx: mpsc::Sender<(usize, bool, Bytes)>,
    media_tasks: Vec<tokio::task::JoinHandle<()>>,
    reorderers: HashMap<(usize, u8), Reorderer<rtp::Packet>>,
    receivers: HashMap<(usize, u8), RtcpReceiver>,
    reader_registered: bool,
    opened_reported: bool,
}

pub(crate) async fn run_session(
    handle: SessionHandle,
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<SessionMsg>,
    closed_tx: mpsc::UnboundedSender<String>,
) {
    let (media_tx, mut media_rx) = mpsc::channel(
        (shared.config.udp_read_buffer_size / shared.config.max_packet_size).max(8),
    );
    let timeout = shared.config.session_timeout;
    let mut ss = Session {
        shared,
        handle: handle.clone(),
        state: SessState::Initial,
        path: String::new(),
        announced: None,
        stream: None,
        setups: Vec::new(),
        kind: None,
        owner: None,
        deadline: tokio::time::Instant::now() + timeout,
        media_tx,
        media_tasks: Vec::new(),
        reorderers: HashMap::new(),
        receivers: HashMap::new(),
        reader_registered: false,
        opened_reported: false,
    };

    let reason = loop {
        // TCP delivery implies liveness through the owning connection;
        // everything else runs against the keepalive deadline.
        let deadline = if ss.kind == Some(TransportKind::Tcp) && ss.owner.is_some() {
            tokio::time::Instant::now() + std::time::Duration::from_secs(86_400)
        } else {
            ss.deadline
        };
        tokio::select! {
            msg = rx.recv() => match msg {
                None => break Error::Terminated,
                Some(SessionMsg::Request(sreq)) => {
                    if ss.handle_request(sreq).await {
                        break Error::Terminated;
                    }
                }
                Some(SessionMsg::Frame(channel, payload)) => ss.on_frame(channel, payload),
                Some(SessionMsg::ConnGone(id)) => {
                    if ss.on_conn_gone(id) {
                        break Error::ConnectionClosed;
                    }
                }
                Some(SessionMsg::Kick) => break Error::Terminated,
            },
            item = media_rx.recv() => {
                // Never `None`: the session keeps a sender for its lifetime.
                if let Some((media_idx, is_rtcp, data)) = item {
                    ss.on_udp_media(media_idx, is_rtcp, data);
                }
            }
            _ = tokio::time::sleep_until(deadline) => break Error::SessionTimedOut,
        }
    };

    log::debug!("session {} closing: {}", handle.public_id, reason);
    ss.cleanup();
    let _ = closed_tx.send(handle.secret_id.clone());
    if ss.opened_reported {
        if let Some(cb) = &ss.shared.handlers.on_session_close {
            cb(&ss.info());
        }
    }
}

impl Session {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            public_id: self.handle.public_id.clone(),
            path: self.path.clone(),
        }
    }

    fn touch(&mut self) {
        self.deadline = tokio::time::Instant::now() + self.shared.config.session_timeout;
    }

    fn session_header(&self) -> String {
        format!(
            "{};timeout={}",
            self.handle.secret_id,
            self.shared.config.session_timeout.as_secs()
        )
    }

    /// Handles one routed request; returns whether the session is done.
    async fn handle_request(&mut self, sreq: SessionRequest) -> bool {
        self.touch();
        let cseq = sreq.cseq;

        // Owner isolation: once playing or recording, only the owning
        // connection may speak for this session.
        if matches!(self.state, SessState::Play | SessState::Record) {
            if let Some((owner_id, _)) = &self.owner {
                if *owner_id != sreq.conn_id {
                    log::debug!(
                        "session {}: request from non-owner connection",
                        self.handle.public_id
                    );
                    let _ = sreq.reply.send(SessionReply {
                        response: base_response(rtsp_types::StatusCode::BadRequest, Some(cseq))
                            .build(Vec::new()),
                        session: None,
                        destroyed: false,
                    });
                    return false;
                }
            }
        }

        let method = sreq.req.method().clone();
        if !self.state.allows(&method) {
            let _ = sreq.reply.send(SessionReply {
                response: base_response(
                    rtsp_types::StatusCode::MethodNotValidInThisState,
                    Some(cseq),
                )
                .header(rtsp_types::headers::SESSION, self.session_header())
                .build(Vec::new()),
                session: None,
                destroyed: false,
            });
            return false;
        }

        use rtsp_types::Method;
        let (response, destroyed) = match method {
            Method::Options => (
                base_response(rtsp_types::StatusCode::Ok, Some(cseq))
                    .header(
                        rtsp_types::headers::PUBLIC,
                        self.shared.handlers.public_methods(),
                    )
                    .header(rtsp_types::headers::SESSION, self.session_header())
                    .build(Vec::new()),
                false,
            ),
            Method::Announce => (self.handle_announce(&sreq, cseq), false),
            Method::Setup => (self.handle_setup(&sreq, cseq).await, false),
            Method::Play => (self.handle_play(&sreq, cseq), false),
            Method::Record => (self.handle_record(&sreq, cseq), false),
            Method::Pause => (self.handle_pause(&sreq, cseq), false),
            Method::Teardown => (
                base_response(rtsp_types::StatusCode::Ok, Some(cseq)).build(Vec::new()),
                true,
            ),
            Method::GetParameter => (self.handle_parameter(&sreq, cseq, false), false),
            Method::SetParameter => (self.handle_parameter(&sreq, cseq, true), false),
            _ => (
                base_response(rtsp_types::StatusCode::NotImplemented, Some(cseq))
                    .build(Vec::new()),
                false,
            ),
        };

        let _ = sreq.reply.send(SessionReply {
            session: if destroyed {
                None
            } else {
                Some(self.handle.clone())
            },
            response,
            destroyed,
        });
        destroyed
    }

    fn handle_announce(
        &mut self,
        sreq: &SessionRequest,
        cseq: u32,
    ) -> rtsp_types::Response<Vec<u8>> {
        let handler = match &self.shared.handlers.on_announce {
            Some(h) => h,
            None => {
                return base_response(rtsp_types::StatusCode::NotImplemented, Some(cseq))
                    .build(Vec::new());
            }
        };
        let info = match request_info(&sreq.req, sreq.remote_addr) {
            Some(i) => i,
            None => {
                return base_response(rtsp_types::StatusCode::BadRequest, Some(cseq))
                    .build(Vec::new());
            }
        };
        let medias = match crate::media::unmarshal_sdp(sreq.req.body()) {
            Ok(m) => m,
            Err(e) => {
                log::debug!("bad ANNOUNCE body: {}", e);
                return base_response(rtsp_types::StatusCode::BadRequest, Some(cseq))
                    .build(Vec::new());
            }
        };
        if let Err(e) = handler(&info, &medias) {
            return handler_error_response(e, cseq);
        }
        self.path = info.path;
        self.announced = Some(medias);
        self.state = SessState::PreRecord;
        self.report_opened();
        base_response(rtsp_types::StatusCode::Ok, Some(cseq))
            .header(rtsp_types::headers::SESSION, self.session_header())
            .build(Vec::new())
    }

    async fn handle_setup(
        &mut self,
        sreq: &SessionRequest,
        cseq: u32,
    ) -> rtsp_types::Response<Vec<u8>> {
        let requested = match sreq
            .req
            .header(&rtsp_types::headers::TRANSPORT)
            .map(|v| Transport::parse(v.as_str()))
        {
            Some(Ok(t)) => t,
            Some(Err(e)) => {
                log::debug!("bad Transport header: {}", e);
                return base_response(rtsp_types::StatusCode::BadRequest, Some(cseq))
                    .build(Vec::new());
            }
            None => {
                return base_response(rtsp_types::StatusCode::BadRequest, Some(cseq))
                    .build(Vec::new());
            }
        };

        let record = requested.mode == Some(TransportMode::Record);
        if record != self.announced.is_some() {
            return base_response(
                rtsp_types::StatusCode::MethodNotValidInThisState,
                Some(cseq),
            )
            .build(Vec::new());
        }

        let kind = match (requested.protocol, requested.delivery) {
            (Some(Protocol::Tcp), _) => TransportKind::Tcp,
            (_, Some(Delivery::Multicast)) => TransportKind::Multicast,
            _ => TransportKind::Udp,
        };
        // The first SETUP locks the transport for the whole session.
        if let Some(existing) = self.kind {
            if existing != kind {
                return base_response(rtsp_types::StatusCode::UnsupportedTransport, Some(cseq))
                    .build(Vec::new());
            }
        }
        if kind == TransportKind::Multicast
            && (record || self.shared.multicast.is_none())
        {
            return base_response(rtsp_types::StatusCode::UnsupportedTransport, Some(cseq))
                .build(Vec::new());
        }

        let info = match request_info(&sreq.req, sreq.remote_addr) {
            Some(i) => i,
            None => {
                return base_response(rtsp_types::StatusCode::BadRequest, Some(cseq))
                    .build(Vec::new());
            }
        };

        // Resolve the target media.
        let media_count;
        if record {
            media_count = self.announced.as_ref().map(Vec::len).unwrap_or(0);
        } else {
            let handler = match &self.shared.handlers.on_setup {
                Some(h) => h,
                None => {
                    return base_response(rtsp_types::StatusCode::NotImplemented, Some(cseq))
                        .build(Vec::new());
                }
            };
            match handler(&info) {
                Ok(Some(stream)) => {
                    media_count = stream.medias().len();
                    if self.stream.is_none() {
                        self.stream = Some(stream);
                    }
                }
                Ok(None) => {
                    return base_response(rtsp_types::StatusCode::NotFound, Some(cseq))
                        .build(Vec::new());
                }
                Err(e) => return handler_error_response(e, cseq),
            }
        }
        let media_idx = media_index(&info.path, &info.query, self.setups.len());
        if media_idx >= media_count {
            return base_response(rtsp_types::StatusCode::NotFound, Some(cseq)).build(Vec::new());
        }
        if self.setups.iter().any(|s| s.media_idx == media_idx) {
            return base_response(rtsp_types::StatusCode::BadRequest, Some(cseq))
                .build(Vec::new());
        }

        let mut answer = Transport {
            protocol: requested.protocol.or(Some(Protocol::Udp)),
            ..Transport::default()
        };
        let setup_kind = match kind {
            TransportKind::Udp => {
                let (client_rtp, client_rtcp) = match requested.client_port {
                    Some(p) => p,
                    None => {
                        return base_response(rtsp_types::StatusCode::BadRequest, Some(cseq))
                            .build(Vec::new());
                    }
                };
                let pair = match UdpPair::bind(self.shared.config.udp_rtp_port_range).await {
                    Ok(p) => p,
                    Err(e) => {
                        log::warn!("UDP port allocation failed: {}", e);
                        return base_response(
                            rtsp_types::StatusCode::InternalServerError,
                            Some(cseq),
                        )
                        .build(Vec::new());
                    }
                };
                answer.delivery = Some(Delivery::Unicast);
                answer.client_port = Some((client_rtp, client_rtcp));
                answer.server_port = Some((pair.rtp_port, pair.rtcp_port));
                SetupKind::Udp {
                    pair,
                    rtp_peer: SocketAddr::new(sreq.remote_addr.ip(), client_rtp),
                    rtcp_peer: SocketAddr::new(sreq.remote_addr.ip(), client_rtcp),
                }
            }
            TransportKind::Tcp => {
                let channels = requested
                    .interleaved
                    .unwrap_or(((self.setups.len() * 2) as u8, (self.setups.len() * 2 + 1) as u8));
                answer.delivery = Some(Delivery::Unicast);
                answer.interleaved = Some(channels);
                SetupKind::Tcp { channels }
            }
            TransportKind::Multicast => {
                let stream = match &self.stream {
                    Some(s) => s.clone(),
                    None => {
                        return base_response(
                            rtsp_types::StatusCode::InternalServerError,
                            Some(cseq),
                        )
                        .build(Vec::new());
                    }
                };
                let group = match self.shared.allocate_multicast_group() {
                    Some(g) => g,
                    None => {
                        return base_response(
                            rtsp_types::StatusCode::UnsupportedTransport,
                            Some(cseq),
                        )
                        .build(Vec::new());
                    }
                };
                let (group, ports) = match stream
                    .ensure_multicast(media_idx, group, u32::from(MULTICAST_TTL))
                    .await
                {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!("multicast allocation failed: {}", e);
                        return base_response(
                            rtsp_types::StatusCode::InternalServerError,
                            Some(cseq),
                        )
                        .build(Vec::new());
                    }
                };
                answer.delivery = Some(Delivery::Multicast);
                answer.destination = Some(group.into());
                answer.port = Some(ports);
                answer.ttl = Some(MULTICAST_TTL);
                SetupKind::Multicast
            }
        };

        self.kind = Some(kind);
        self.setups.push(Setup {
            media_idx,
            kind: setup_kind,
        });
        if !record {
            self.state = SessState::PrePlay;
        }
        if self.path.is_empty() {
            self.path = strip_control(&info.path);
        }
        self.report_opened();

        base_response(rtsp_types::StatusCode::Ok, Some(cseq))
            .header(rtsp_types::headers::TRANSPORT, answer.marshal())
            .header(rtsp_types::headers::SESSION, self.session_header())
            .build(Vec::new())
    }

    fn handle_play(&mut self, sreq: &SessionRequest, cseq: u32) -> rtsp_types::Response<Vec<u8>> {
        if let Some(hook) = &self.shared.handlers.on_play {
            if let Err(e) = hook(&self.info()) {
                return handler_error_response(e, cseq);
            }
        }
        let stream = match &self.stream {
            Some(s) => s.clone(),
            None => {
                return base_response(rtsp_types::StatusCode::InternalServerError, Some(cseq))
                    .build(Vec::new());
            }
        };

        let mut medias = HashMap::new();
        for setup in &self.setups {
            match &setup.kind {
                SetupKind::Udp {
                    pair,
                    rtp_peer,
                    rtcp_peer,
                } => {
                    medias.insert(
                        setup.media_idx,
                        ReaderMedia::Udp {
                            rtp: pair.rtp.clone(),
                            rtcp: pair.rtcp.clone(),
                            rtp_peer: *rtp_peer,
                            rtcp_peer: *rtcp_peer,
                        },
                    );
                    // Client receiver reports prove liveness in UDP mode.
                    self.media_tasks.push(spawn_recv_loop(
                        pair.rtcp.clone(),
                        Some(*rtcp_peer),
                        self.shared.config.max_packet_size,
                        sender_for(self.media_tx.clone(), setup.media_idx, true),
                    ));
                }
                SetupKind::Tcp { channels } => {
                    medias.insert(
                        setup.media_idx,
                        ReaderMedia::Tcp {
                            queue: sreq.conn_queue.clone(),
                            channels: *channels,
                        },
                    );
                }
                SetupKind::Multicast => {}
            }
        }
        if !medias.is_empty() {
            stream.add_reader(
                self.handle.public_id.clone(),
                StreamReader::new(self.handle.clone(), medias, self.shared.config.write_queue_size),
            );
            self.reader_registered = true;
        }
        self.owner = Some((sreq.conn_id, sreq.conn_queue.clone()));
        self.state = SessState::Play;
        base_response(rtsp_types::StatusCode::Ok, Some(cseq))
            .header(rtsp_types::headers::SESSION, self.session_header())
            .build(Vec::new())
    }

    fn handle_record(&mut self, sreq: &SessionRequest, cseq: u32) -> rtsp_types::Response<Vec<u8>> {
        if let Some(hook) = &self.shared.handlers.on_record {
            if let Err(e) = hook(&self.info()) {
                return handler_error_response(e, cseq);
            }
        }
        let medias = match &self.announced {
            Some(m) => m.clone(),
            None => {
                return base_response(rtsp_types::StatusCode::InternalServerError, Some(cseq))
                    .build(Vec::new());
            }
        };

        // Receiver-report routing for TCP setups needs the owner's queue.
        self.owner = Some((sreq.conn_id, sreq.conn_queue.clone()));

        for setup in &self.setups {
            let media = match medias.get(setup.media_idx) {
                Some(m) => m,
                None => continue,
            };
            for format in &media.formats {
                let pt = format.payload_type();
                if let Some(clock_rate) = NonZeroU32::new(format.clock_rate()) {
                    let out = self.record_rtcp_out(setup);
                    self.receivers.insert(
                        (setup.media_idx, pt),
                        RtcpReceiver::new(
                            clock_rate,
                            rand::random::<u32>(),
                            self.shared.config.udp_receiver_report_period,
                            out,
                        ),
                    );
                }
                if matches!(setup.kind, SetupKind::Udp { .. }) {
                    self.reorderers
                        .insert((setup.media_idx, pt), Reorderer::new());
                }
            }
            if let SetupKind::Udp {
                pair,
                rtp_peer,
                rtcp_peer,
            } = &setup.kind
            {
                self.media_tasks.push(spawn_recv_loop(
                    pair.rtp.clone(),
                    Some(*rtp_peer),
                    self.shared.config.max_packet_size,
                    sender_for(self.media_tx.clone(), setup.media_idx, false),
                ));
                self.media_tasks.push(spawn_recv_loop(
                    pair.rtcp.clone(),
                    Some(*rtcp_peer),
                    self.shared.config.max_packet_size,
                    sender_for(self.media_tx.clone(), setup.media_idx, true),
                ));
            }
        }
        self.state = SessState::Record;
        base_response(rtsp_types::StatusCode::Ok, Some(cseq))
            .header(rtsp_types::headers::SESSION, self.session_header())
            .build(Vec::new())
    }

    /// Where this setup's outbound receiver reports go.
    fn record_rtcp_out(&self, setup: &Setup) -> Box<dyn Fn(Bytes) + Send + Sync> {
        match &setup.kind {
            SetupKind::Udp { pair, rtcp_peer, .. } => {
                let socket = pair.rtcp.clone();
                let peer = *rtcp_peer;
                Box::new(move |data| {
                    let socket = socket.clone();
                    tokio::spawn(async move {
                        let _ = socket.send_to(&data, peer).await;
                    });
                })
            }
            SetupKind::Tcp { channels } => {
                let queue = self.owner.as_ref().map(|(_, q)| q.clone());
                let channel = channels.1;
                Box::new(move |data| {
                    if let Some(queue) = &queue {
                        queue.try_send_data(Item::Frame {
                            channel,
                            payload: data,
                        });
                    }
                })
            }
            SetupKind::Multicast => Box::new(|_| {}),
        }
    }

    fn handle_pause(&mut self, _sreq: &SessionRequest, cseq: u32) -> rtsp_types::Response<Vec<u8>> {
        if let Some(hook) = &self.shared.handlers.on_pause {
            if let Err(e) = hook(&self.info()) {
                return handler_error_response(e, cseq);
            }
        }
        match self.state {
            SessState::Play => {
                self.unregister_reader();
                self.state = SessState::PrePlay;
            }
            SessState::Record => {
                self.stop_media_tasks();
                self.state = SessState::PreRecord;
            }
            _ => {}
        }
        self.owner = None;
        base_response(rtsp_types::StatusCode::Ok, Some(cseq))
            .header(rtsp_types::headers::SESSION, self.session_header())
            .build(Vec::new())
    }

    fn handle_parameter(
        &mut self,
        sreq: &SessionRequest,
        cseq: u32,
        set: bool,
    ) -> rtsp_types::Response<Vec<u8>> {
        let handler = if set {
            &self.shared.handlers.on_set_parameter
        } else {
            &self.shared.handlers.on_get_parameter
        };
        match (handler, request_info(&sreq.req, sreq.remote_addr)) {
            (Some(h), Some(info)) => match h(&info, sreq.req.body()) {
                Ok(body) => base_response(rtsp_types::StatusCode::Ok, Some(cseq))
                    .header(rtsp_types::headers::SESSION, self.session_header())
                    .build(body),
                Err(e) => handler_error_response(e, cseq),
            },
            _ if !set => base_response(rtsp_types::StatusCode::Ok, Some(cseq))
                .header(rtsp_types::headers::SESSION, self.session_header())
                .build(Vec::new()),
            _ => base_response(rtsp_types::StatusCode::NotImplemented, Some(cseq))
                .build(Vec::new()),
        }
    }

    /// Inbound interleaved frame from the owning connection.
    fn on_frame(&mut self, channel: u8, payload: Bytes) {
        self.touch();
        let (media_idx, is_rtcp) = match self.setups.iter().find_map(|s| match &s.kind {
            SetupKind::Tcp { channels } if channels.0 == channel => Some((s.media_idx, false)),
            SetupKind::Tcp { channels } if channels.1 == channel => Some((s.media_idx, true)),
            _ => None,
        }) {
            Some(x) => x,
            None => return,
        };
        match self.state {
            // TCP preserves order, so the reorderer is bypassed.
            SessState::Record => self.process_inbound(media_idx, is_rtcp, payload, false),
            SessState::Play => {
                if is_rtcp {
                    if let Some(cb) = &self.shared.handlers.on_packet_rtcp {
                        cb(&self.info(), media_idx, &payload);
                    }
                }
            }
            _ => {}
        }
    }

    /// Inbound datagram from one of the session's UDP sockets.
    fn on_udp_media(&mut self, media_idx: usize, is_rtcp: bool, data: Bytes) {
        self.touch();
        match self.state {
            SessState::Record => self.process_inbound(media_idx, is_rtcp, data, true),
            SessState::Play => {
                if is_rtcp {
                    if let Some(cb) = &self.shared.handlers.on_packet_rtcp {
                        cb(&self.info(), media_idx, &data);
                    }
                }
            }
            _ => {}
        }
    }

    fn process_inbound(&mut self, media_idx: usize, is_rtcp: bool, data: Bytes, reorder: bool) {
        if is_rtcp {
            match rtcp::Packet::parse_compound(&data) {
                Ok(pkts) => {
                    for p in &pkts {
                        if let rtcp::Packet::SenderReport(sr) = p {
                            for ((idx, _), r) in &self.receivers {
                                if *idx == media_idx {
                                    r.process_sender_report(sr);
                                }
                            }
                        }
                    }
                    if let Some(cb) = &self.shared.handlers.on_packet_rtcp {
                        cb(&self.info(), media_idx, &data);
                    }
                }
                Err(e) => self
                    .shared
                    .handlers
                    .report_decode_error(&self.info(), &Error::MalformedMessage(e)),
            }
            return;
        }
        let pkt = match rtp::Packet::parse(data) {
            Ok(p) => p,
            Err(e) => {
                self.shared.handlers.report_decode_error(&self.info(), &e);
                return;
            }
        };
        let pt = pkt.payload_type;
        let known = self
            .announced
            .as_ref()
            .and_then(|m| m.get(media_idx))
            .map_or(false, |m| m.format_by_payload_type(pt).is_some());
        if !known {
            return;
        }
        let emitted: smallvec::SmallVec<[rtp::Packet; 2]> = if reorder {
            let seq = pkt.sequence_number;
            let (mut emitted, missing) = match self.reorderers.get_mut(&(media_idx, pt)) {
                Some(r) => r.process(seq, pkt),
                None => return,
            };
            if missing != 0 {
                log::warn!(
                    "session {}: {} RTP packet(s) lost",
                    self.handle.public_id,
                    missing
                );
                if let Some(first) = emitted.first_mut() {
                    first.loss = missing.min(usize::from(u16::MAX)) as u16;
                }
            }
            emitted
        } else {
            smallvec::smallvec![pkt]
        };
        for pkt in &emitted {
            if let Some(r) = self.receivers.get(&(media_idx, pt)) {
                r.process_packet(pkt);
            }
            if let Some(cb) = &self.shared.handlers.on_packet_rtp {
                cb(&self.info(), media_idx, pkt);
            }
        }
    }

    /// Returns whether the session should be destroyed.
    fn on_conn_gone(&mut self, conn_id: ConnId) -> bool {
        let was_owner = matches!(&self.owner, Some((id, _)) if *id == conn_id);
        if was_owner {
            self.owner = None;
        }
        // TCP transport can't outlive its connection. UDP sessions linger
        // until the keepalive deadline, surviving reconnects.
        self.kind == Some(TransportKind::Tcp)
    }

    fn report_opened(&mut self) {
        if !self.opened_reported {
            self.opened_reported = true;
            if let Some(cb) = &self.shared.handlers.on_session_open {
                cb(&self.info());
            }
        }
    }

    fn unregister_reader(&mut self) {
        if self.reader_registered {
            if let Some(stream) = &self.stream {
                stream.remove_reader(&self.handle.public_id);
            }
            self.reader_registered = false;
        }
    }

    fn stop_media_tasks(&mut self) {
        for t in self.media_tasks.drain(..) {
            t.abort();
        }
        self.reorderers.clear();
        self.receivers.clear();
    }

    fn cleanup(&mut self) {
        self.unregister_reader();
        self.stop_media_tasks();
    }
}

fn sender_for(
    tx: mpsc::Sender<(usize, bool, Bytes)>,
    media_idx: usize,
    is_rtcp: bool,
) -> mpsc::Sender<Bytes> {
    // Adapts the shared media channel to the transport receive loop.
    let (adapter_tx, mut adapter_rx) = mpsc::channel::<Bytes>(8);
    tokio::spawn(async move {
        while let Some(data) = adapter_rx.recv().await {
            if tx.send((media_idx, is_rtcp, data)).await.is_err() {
                return;
            }
        }
    });
    adapter_tx
}

/// Maps a SETUP URL to a media index: the `trackID=n` suffix our DESCRIBE
/// emits, else the next free slot.
fn media_index(path: &str, query: &str, fallback: usize) -> usize {
    for hay in &[query, path] {
        if let Some(i) = hay.rfind("trackID=") {
            let digits: String = hay[i + "trackID=".len()..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let Ok(n) = digits.parse() {
                return n;
            }
        }
    }
    fallback
}

/// Removes a `trackID=n` suffix from a path.
fn strip_control(path: &str) -> String {
    match path.rfind("/trackID=") {
        Some(i) => path[..i].to_owned(),
        None => path.trim_end_matches('/').to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_allows() {
        use rtsp_types::Method::*;
        assert!(SessState::Initial.allows(&Setup));
        assert!(SessState::Initial.allows(&Announce));
        assert!(!SessState::Initial.allows(&Play));
        assert!(SessState::PrePlay.allows(&Play));
        assert!(!SessState::PrePlay.allows(&Record));
        assert!(SessState::Play.allows(&Pause));
        assert!(!SessState::Play.allows(&Setup));
        assert!(SessState::PreRecord.allows(&Record));
        assert!(!SessState::PreRecord.allows(&Play));
        assert!(SessState::Record.allows(&Pause));
        for s in &[
            SessState::Initial,
            SessState::PrePlay,
            SessState::Play,
            SessState::PreRecord,
            SessState::Record,
        ] {
            assert!(s.allows(&Teardown));
            assert!(s.allows(&Options));
            assert!(s.allows(&GetParameter));
        }
    }

    #[test]
    fn media_index_resolution() {
        assert_eq!(media_index("/cam/trackID=2", "", 0), 2);
        assert_eq!(media_index("/cam", "trackID=1", 5), 1);
        assert_eq!(media_index("/cam", "", 3), 3);
    }

    #[test]
    fn strip_control_suffix() {
        assert_eq!(strip_control("/cam/trackID=0"), "/cam");
        assert_eq!(strip_control("/cam/"), "/cam");
    }
}
