// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP server: accepts control connections, dispatches requests to
//! per-session tasks, and serves published streams to readers.
//!
//! Concurrency layout: one accept task, one dispatcher task owning the
//! session registry, one read task plus one write-drain task per
//! connection, one task per session. Everything talks through bounded
//! channels; no task reaches into another's state.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use rand::RngCore;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

use crate::media::Media;
use crate::rtp;
use crate::transport::MulticastAllocator;
use crate::{Error, Result};

pub(crate) mod conn;
pub(crate) mod session;
pub(crate) mod stream;

pub use stream::ServerStream;

/// Server configuration. The `Default` instance matches the documented
/// defaults.
pub struct ServerConfig {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Advertised in `Session` headers and enforced as the keepalive
    /// deadline.
    pub session_timeout: Duration,
    pub check_stream_period: Duration,
    pub udp_receiver_report_period: Duration,
    pub sender_report_period: Duration,
    /// Bounds the bytes parked between a UDP socket and its processing
    /// task; the OS-level socket buffer is left at the platform default.
    pub udp_read_buffer_size: usize,
    pub max_packet_size: usize,
    pub write_queue_size: usize,
    pub udp_rtp_port_range: Option<(u16, u16)>,
    /// Multicast groups are carved out of this base/prefix; `None`
    /// disables multicast SETUP.
    pub multicast_range: Option<(Ipv4Addr, u8)>,
    pub disable_rtcp_sender_reports: bool,
    pub tls: Option<tokio_rustls::TlsAcceptor>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            session_timeout: Duration::from_secs(60),
            check_stream_period: Duration::from_secs(1),
            udp_receiver_report_period: Duration::from_secs(10),
            sender_report_period: Duration::from_secs(10),
            udp_read_buffer_size: 2 * 1024 * 1024,
            max_packet_size: crate::transport::DEFAULT_MAX_PACKET_SIZE,
            write_queue_size: 256,
            udp_rtp_port_range: None,
            multicast_range: None,
            disable_rtcp_sender_reports: false,
            tls: None,
        }
    }
}

/// Why a handler refused a request.
#[derive(Debug)]
pub enum HandlerError {
    /// 401 carrying these `WWW-Authenticate` challenges.
    Unauthorized(Vec<String>),
    /// 404.
    NotFound,
    /// 400 with a reason for the log.
    BadRequest(String),
}

/// Request facts handed to handlers.
#[derive(Debug)]
pub struct RequestInfo {
    pub path: String,
    pub query: String,
    pub authorization: Option<String>,
    pub remote_addr: SocketAddr,
}

/// Session facts handed to handlers.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub public_id: String,
    pub path: String,
}

pub type DescribeHandler =
    Box<dyn Fn(&RequestInfo) -> Result<Arc<ServerStream>, HandlerError> + Send + Sync>;
pub type AnnounceHandler =
    Box<dyn Fn(&RequestInfo, &[Media]) -> Result<(), HandlerError> + Send + Sync>;
/// Returns the stream to read in play mode; `Ok(None)` accepts a record
/// SETUP addressed at the session's announced medias.
pub type SetupHandler =
    Box<dyn Fn(&RequestInfo) -> Result<Option<Arc<ServerStream>>, HandlerError> + Send + Sync>;
pub type SessionHook = Box<dyn Fn(&SessionInfo) -> Result<(), HandlerError> + Send + Sync>;
pub type ParamHandler =
    Box<dyn Fn(&RequestInfo, &[u8]) -> Result<Vec<u8>, HandlerError> + Send + Sync>;

/// The record of optional handlers. `OPTIONS` advertises only the methods
/// whose handler is present (plus GET_PARAMETER and TEARDOWN, which are
/// always served).
#[derive(Default)]
pub struct ServerHandlers {
    pub on_conn_open: Option<Box<dyn Fn(SocketAddr) + Send + Sync>>,
    pub on_conn_close: Option<Box<dyn Fn(SocketAddr) + Send + Sync>>,
    pub on_session_open: Option<Box<dyn Fn(&SessionInfo) + Send + Sync>>,
    pub on_session_close: Option<Box<dyn Fn(&SessionInfo) + Send + Sync>>,
    pub on_describe: Option<DescribeHandler>,
    pub on_announce: Option<AnnounceHandler>,
    pub on_setup: Option<SetupHandler>,
    pub on_play: Option<SessionHook>,
    pub on_record: Option<SessionHook>,
    pub on_pause: Option<SessionHook>,
    pub on_get_parameter: Option<ParamHandler>,
    pub on_set_parameter: Option<ParamHandler>,
    pub on_packet_rtp: Option<Box<dyn Fn(&SessionInfo, usize, &rtp::Packet) + Send + Sync>>,
    pub on_packet_rtcp: Option<Box<dyn Fn(&SessionInfo, usize, &[u8]) + Send + Sync>>,
    pub on_decode_error: Option<Box<dyn Fn(&SessionInfo, &Error) + Send + Sync>>,
}

impl ServerHandlers {
    /// The `Public` header value.
    pub(crate) fn public_methods(&self) -> String {
        let mut methods = vec!["OPTIONS"];
        if self.on_describe.is_some() {
            methods.push("DESCRIBE");
        }
        if self.on_announce.is_some() {
            methods.push("ANNOUNCE");
        }
        if self.on_setup.is_some() || self.on_announce.is_some() {
            methods.push("SETUP");
        }
        if self.on_play.is_some() || self.on_setup.is_some() {
            methods.push("PLAY");
        }
        if self.on_record.is_some() || self.on_announce.is_some() {
            methods.push("RECORD");
        }
        if self.on_pause.is_some() {
            methods.push("PAUSE");
        }
        methods.push("GET_PARAMETER");
        if self.on_set_parameter.is_some() {
            methods.push("SET_PARAMETER");
        }
        methods.push("TEARDOWN");
        methods.join(", ")
    }

    pub(crate) fn report_decode_error(&self, info: &SessionInfo, e: &Error) {
        match &self.on_decode_error {
            Some(cb) => cb(info, e),
            None => log::debug!("session {}: decode error: {}", info.public_id, e),
        }
    }
}

pub(crate) type ConnId = u64;

/// A request routed into the session layer.
pub(crate) struct SessionRequest {
    pub(crate) conn_id: ConnId,
    pub(crate) conn_queue: crate::conn::WriteQueue,
    pub(crate) remote_addr: SocketAddr,
    pub(crate) req: rtsp_types::Request<Vec<u8>>,
    pub(crate) cseq: u32,
    pub(crate) session_id: Option<String>,
    pub(crate) reply: oneshot::Sender<SessionReply>,
}

pub(crate) struct SessionReply {
    pub(crate) response: rtsp_types::Response<Vec<u8>>,
    /// When set, the connection links itself to this session.
    pub(crate) session: Option<SessionHandle>,
    /// When set, the connection unlinks (session destroyed).
    pub(crate) destroyed: bool,
}

#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub(crate) secret_id: String,
    pub(crate) public_id: String,
    pub(crate) tx: mpsc::Sender<SessionMsg>,
}

pub(crate) enum SessionMsg {
    Request(SessionRequest),
    /// Inbound interleaved frame from the owning connection.
    Frame(u8, Bytes),
    ConnGone(ConnId),
    /// The stream gave up on this reader.
    Kick,
}

pub(crate) enum ToDispatcher {
    Request(SessionRequest),
    SessionClosed { secret_id: String },
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Builds a response with the headers every response carries.
pub(crate) fn base_response(
    status: rtsp_types::StatusCode,
    cseq: Option<u32>,
) -> rtsp_types::ResponseBuilder {
    let mut b = rtsp_types::Response::builder(rtsp_types::Version::V1_0, status)
        .header(rtsp_types::headers::SERVER, "fovea".to_owned());
    if let Some(c) = cseq {
        b = b.header(rtsp_types::headers::CSEQ, c.to_string());
    }
    b
}

pub(crate) fn status_for(e: &Error) -> rtsp_types::StatusCode {
    use rtsp_types::StatusCode;
    match e {
        Error::InvalidCredentials | Error::AuthChallenge(..) => StatusCode::Unauthorized,
        Error::SessionNotFound | Error::SessionTimedOut => StatusCode::SessionNotFound,
        Error::MethodNotValidInState { .. } => StatusCode::MethodNotValidInThisState,
        Error::UnsupportedTransport(..) => StatusCode::UnsupportedTransport,
        Error::MalformedMessage(..)
        | Error::MissingCseq
        | Error::InvalidUrl(..)
        | Error::LinkedToOtherConnection
        | Error::BadInterleavedFrame(..) => StatusCode::BadRequest,
        _ => StatusCode::InternalServerError,
    }
}

/// A running RTSP server.
pub struct Server {
    local_addr: SocketAddr,
    accept: tokio::task::JoinHandle<()>,
    dispatcher: tokio::task::JoinHandle<()>,
}

impl Server {
    /// Binds and starts serving.
    pub async fn bind(
        addr: &str,
        config: ServerConfig,
        handlers: ServerHandlers,
    ) -> Result<Server> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let config = Arc::new(config);
        let handlers = Arc::new(handlers);
        let multicast = config
            .multicast_range
            .map(|(base, prefix)| Mutex::new(MulticastAllocator::new(base, prefix)));
        let shared = Arc::new(Shared {
            config,
            handlers,
            multicast,
        });

        let (dispatcher_tx, dispatcher_rx) = mpsc::channel(64);
        let dispatcher = tokio::spawn(run_dispatcher(dispatcher_rx, shared.clone()));

        let accept_shared = shared;
        let accept = tokio::spawn(async move {
            let next_conn_id = AtomicU64::new(1);
            loop {
                let (socket, remote_addr) = match listener.accept().await {
                    Ok(a) => a,
                    Err(e) => {
                        log::warn!("accept failed: {}", e);
                        continue;
                    }
                };
                let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(conn::run_conn(
                    conn_id,
                    socket,
                    remote_addr,
                    accept_shared.clone(),
                    dispatcher_tx.clone(),
                ));
            }
        });

        Ok(Server {
            local_addr,
            accept,
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and dissolves the dispatcher. Existing connections
    /// wind down as their peers disconnect or their requests fail with
    /// `Terminated`.
    pub fn close(&self) {
        self.accept.abort();
        self.dispatcher.abort();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

/// State shared by every task of one server.
pub(crate) struct Shared {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) handlers: Arc<ServerHandlers>,
    pub(crate) multicast: Option<Mutex<MulticastAllocator>>,
}

impl Shared {
    pub(crate) fn allocate_multicast_group(&self) -> Option<Ipv4Addr> {
        self.multicast
            .as_ref()
            .map(|m| m.lock().expect("multicast allocator poisoned").next())
    }
}

async fn run_dispatcher(mut rx: mpsc::Receiver<ToDispatcher>, shared: Arc<Shared>) {
    let mut sessions: HashMap<String, SessionHandle> = HashMap::new();
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<String>();
    loop {
        tokio::select! {
            msg = rx.recv() => {
                let msg = match msg {
                    Some(m) => m,
                    None => return,
                };
                match msg {
                    ToDispatcher::Request(sreq) => {
                        route_request(sreq, &mut sessions, &shared, &closed_tx);
                    }
                    ToDispatcher::SessionClosed { secret_id } => {
                        sessions.remove(&secret_id);
                    }
                }
            }
            secret_id = closed_rx.recv() => {
                if let Some(secret_id) = secret_id {
                    sessions.remove(&secret_id);
                }
            }
        }
    }
}

fn route_request(
    sreq: SessionRequest,
    sessions: &mut HashMap<String, SessionHandle>,
    shared: &Arc<Shared>,
    closed_tx: &mpsc::UnboundedSender<String>,
) {
    let session_id = sreq.session_id.clone();
    match session_id {
        Some(id) => match sessions.get(&id) {
            Some(handle) => {
                if let Err(e) = handle.tx.try_send(SessionMsg::Request(sreq)) {
                    use mpsc::error::TrySendError;
                    let sreq = match e {
                        TrySendError::Full(SessionMsg::Request(s))
                        | TrySendError::Closed(SessionMsg::Request(s)) => s,
                        _ => return,
                    };
                    let cseq = sreq.cseq;
                    let _ = sreq.reply.send(SessionReply {
                        response: base_response(
                            rtsp_types::StatusCode::SessionNotFound,
                            Some(cseq),
                        )
                        .build(Vec::new()),
                        session: None,
                        destroyed: false,
                    });
                }
            }
            None => {
                let _ = sreq.reply.send(SessionReply {
                    response: base_response(
                        rtsp_types::StatusCode::SessionNotFound,
                        Some(sreq.cseq),
                    )
                    .build(Vec::new()),
                    session: None,
                    destroyed: false,
                });
            }
        },
        None => {
            let method = sreq.req.method().clone();
            let creating = matches!(
                method,
                rtsp_types::Method::Setup | rtsp_types::Method::Announce
            );
            if !creating {
                let _ = sreq.reply.send(SessionReply {
                    response: base_response(
                        rtsp_types::StatusCode::SessionNotFound,
                        Some(sreq.cseq),
                    )
                    .build(Vec::new()),
                    session: None,
                    destroyed: false,
                });
                return;
            }
            let secret_id = random_hex(8);
            let public_id = random_hex(4);
            // Requests and inbound interleaved frames share this queue;
            // frames are enqueued best-effort, requests with back-pressure.
            let (tx, session_rx) = mpsc::channel(shared.config.write_queue_size.max(8));
            let handle = SessionHandle {
                secret_id: secret_id.clone(),
                public_id: public_id.clone(),
                tx,
            };
            sessions.insert(secret_id.clone(), handle.clone());
            tokio::spawn(session::run_session(
                handle.clone(),
                shared.clone(),
                session_rx,
                closed_tx.clone(),
            ));
            if handle.tx.try_send(SessionMsg::Request(sreq)).is_err() {
                // Freshly created with an empty queue; can't happen.
                sessions.remove(&secret_id);
            }
        }
    }
}

