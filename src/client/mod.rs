// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP client: drives OPTIONS → DESCRIBE → SETUP → PLAY|RECORD → TEARDOWN
//! over one control connection, with RTP/RTCP flowing over UDP, UDP
//! multicast, or TCP-interleaved channels.
//!
//! One reader task per connection demultiplexes responses, server requests,
//! and interleaved frames. Each UDP media owns a processing task fed by its
//! socket receive loops. All writes, control or data, go through the
//! connection's single drain task.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::auth::{Credentials, Sender as AuthSender};
use crate::conn::{self, Item, WriteQueue};
use crate::format::Format;
use crate::headers::{self, Delivery, Protocol, Transport, TransportMode};
use crate::media::Media;
use crate::reorder::Reorderer;
use crate::rtcp::{self, RtcpReceiver, RtcpSender};
use crate::rtp;
use crate::transport::{self, UdpPair};
use crate::{Error, NtpTimestamp, Result};

/// Client configuration. The `Default` instance matches the documented
/// defaults; construct with struct update syntax.
pub struct ClientConfig {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub keepalive_period: Duration,
    pub udp_receiver_report_period: Duration,
    pub sender_report_period: Duration,
    pub check_stream_period: Duration,
    /// Bounds the bytes parked between a UDP socket and its processing
    /// task; the OS-level socket buffer is left at the platform default.
    pub udp_read_buffer_size: usize,
    pub max_packet_size: usize,
    pub write_queue_size: usize,
    pub udp_rtp_port_range: Option<(u16, u16)>,
    /// Forces a transport instead of trying UDP first with TCP fallback.
    pub transport: Option<Protocol>,
    pub max_redirects: usize,
    pub credentials: Option<Credentials>,
    /// Wraps the control connection for `rtsps`.
    pub tls: Option<tokio_rustls::TlsConnector>,
    pub disable_rtcp_sender_reports: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            keepalive_period: Duration::from_secs(30),
            udp_receiver_report_period: Duration::from_secs(10),
            sender_report_period: Duration::from_secs(10),
            check_stream_period: Duration::from_secs(1),
            udp_read_buffer_size: 2 * 1024 * 1024,
            max_packet_size: transport::DEFAULT_MAX_PACKET_SIZE,
            write_queue_size: 256,
            udp_rtp_port_range: None,
            transport: None,
            max_redirects: 5,
            credentials: None,
            tls: None,
            disable_rtcp_sender_reports: false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Initial,
    Prepared,
    PrePlay,
    Play,
    PreRecord,
    Record,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::Initial => "Initial",
            State::Prepared => "Prepared",
            State::PrePlay => "PrePlay",
            State::Play => "Play",
            State::PreRecord => "PreRecord",
            State::Record => "Record",
        }
    }
}

/// Identifies the origin of a delivered packet.
#[derive(Copy, Clone, Debug)]
pub struct PacketContext {
    pub media_idx: usize,
    pub payload_type: u8,
}

type RtpCallback = dyn Fn(PacketContext, &rtp::Packet) + Send + Sync;
type RtcpCallback = dyn Fn(usize, &[u8]) + Send + Sync;
type DecodeErrorCallback = dyn Fn(&Error) + Send + Sync;

#[derive(Default)]
struct Callbacks {
    on_rtp: Mutex<Option<Arc<RtpCallback>>>,
    on_rtcp: Mutex<Option<Arc<RtcpCallback>>>,
    on_decode_error: Mutex<Option<Arc<DecodeErrorCallback>>>,
}

impl Callbacks {
    fn rtp(&self) -> Option<Arc<RtpCallback>> {
        self.on_rtp.lock().expect("callbacks poisoned").clone()
    }
    fn rtcp(&self) -> Option<Arc<RtcpCallback>> {
        self.on_rtcp.lock().expect("callbacks poisoned").clone()
    }
    fn decode_error(&self) -> Option<Arc<DecodeErrorCallback>> {
        self.on_decode_error
            .lock()
            .expect("callbacks poisoned")
            .clone()
    }
    fn report_decode_error(&self, e: &Error) {
        match self.decode_error() {
            Some(cb) => cb(e),
            None => log::debug!("decode error: {}", e),
        }
    }
}

/// First fatal error wins; later ones are dropped.
#[derive(Clone, Default)]
struct Fatal {
    slot: Arc<Mutex<Option<Error>>>,
    notify: Arc<tokio::sync::Notify>,
}

impl Fatal {
    fn set(&self, e: Error) {
        let mut slot = self.slot.lock().expect("fatal poisoned");
        if slot.is_none() {
            *slot = Some(e);
        }
        self.notify.notify_one();
    }

    fn take(&self) -> Option<Error> {
        self.slot.lock().expect("fatal poisoned").take()
    }
}

type PendingMap = Arc<Mutex<HashMap<u32, oneshot::Sender<rtsp_types::Response<Vec<u8>>>>>>;

/// What the connection reader needs to route an interleaved channel.
struct TcpSink {
    media_idx: usize,
    is_rtcp: bool,
    formats: Arc<HashMap<u8, Format>>,
}

enum SinkCmd {
    Install(u8, TcpSink),
    Clear,
}

struct Conn {
    queue: WriteQueue,
    reader: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
    pending: PendingMap,
    sink_tx: mpsc::UnboundedSender<SinkCmd>,
    peer_ip: IpAddr,
}

impl Conn {
    fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

enum MediaTransport {
    Udp {
        pair: UdpPair,
        rtp_peer: SocketAddr,
        rtcp_peer: SocketAddr,
    },
    Multicast {
        pair: UdpPair,
    },
    Tcp {
        channels: (u8, u8),
    },
}

struct ClientMedia {
    media: Media,
    formats: Arc<HashMap<u8, Format>>,
    transport: MediaTransport,
    /// Play over UDP: liveness witnesses, one per format.
    receivers: Vec<Arc<RtcpReceiver>>,
    /// Record: SR bookkeeping, one per format with a usable clock.
    senders: HashMap<u8, RtcpSender>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ClientMedia {
    fn stop(&mut self) {
        for t in self.tasks.drain(..) {
            t.abort();
        }
        self.receivers.clear();
        self.senders.clear();
    }
}

/// An RTSP client. Operations must be called in protocol order; calling one
/// in the wrong state fails without side effects.
pub struct Client {
    config: ClientConfig,
    state: State,
    conn: Option<Conn>,
    scheme_tls: bool,
    host: String,
    port: u16,
    cseq: Arc<AtomicU32>,
    session: Option<headers::Session>,
    base_url: Option<Url>,
    auth: Option<AuthSender>,
    server_supports_get_parameter: bool,
    protocol: Option<Protocol>,
    medias: Vec<ClientMedia>,
    announced: Option<Vec<Media>>,
    next_channel: u8,
    callbacks: Arc<Callbacks>,
    fatal: Fatal,
    keepalive: Option<tokio::task::JoinHandle<()>>,
    checker: Option<tokio::task::JoinHandle<()>>,
}

fn method_str(m: &rtsp_types::Method) -> &'static str {
    use rtsp_types::Method;
    match m {
        Method::Options => "OPTIONS",
        Method::Describe => "DESCRIBE",
        Method::Announce => "ANNOUNCE",
        Method::Setup => "SETUP",
        Method::Play => "PLAY",
        Method::Pause => "PAUSE",
        Method::Record => "RECORD",
        Method::Teardown => "TEARDOWN",
        Method::GetParameter => "GET_PARAMETER",
        Method::SetParameter => "SET_PARAMETER",
        _ => "OPTIONS",
    }
}

impl Client {
    pub fn new(config: ClientConfig) -> Client {
        Client {
            config,
            state: State::Initial,
            conn: None,
            scheme_tls: false,
            host: String::new(),
            port: 0,
            cseq: Arc::new(AtomicU32::new(1)),
            session: None,
            base_url: None,
            auth: None,
            server_supports_get_parameter: false,
            protocol: None,
            medias: Vec::new(),
            announced: None,
            next_channel: 0,
            callbacks: Arc::new(Callbacks::default()),
            fatal: Fatal::default(),
            keepalive: None,
            checker: None,
        }
    }

    /// Registers the RTP delivery callback. Call before `play`.
    pub fn on_packet_rtp(&self, cb: impl Fn(PacketContext, &rtp::Packet) + Send + Sync + 'static) {
        *self.callbacks.on_rtp.lock().expect("callbacks poisoned") = Some(Arc::new(cb));
    }

    /// Registers the RTCP delivery callback (raw compound buffers).
    pub fn on_packet_rtcp(&self, cb: impl Fn(usize, &[u8]) + Send + Sync + 'static) {
        *self.callbacks.on_rtcp.lock().expect("callbacks poisoned") = Some(Arc::new(cb));
    }

    /// Registers the non-fatal decode error callback.
    pub fn on_decode_error(&self, cb: impl Fn(&Error) + Send + Sync + 'static) {
        *self
            .callbacks
            .on_decode_error
            .lock()
            .expect("callbacks poisoned") = Some(Arc::new(cb));
    }

    /// Connects the control connection. `host` may carry an explicit port.
    pub async fn start(&mut self, scheme: &str, host: &str) -> Result<()> {
        if self.state != State::Initial {
            return Err(Error::InvalidClientState {
                op: "start",
                state: self.state.name(),
            });
        }
        let tls = match scheme {
            "rtsp" => false,
            "rtsps" => true,
            other => {
                return Err(Error::InvalidUrl(format!("unsupported scheme {:?}", other)));
            }
        };
        let (hostname, port) = match host.rfind(':') {
            Some(i) if host[i + 1..].chars().all(|c| c.is_ascii_digit()) => (
                host[..i].to_owned(),
                host[i + 1..]
                    .parse()
                    .map_err(|_| Error::InvalidUrl(format!("bad port in {:?}", host)))?,
            ),
            _ => (host.to_owned(), if tls { 322 } else { 554 }),
        };
        self.scheme_tls = tls;
        self.host = hostname;
        self.port = port;
        self.connect().await?;
        self.state = State::Prepared;
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        let stream = tokio::time::timeout(
            self.config.read_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| Error::ReadTimeout)??;
        let peer_ip = stream.peer_addr()?.ip();
        let stream: Box<dyn conn::AsyncStream> = if self.scheme_tls {
            let connector = self
                .config
                .tls
                .clone()
                .ok_or_else(|| Error::InvalidUrl("rtsps requires a TLS connector".to_owned()))?;
            let name = tokio_rustls::webpki::DNSNameRef::try_from_ascii_str(&self.host)
                .map_err(|_| Error::InvalidUrl(format!("bad TLS hostname {:?}", self.host)))?;
            Box::new(connector.connect(name, stream).await?)
        } else {
            Box::new(stream)
        };

        let framed = conn::framed(stream);
        let (sink, read_half) = framed.split();
        let (queue, queue_rx) = WriteQueue::new(self.config.write_queue_size);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();

        let fatal = self.fatal.clone();
        let write_timeout = self.config.write_timeout;
        let writer = tokio::spawn(async move {
            if let Err(e) = conn::drain_writes(sink, queue_rx, write_timeout).await {
                fatal.set(e);
            }
        });
        let reader = tokio::spawn(run_reader(
            read_half,
            pending.clone(),
            sink_rx,
            queue.clone(),
            self.callbacks.clone(),
            self.fatal.clone(),
        ));

        self.conn = Some(Conn {
            queue,
            reader,
            writer,
            pending,
            sink_tx,
            peer_ip,
        });
        Ok(())
    }

    fn conn(&self) -> Result<&Conn> {
        self.conn.as_ref().ok_or(Error::ConnectionClosed)
    }

    /// Sends one request and awaits its response, retrying once after a 401
    /// challenge when credentials are configured.
    async fn request(
        &mut self,
        method: rtsp_types::Method,
        url: &Url,
        extra: Vec<(rtsp_types::HeaderName, String)>,
        body: Vec<u8>,
    ) -> Result<rtsp_types::Response<Vec<u8>>> {
        let resp = self
            .request_once(method.clone(), url, extra.clone(), body.clone())
            .await?;
        if resp.status() == rtsp_types::StatusCode::Unauthorized && self.auth.is_none() {
            let creds = self
                .config
                .credentials
                .clone()
                .ok_or(Error::InvalidCredentials)?;
            let challenge = resp
                .header(&rtsp_types::headers::WWW_AUTHENTICATE)
                .ok_or(Error::InvalidCredentials)?
                .as_str()
                .to_owned();
            self.auth = Some(AuthSender::new(&challenge, &creds)?);
            return self.request_once(method, url, extra, body).await;
        }
        Ok(resp)
    }

    async fn request_once(
        &mut self,
        method: rtsp_types::Method,
        url: &Url,
        extra: Vec<(rtsp_types::HeaderName, String)>,
        body: Vec<u8>,
    ) -> Result<rtsp_types::Response<Vec<u8>>> {
        if let Some(e) = self.fatal.take() {
            self.close_internal();
            return Err(e);
        }
        let cseq = self.cseq.fetch_add(1, Ordering::Relaxed);
        let mut builder = rtsp_types::Request::builder(method.clone(), rtsp_types::Version::V1_0)
            .request_uri(url.clone())
            .header(rtsp_types::headers::CSEQ, cseq.to_string())
            .header(rtsp_types::headers::USER_AGENT, "fovea".to_owned());
        if let Some(session) = &self.session {
            builder = builder.header(rtsp_types::headers::SESSION, session.id.clone());
        }
        if let Some(auth) = &self.auth {
            builder = builder.header(
                rtsp_types::headers::AUTHORIZATION,
                auth.authorization(method_str(&method), url.as_str())?,
            );
        }
        for (name, value) in extra {
            builder = builder.header(name, value);
        }
        let req = builder.build(body);

        let (tx, rx) = oneshot::channel();
        let conn = self.conn()?;
        conn.pending
            .lock()
            .expect("pending poisoned")
            .insert(cseq, tx);
        conn.queue
            .send_control(Item::Msg(rtsp_types::Message::Request(req)))
            .await?;
        let resp = match tokio::time::timeout(self.config.read_timeout, rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => return Err(self.fatal.take().unwrap_or(Error::ConnectionClosed)),
            Err(_) => {
                if let Ok(conn) = self.conn() {
                    conn.pending.lock().expect("pending poisoned").remove(&cseq);
                }
                return Err(Error::ReadTimeout);
            }
        };
        if let Some(s) = resp.header(&rtsp_types::headers::SESSION) {
            self.session = Some(headers::Session::parse(s.as_str())?);
        }
        Ok(resp)
    }

    /// Sends OPTIONS and records which methods the server advertises.
    pub async fn options(&mut self, url: &Url) -> Result<rtsp_types::Response<Vec<u8>>> {
        let resp = self
            .request(rtsp_types::Method::Options, url, Vec::new(), Vec::new())
            .await?;
        if resp.status() == rtsp_types::StatusCode::Ok {
            if let Some(public) = resp.header(&rtsp_types::headers::PUBLIC) {
                self.server_supports_get_parameter = public
                    .as_str()
                    .split(',')
                    .any(|m| m.trim().eq_ignore_ascii_case("GET_PARAMETER"));
            }
        }
        Ok(resp)
    }

    /// Sends DESCRIBE and parses the SDP answer into medias, following
    /// redirects up to the configured limit.
    pub async fn describe(&mut self, url: &Url) -> Result<Vec<Media>> {
        if self.state != State::Prepared {
            return Err(Error::InvalidClientState {
                op: "describe",
                state: self.state.name(),
            });
        }
        let mut url = url.clone();
        for _ in 0..=self.config.max_redirects {
            let resp = self
                .request(
                    rtsp_types::Method::Describe,
                    &url,
                    vec![(
                        rtsp_types::headers::ACCEPT,
                        "application/sdp".to_owned(),
                    )],
                    Vec::new(),
                )
                .await?;
            let status = u16::from(resp.status());
            if status == 301 || status == 302 {
                let location = resp
                    .header(&rtsp_types::headers::LOCATION)
                    .ok_or_else(|| {
                        Error::MalformedMessage("redirect without Location".to_owned())
                    })?
                    .as_str()
                    .to_owned();
                url = Url::parse(&location)
                    .map_err(|e| Error::InvalidUrl(format!("bad Location: {}", e)))?;
                let host = url
                    .host_str()
                    .ok_or_else(|| Error::InvalidUrl("redirect without host".to_owned()))?
                    .to_owned();
                // Move the control connection to the new host.
                self.teardown_conn_only();
                self.host = host;
                self.port = url.port().unwrap_or(if self.scheme_tls { 322 } else { 554 });
                self.connect().await?;
                continue;
            }
            if resp.status() != rtsp_types::StatusCode::Ok {
                return Err(Error::RequestFailed {
                    method: "DESCRIBE",
                    status,
                });
            }
            let base = resp
                .header(&rtsp_types::headers::CONTENT_BASE)
                .or_else(|| resp.header(&rtsp_types::headers::CONTENT_LOCATION))
                .map(|v| Url::parse(v.as_str()))
                .unwrap_or_else(|| Ok(url.clone()))
                .map_err(|e| Error::InvalidUrl(format!("bad Content-Base: {}", e)))?;
            self.base_url = Some(base);
            return crate::media::unmarshal_sdp(resp.body());
        }
        Err(Error::RequestFailed {
            method: "DESCRIBE",
            status: 302,
        })
    }

    /// Announces medias for publishing; the session moves toward RECORD.
    pub async fn announce(&mut self, url: &Url, medias: Vec<Media>) -> Result<()> {
        if self.state != State::Prepared {
            return Err(Error::InvalidClientState {
                op: "announce",
                state: self.state.name(),
            });
        }
        // Control attributes the server can route: one per media index.
        let mut medias = medias;
        for (i, m) in medias.iter_mut().enumerate() {
            if m.control.is_empty() {
                m.control = format!("trackID={}", i);
            }
        }
        let body = crate::media::marshal_sdp(&medias, "0.0.0.0");
        let resp = self
            .request(
                rtsp_types::Method::Announce,
                url,
                vec![(
                    rtsp_types::headers::CONTENT_TYPE,
                    "application/sdp".to_owned(),
                )],
                body.into_bytes(),
            )
            .await?;
        if resp.status() != rtsp_types::StatusCode::Ok {
            return Err(Error::RequestFailed {
                method: "ANNOUNCE",
                status: u16::from(resp.status()),
            });
        }
        self.base_url = Some(url.clone());
        self.announced = Some(medias);
        self.state = State::PreRecord;
        Ok(())
    }

    /// Sets up one media. UDP is attempted first (optionally on
    /// caller-chosen ports); a 461 answer falls back to TCP-interleaved
    /// within the same session. The first success locks the transport for
    /// every later SETUP.
    pub async fn setup(
        &mut self,
        media: &Media,
        base_url: &Url,
        rtp_port: Option<u16>,
    ) -> Result<()> {
        let mode = match self.state {
            State::Prepared | State::PrePlay => None,
            State::PreRecord => Some(TransportMode::Record),
            _ => {
                return Err(Error::InvalidClientState {
                    op: "setup",
                    state: self.state.name(),
                });
            }
        };
        let url = media.url(base_url)?;

        let first_try = self
            .protocol
            .or(self.config.transport)
            .unwrap_or(Protocol::Udp);
        let outcome = match first_try {
            Protocol::Udp => match self.setup_udp(media, &url, rtp_port, mode).await {
                Err(Error::UnsupportedTransport(_))
                    if self.protocol.is_none() && self.config.transport.is_none() =>
                {
                    self.setup_tcp(media, &url, mode).await
                }
                other => other,
            },
            Protocol::Tcp => self.setup_tcp(media, &url, mode).await,
        };
        let client_media = outcome?;
        self.protocol = Some(match client_media.transport {
            MediaTransport::Tcp { .. } => Protocol::Tcp,
            _ => Protocol::Udp,
        });
        if self.base_url.is_none() {
            self.base_url = Some(base_url.clone());
        }
        self.medias.push(client_media);
        if mode.is_some() {
            self.state = State::PreRecord;
        } else {
            self.state = State::PrePlay;
        }
        Ok(())
    }

    async fn setup_udp(
        &mut self,
        media: &Media,
        url: &Url,
        rtp_port: Option<u16>,
        mode: Option<TransportMode>,
    ) -> Result<ClientMedia> {
        let pair = match rtp_port {
            Some(p) if p >= u16::MAX - 1 => return Err(Error::UdpPortAllocation),
            Some(p) => UdpPair::bind(Some((p, p + 2))).await?,
            None => UdpPair::bind(self.config.udp_rtp_port_range).await?,
        };
        let transport = Transport {
            protocol: Some(Protocol::Udp),
            delivery: Some(Delivery::Unicast),
            client_port: Some((pair.rtp_port, pair.rtcp_port)),
            mode,
            ..Transport::default()
        };
        let resp = self
            .request(
                rtsp_types::Method::Setup,
                url,
                vec![(rtsp_types::headers::TRANSPORT, transport.marshal())],
                Vec::new(),
            )
            .await?;
        match resp.status() {
            rtsp_types::StatusCode::Ok => {}
            rtsp_types::StatusCode::UnsupportedTransport => {
                return Err(Error::UnsupportedTransport("server refused UDP".to_owned()));
            }
            status => {
                return Err(Error::RequestFailed {
                    method: "SETUP",
                    status: u16::from(status),
                });
            }
        }
        let answered = Transport::parse(
            resp.header(&rtsp_types::headers::TRANSPORT)
                .ok_or_else(|| {
                    Error::MalformedMessage("SETUP response without Transport".to_owned())
                })?
                .as_str(),
        )?;
        if answered.protocol == Some(Protocol::Tcp) {
            return Err(Error::UnsupportedTransport(
                "server answered UDP SETUP with TCP".to_owned(),
            ));
        }

        if answered.delivery == Some(Delivery::Multicast) {
            // Join the advertised group instead of using our unicast pair.
            let group = match answered.destination {
                Some(IpAddr::V4(g)) if g.is_multicast() => g,
                other => {
                    return Err(Error::MalformedMessage(format!(
                        "bad multicast destination {:?}",
                        other
                    )));
                }
            };
            let (group_rtp_port, _) = answered.port.ok_or_else(|| {
                Error::MalformedMessage("multicast SETUP without port".to_owned())
            })?;
            let mpair = UdpPair::bind_multicast(group, group_rtp_port).await?;
            return Ok(self.new_media(media, MediaTransport::Multicast { pair: mpair }));
        }

        let (server_rtp, server_rtcp) = answered.server_port.ok_or_else(|| {
            Error::MalformedMessage("SETUP response without server_port".to_owned())
        })?;
        let peer_ip = answered
            .destination
            .unwrap_or(self.conn()?.peer_ip);
        Ok(self.new_media(
            media,
            MediaTransport::Udp {
                pair,
                rtp_peer: SocketAddr::new(peer_ip, server_rtp),
                rtcp_peer: SocketAddr::new(peer_ip, server_rtcp),
            },
        ))
    }

    async fn setup_tcp(
        &mut self,
        media: &Media,
        url: &Url,
        mode: Option<TransportMode>,
    ) -> Result<ClientMedia> {
        if self.next_channel > 253 {
            return Err(Error::ChannelExhaustion);
        }
        let channels = (self.next_channel, self.next_channel + 1);
        let transport = Transport {
            protocol: Some(Protocol::Tcp),
            delivery: Some(Delivery::Unicast),
            interleaved: Some(channels),
            mode,
            ..Transport::default()
        };
        let resp = self
            .request(
                rtsp_types::Method::Setup,
                url,
                vec![(rtsp_types::headers::TRANSPORT, transport.marshal())],
                Vec::new(),
            )
            .await?;
        if resp.status() != rtsp_types::StatusCode::Ok {
            return Err(Error::RequestFailed {
                method: "SETUP",
                status: u16::from(resp.status()),
            });
        }
        let answered = Transport::parse(
            resp.header(&rtsp_types::headers::TRANSPORT)
                .ok_or_else(|| {
                    Error::MalformedMessage("SETUP response without Transport".to_owned())
                })?
                .as_str(),
        )?;
        let channels = answered.interleaved.unwrap_or(channels);
        self.next_channel = channels.0.max(self.next_channel) + 2;
        Ok(self.new_media(media, MediaTransport::Tcp { channels }))
    }

    fn new_media(&self, media: &Media, transport: MediaTransport) -> ClientMedia {
        let formats: HashMap<u8, Format> = media
            .formats
            .iter()
            .map(|f| (f.payload_type(), f.clone()))
            .collect();
        ClientMedia {
            media: media.clone(),
            formats: Arc::new(formats),
            transport,
            receivers: Vec::new(),
            senders: HashMap::new(),
            tasks: Vec::new(),
        }
    }

    /// Starts playback of everything set up.
    pub async fn play(&mut self, range: Option<&str>) -> Result<()> {
        if self.state != State::PrePlay {
            return Err(Error::InvalidClientState {
                op: "play",
                state: self.state.name(),
            });
        }
        let url = self.base_url.clone().ok_or(Error::SessionNotFound)?;
        let mut extra = Vec::new();
        if let Some(range) = range {
            extra.push((rtsp_types::headers::RANGE, range.to_owned()));
        }
        let resp = self
            .request(rtsp_types::Method::Play, &url, extra, Vec::new())
            .await?;
        if resp.status() != rtsp_types::StatusCode::Ok {
            return Err(Error::RequestFailed {
                method: "PLAY",
                status: u16::from(resp.status()),
            });
        }
        self.state = State::Play;
        self.start_reading();
        self.start_keepalive();
        Ok(())
    }

    /// Starts publishing after ANNOUNCE + SETUP.
    pub async fn record(&mut self) -> Result<()> {
        if self.state != State::PreRecord || self.medias.is_empty() {
            return Err(Error::InvalidClientState {
                op: "record",
                state: self.state.name(),
            });
        }
        let url = self.base_url.clone().ok_or(Error::SessionNotFound)?;
        let resp = self
            .request(rtsp_types::Method::Record, &url, Vec::new(), Vec::new())
            .await?;
        if resp.status() != rtsp_types::StatusCode::Ok {
            return Err(Error::RequestFailed {
                method: "RECORD",
                status: u16::from(resp.status()),
            });
        }
        self.state = State::Record;
        self.start_rtcp_senders();
        self.start_keepalive();
        Ok(())
    }

    /// Pauses delivery; transports stay negotiated, so `play` or `record`
    /// can resume.
    pub async fn pause(&mut self) -> Result<()> {
        let next = match self.state {
            State::Play => State::PrePlay,
            State::Record => State::PreRecord,
            _ => {
                return Err(Error::InvalidClientState {
                    op: "pause",
                    state: self.state.name(),
                });
            }
        };
        let url = self.base_url.clone().ok_or(Error::SessionNotFound)?;
        let resp = self
            .request(rtsp_types::Method::Pause, &url, Vec::new(), Vec::new())
            .await?;
        if resp.status() != rtsp_types::StatusCode::Ok {
            return Err(Error::RequestFailed {
                method: "PAUSE",
                status: u16::from(resp.status()),
            });
        }
        self.stop_media_tasks();
        self.state = next;
        Ok(())
    }

    /// Tears the session down (best effort) and closes everything.
    pub async fn teardown(&mut self) -> Result<()> {
        if let Some(url) = self.base_url.clone() {
            let _ = self
                .request(rtsp_types::Method::Teardown, &url, Vec::new(), Vec::new())
                .await;
        }
        self.close_internal();
        Ok(())
    }

    /// Blocks until the session dies: fatal connection error, stream
    /// silence, or local close (surfaced as [`Error::Terminated`]).
    pub async fn wait(&mut self) -> Result<()> {
        loop {
            if let Some(e) = self.fatal.take() {
                self.close_internal();
                return Err(e);
            }
            self.fatal.notify.notified().await;
        }
    }

    /// Closes immediately without TEARDOWN.
    pub fn close(&mut self) {
        self.close_internal();
    }

    fn close_internal(&mut self) {
        self.stop_media_tasks();
        self.teardown_conn_only();
        self.medias.clear();
        self.session = None;
        self.protocol = None;
        self.next_channel = 0;
        self.state = State::Initial;
        self.fatal.set(Error::Terminated);
    }

    fn teardown_conn_only(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.abort();
        }
    }

    fn stop_media_tasks(&mut self) {
        if let Some(k) = self.keepalive.take() {
            k.abort();
        }
        if let Some(c) = self.checker.take() {
            c.abort();
        }
        for m in &mut self.medias {
            m.stop();
        }
        if let Some(conn) = &self.conn {
            let _ = conn.sink_tx.send(SinkCmd::Clear);
        }
    }

    /// Wires the receive paths after PLAY.
    fn start_reading(&mut self) {
        let callbacks = self.callbacks.clone();
        let mut receivers_for_checker = Vec::new();
        for (media_idx, m) in self.medias.iter_mut().enumerate() {
            match &m.transport {
                MediaTransport::Tcp { channels } => {
                    // TCP preserves order and implies liveness; frames are
                    // dispatched straight from the connection reader.
                    if let Some(conn) = &self.conn {
                        let _ = conn.sink_tx.send(SinkCmd::Install(
                            channels.0,
                            TcpSink {
                                media_idx,
                                is_rtcp: false,
                                formats: m.formats.clone(),
                            },
                        ));
                        let _ = conn.sink_tx.send(SinkCmd::Install(
                            channels.1,
                            TcpSink {
                                media_idx,
                                is_rtcp: true,
                                formats: m.formats.clone(),
                            },
                        ));
                    }
                }
                MediaTransport::Udp { pair, rtp_peer, rtcp_peer } => {
                    let (receivers, tasks) = spawn_udp_media(
                        media_idx,
                        m.formats.clone(),
                        pair,
                        Some(*rtp_peer),
                        Some(*rtcp_peer),
                        &self.config,
                        callbacks.clone(),
                    );
                    receivers_for_checker.extend(receivers.iter().cloned());
                    m.receivers = receivers;
                    m.tasks = tasks;
                }
                MediaTransport::Multicast { pair } => {
                    let (receivers, tasks) = spawn_udp_media(
                        media_idx,
                        m.formats.clone(),
                        pair,
                        None,
                        None,
                        &self.config,
                        callbacks.clone(),
                    );
                    receivers_for_checker.extend(receivers.iter().cloned());
                    m.receivers = receivers;
                    m.tasks = tasks;
                }
            }
        }

        // Stream-death checker, UDP only.
        if !receivers_for_checker.is_empty() {
            let fatal = self.fatal.clone();
            let check_period = self.config.check_stream_period;
            let timeout = self.config.read_timeout;
            self.checker = Some(tokio::spawn(async move {
                let mut interval = tokio::time::interval(check_period);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if !receivers_for_checker.iter().any(|r| r.is_alive(timeout)) {
                        fatal.set(Error::StreamDead);
                        return;
                    }
                }
            }));
        }
    }

    fn start_rtcp_senders(&mut self) {
        if self.config.disable_rtcp_sender_reports {
            return;
        }
        let period = self.config.sender_report_period;
        for m in &mut self.medias {
            for f in &m.media.formats {
                let clock_rate = match NonZeroU32::new(f.clock_rate()) {
                    Some(c) => c,
                    None => continue,
                };
                let out = rtcp_out_of(&m.transport, self.conn.as_ref());
                m.senders.insert(
                    f.payload_type(),
                    RtcpSender::new(clock_rate, period, out),
                );
            }
        }
    }

    fn start_keepalive(&mut self) {
        if self.keepalive.is_some() {
            return;
        }
        let queue = match &self.conn {
            Some(c) => c.queue.clone(),
            None => return,
        };
        let url = match &self.base_url {
            Some(u) => u.clone(),
            None => return,
        };
        let session = self.session.clone();
        let cseq = self.cseq.clone();
        let period = self.config.keepalive_period;
        let method = if self.server_supports_get_parameter {
            rtsp_types::Method::GetParameter
        } else {
            rtsp_types::Method::Options
        };
        self.keepalive = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                interval.tick().await;
                let mut builder =
                    rtsp_types::Request::builder(method.clone(), rtsp_types::Version::V1_0)
                        .request_uri(url.clone())
                        .header(
                            rtsp_types::headers::CSEQ,
                            cseq.fetch_add(1, Ordering::Relaxed).to_string(),
                        )
                        .header(rtsp_types::headers::USER_AGENT, "fovea".to_owned());
                if let Some(session) = &session {
                    builder = builder.header(rtsp_types::headers::SESSION, session.id.clone());
                }
                // The response is consumed and discarded by the reader.
                if queue
                    .send_control(Item::Msg(rtsp_types::Message::Request(
                        builder.build(Vec::new()),
                    )))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }));
    }

    /// Writes one RTP packet on a set-up media (RECORD).
    pub async fn write_packet_rtp(&self, media_idx: usize, pkt: &rtp::Packet) -> Result<()> {
        if self.state != State::Record {
            return Err(Error::InvalidClientState {
                op: "write_packet_rtp",
                state: self.state.name(),
            });
        }
        let m = self.medias.get(media_idx).ok_or(Error::SessionNotFound)?;
        match &m.transport {
            MediaTransport::Udp { pair, rtp_peer, .. } => {
                pair.rtp.send_to(pkt.raw(), *rtp_peer).await?;
            }
            MediaTransport::Multicast { .. } => {
                return Err(Error::UnsupportedTransport(
                    "can't publish over multicast".to_owned(),
                ));
            }
            MediaTransport::Tcp { channels } => {
                let accepted = self.conn()?.queue.try_send_data(Item::Frame {
                    channel: channels.0,
                    payload: pkt.raw().clone(),
                });
                if !accepted {
                    log::debug!("dropping outbound RTP packet: write queue full");
                    return Ok(());
                }
            }
        }
        if let Some(sender) = m.senders.get(&pkt.payload_type) {
            let pts_equals_dts = m
                .formats
                .get(&pkt.payload_type)
                .map_or(true, |f| f.pts_equals_dts(&pkt.payload));
            sender.process_packet(pkt, NtpTimestamp::now(), pts_equals_dts);
        }
        Ok(())
    }

    /// Writes one RTCP packet on a set-up media.
    pub async fn write_packet_rtcp(&self, media_idx: usize, data: &[u8]) -> Result<()> {
        let m = self.medias.get(media_idx).ok_or(Error::SessionNotFound)?;
        match &m.transport {
            MediaTransport::Udp { pair, rtcp_peer, .. } => {
                pair.rtcp.send_to(data, *rtcp_peer).await?;
            }
            MediaTransport::Multicast { .. } => {}
            MediaTransport::Tcp { channels } => {
                self.conn()?.queue.try_send_data(Item::Frame {
                    channel: channels.1,
                    payload: Bytes::copy_from_slice(data),
                });
            }
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop_media_tasks();
        if let Some(conn) = self.conn.take() {
            conn.abort();
        }
    }
}

/// Where a record-mode RTCP sender's reports go.
fn rtcp_out_of(
    transport: &MediaTransport,
    conn: Option<&Conn>,
) -> Box<dyn Fn(Bytes) + Send + Sync> {
    match transport {
        MediaTransport::Udp { pair, rtcp_peer, .. } => {
            let socket = pair.rtcp.clone();
            let peer = *rtcp_peer;
            Box::new(move |data| {
                let socket = socket.clone();
                tokio::spawn(async move {
                    let _ = socket.send_to(&data, peer).await;
                });
            })
        }
        MediaTransport::Tcp { channels } => {
            let queue = conn.map(|c| c.queue.clone());
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
        MediaTransport::Multicast { .. } => Box::new(|_| {}),
    }
}

/// The per-connection reader: routes responses to their waiting requests,
/// answers stray server requests, and hands interleaved frames to the
/// installed sinks.
async fn run_reader(
    mut stream: futures::stream::SplitStream<
        tokio_util::codec::Framed<Box<dyn conn::AsyncStream>, conn::Codec>,
    >,
    pending: PendingMap,
    mut sink_rx: mpsc::UnboundedReceiver<SinkCmd>,
    queue: WriteQueue,
    callbacks: Arc<Callbacks>,
    fatal: Fatal,
) {
    let mut sinks: HashMap<u8, TcpSink> = HashMap::new();
    loop {
        tokio::select! {
            cmd = sink_rx.recv() => match cmd {
                Some(SinkCmd::Install(channel, sink)) => {
                    sinks.insert(channel, sink);
                }
                Some(SinkCmd::Clear) => sinks.clear(),
                None => return,
            },
            item = stream.next() => match item {
                None => {
                    fatal.set(Error::ConnectionClosed);
                    return;
                }
                Some(Err(e)) => {
                    fatal.set(e);
                    return;
                }
                Some(Ok(Item::Msg(rtsp_types::Message::Response(resp)))) => {
                    let cseq = conn::parse_cseq(resp.header(&rtsp_types::headers::CSEQ));
                    let tx = cseq.and_then(|c| {
                        pending.lock().expect("pending poisoned").remove(&c)
                    });
                    match tx {
                        Some(tx) => {
                            let _ = tx.send(resp);
                        }
                        // Keepalive answers land here.
                        None => log::debug!("response with no waiting request"),
                    }
                }
                Some(Ok(Item::Msg(rtsp_types::Message::Request(req)))) => {
                    let mut builder = rtsp_types::Response::builder(
                        req.version(),
                        rtsp_types::StatusCode::NotImplemented,
                    );
                    if let Some(cseq) = req.header(&rtsp_types::headers::CSEQ) {
                        builder = builder.header(rtsp_types::headers::CSEQ, cseq.as_str().to_owned());
                    }
                    let _ = queue
                        .send_control(Item::Msg(rtsp_types::Message::Response(
                            builder.build(Vec::new()),
                        )))
                        .await;
                }
                Some(Ok(Item::Msg(rtsp_types::Message::Data(_)))) => {
                    // The codec surfaces interleaved data as Item::Frame.
                }
                Some(Ok(Item::Frame { channel, payload })) => {
                    let sink = match sinks.get(&channel) {
                        Some(s) => s,
                        None => continue,
                    };
                    if sink.is_rtcp {
                        if let Some(cb) = callbacks.rtcp() {
                            cb(sink.media_idx, &payload);
                        }
                    } else {
                        match rtp::Packet::parse(payload) {
                            Ok(pkt) => {
                                if sink.formats.contains_key(&pkt.payload_type) {
                                    if let Some(cb) = callbacks.rtp() {
                                        cb(
                                            PacketContext {
                                                media_idx: sink.media_idx,
                                                payload_type: pkt.payload_type,
                                            },
                                            &pkt,
                                        );
                                    }
                                }
                            }
                            Err(e) => callbacks.report_decode_error(&e),
                        }
                    }
                }
            }
        }
    }
}

/// Spawns the receive loops and the processing task for one UDP media in
/// play mode. Returns the per-format RTCP receivers (liveness witnesses)
/// and every spawned task.
fn spawn_udp_media(
    media_idx: usize,
    formats: Arc<HashMap<u8, Format>>,
    pair: &UdpPair,
    rtp_peer: Option<SocketAddr>,
    rtcp_peer: Option<SocketAddr>,
    config: &ClientConfig,
    callbacks: Arc<Callbacks>,
) -> (Vec<Arc<RtcpReceiver>>, Vec<tokio::task::JoinHandle<()>>) {
    let depth = (config.udp_read_buffer_size / config.max_packet_size).max(8);
    let (rtp_tx, mut rtp_rx) = mpsc::channel::<Bytes>(depth);
    let (rtcp_tx, mut rtcp_rx) = mpsc::channel::<Bytes>(depth);
    let mut tasks = vec![
        transport::spawn_recv_loop(pair.rtp.clone(), rtp_peer, config.max_packet_size, rtp_tx),
        transport::spawn_recv_loop(
            pair.rtcp.clone(),
            rtcp_peer,
            config.max_packet_size,
            rtcp_tx,
        ),
    ];

    // One receiver + reorderer per format.
    let mut receivers: HashMap<u8, Arc<RtcpReceiver>> = HashMap::new();
    let mut reorderers: HashMap<u8, Reorderer<rtp::Packet>> = HashMap::new();
    for (&pt, f) in formats.iter() {
        reorderers.insert(pt, Reorderer::new());
        if let Some(clock_rate) = NonZeroU32::new(f.clock_rate()) {
            let socket = pair.rtcp.clone();
            let receiver = RtcpReceiver::new(
                clock_rate,
                rand::thread_rng().gen(),
                config.udp_receiver_report_period,
                Box::new(move |data| {
                    if let Some(peer) = rtcp_peer {
                        let socket = socket.clone();
                        tokio::spawn(async move {
                            let _ = socket.send_to(&data, peer).await;
                        });
                    }
                }),
            );
            receivers.insert(pt, Arc::new(receiver));
        }
    }
    let receiver_list: Vec<Arc<RtcpReceiver>> = receivers.values().cloned().collect();

    tasks.push(tokio::spawn(async move {
        loop {
            tokio::select! {
                data = rtp_rx.recv() => {
                    let data = match data { Some(d) => d, None => return };
                    let pkt = match rtp::Packet::parse(data) {
                        Ok(p) => p,
                        Err(e) => {
                            callbacks.report_decode_error(&e);
                            continue;
                        }
                    };
                    if !formats.contains_key(&pkt.payload_type) {
                        continue;
                    }
                    let pt = pkt.payload_type;
                    let seq = pkt.sequence_number;
                    let (emitted, missing) = match reorderers.get_mut(&pt) {
                        Some(r) => r.process(seq, pkt),
                        None => continue,
                    };
                    if missing != 0 {
                        log::warn!("{} RTP packet(s) lost", missing);
                    }
                    for (i, mut pkt) in emitted.into_iter().enumerate() {
                        if i == 0 {
                            pkt.loss = missing.min(usize::from(u16::MAX)) as u16;
                        }
                        if let Some(r) = receivers.get(&pt) {
                            r.process_packet(&pkt);
                        }
                        if let Some(cb) = callbacks.rtp() {
                            cb(PacketContext { media_idx, payload_type: pt }, &pkt);
                        }
                    }
                }
                data = rtcp_rx.recv() => {
                    let data = match data { Some(d) => d, None => return };
                    match rtcp::Packet::parse_compound(&data) {
                        Ok(pkts) => {
                            for p in &pkts {
                                if let rtcp::Packet::SenderReport(sr) = p {
                                    for r in receivers.values() {
                                        r.process_sender_report(sr);
                                    }
                                }
                            }
                            for r in receivers.values() {
                                r.note_alive();
                            }
                            if let Some(cb) = callbacks.rtcp() {
                                cb(media_idx, &data);
                            }
                        }
                        Err(e) => {
                            callbacks.report_decode_error(&Error::MalformedMessage(e));
                        }
                    };
                }
            }
        }
    }));

    (receiver_list, tasks)
}
