// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! One server-side control connection: reads requests (and, once a session
//! goes TCP-interleaved, binary frames), answers what it can locally, and
//! routes the rest to the session layer. All writes pass through the
//! connection's single drain task.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::conn::{self, Item, WriteQueue};
use crate::media::Media;
use crate::server::{
    base_response, ConnId, RequestInfo, ServerStream, SessionHandle, SessionMsg, SessionReply,
    SessionRequest, Shared, ToDispatcher,
};
use crate::{Error, Result};

pub(crate) async fn run_conn(
    conn_id: ConnId,
    socket: TcpStream,
    remote_addr: SocketAddr,
    shared: Arc<Shared>,
    dispatcher: mpsc::Sender<ToDispatcher>,
) {
    if let Some(cb) = &shared.handlers.on_conn_open {
        cb(remote_addr);
    }

    let result = run_conn_inner(conn_id, socket, remote_addr, &shared, dispatcher).await;

    match &result {
        Ok(()) | Err(Error::ConnectionClosed) => {
            log::debug!("connection {} closed", remote_addr)
        }
        Err(e) => log::debug!("connection {} failed: {}", remote_addr, e),
    }
    if let Some(cb) = &shared.handlers.on_conn_close {
        cb(remote_addr);
    }
}

async fn run_conn_inner(
    conn_id: ConnId,
    socket: TcpStream,
    remote_addr: SocketAddr,
    shared: &Arc<Shared>,
    dispatcher: mpsc::Sender<ToDispatcher>,
) -> Result<()> {
    let stream: Box<dyn conn::AsyncStream> = match &shared.config.tls {
        Some(acceptor) => Box::new(acceptor.accept(socket).await?),
        None => Box::new(socket),
    };
    let framed = conn::framed(stream);
    let (sink, mut read_half) = framed.split();
    let (queue, queue_rx) = WriteQueue::new(shared.config.write_queue_size);
    let write_timeout = shared.config.write_timeout;
    let writer = tokio::spawn(conn::drain_writes(sink, queue_rx, write_timeout));

    let mut session: Option<SessionHandle> = None;

    let result = loop {
        let item = match read_half.next().await {
            None => break Err(Error::ConnectionClosed),
            Some(Err(e)) => break Err(e),
            Some(Ok(item)) => item,
        };
        match item {
            Item::Msg(rtsp_types::Message::Request(req)) => {
                match handle_request(
                    conn_id,
                    remote_addr,
                    req,
                    &queue,
                    &mut session,
                    shared,
                    &dispatcher,
                )
                .await
                {
                    Ok(()) => {}
                    Err(e) => break Err(e),
                }
            }
            Item::Msg(rtsp_types::Message::Response(_)) => {
                // Servers don't issue requests, so nothing is expected back.
                log::debug!("ignoring unsolicited response from {}", remote_addr);
            }
            Item::Msg(rtsp_types::Message::Data(_)) => {}
            Item::Frame { channel, payload } => match &session {
                Some(handle) => {
                    // Best effort: a full session queue sheds inbound media.
                    let _ = handle.tx.try_send(SessionMsg::Frame(channel, payload));
                }
                None => {
                    break Err(Error::BadInterleavedFrame(
                        "interleaved frame outside a session".to_owned(),
                    ));
                }
            },
        }
    };

    if let Some(handle) = &session {
        let _ = handle.tx.try_send(SessionMsg::ConnGone(conn_id));
    }
    writer.abort();
    result
}

/// Handles one request: answers connection-level methods directly and
/// routes session-level ones. An `Err` is fatal to the connection.
async fn handle_request(
    conn_id: ConnId,
    remote_addr: SocketAddr,
    req: rtsp_types::Request<Vec<u8>>,
    queue: &WriteQueue,
    session: &mut Option<SessionHandle>,
    shared: &Arc<Shared>,
    dispatcher: &mpsc::Sender<ToDispatcher>,
) -> Result<()> {
    let cseq = match conn::parse_cseq(req.header(&rtsp_types::headers::CSEQ)) {
        Some(c) => c,
        None => {
            let resp = base_response(rtsp_types::StatusCode::BadRequest, None).build(Vec::new());
            let _ = queue
                .send_control(Item::Msg(rtsp_types::Message::Response(resp)))
                .await;
            return Err(Error::MissingCseq);
        }
    };

    let session_id = match req.header(&rtsp_types::headers::SESSION) {
        Some(v) => match crate::headers::Session::parse(v.as_str()) {
            Ok(s) => Some(s.id),
            Err(e) => {
                let resp =
                    base_response(crate::server::status_for(&e), Some(cseq)).build(Vec::new());
                let _ = queue
                    .send_control(Item::Msg(rtsp_types::Message::Response(resp)))
                    .await;
                return Err(e);
            }
        },
        None => None,
    };

    // A connection can't speak for two sessions at once.
    if let (Some(linked), Some(id)) = (session.as_ref(), session_id.as_deref()) {
        if linked.secret_id != id {
            let resp =
                base_response(rtsp_types::StatusCode::BadRequest, Some(cseq)).build(Vec::new());
            queue
                .send_control(Item::Msg(rtsp_types::Message::Response(resp)))
                .await?;
            return Err(Error::LinkedToOtherConnection);
        }
    }

    let method = req.method().clone();
    use rtsp_types::Method;
    let needs_session = match method {
        Method::Options => session_id.is_some() || session.is_some(),
        Method::Describe => false,
        Method::Announce | Method::Setup => true,
        Method::Play | Method::Record | Method::Pause | Method::Teardown => true,
        Method::GetParameter | Method::SetParameter => session_id.is_some() || session.is_some(),
        _ => false,
    };

    if !needs_session {
        let resp = handle_conn_request(&method, &req, cseq, remote_addr, shared);
        queue
            .send_control(Item::Msg(rtsp_types::Message::Response(resp)))
            .await?;
        return Ok(());
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    let sreq = SessionRequest {
        conn_id,
        conn_queue: queue.clone(),
        remote_addr,
        req,
        cseq,
        session_id: session_id.clone(),
        reply: reply_tx,
    };
    if let Some(linked) = session.as_ref() {
        if linked.tx.send(SessionMsg::Request(sreq)).await.is_err() {
            // Session died (timeout or teardown race); it's gone.
            *session = None;
            let resp = base_response(rtsp_types::StatusCode::SessionNotFound, Some(cseq))
                .build(Vec::new());
            queue
                .send_control(Item::Msg(rtsp_types::Message::Response(resp)))
                .await?;
            return Ok(());
        }
    } else if dispatcher
        .send(ToDispatcher::Request(sreq))
        .await
        .is_err()
    {
        let resp =
            base_response(rtsp_types::StatusCode::InternalServerError, Some(cseq)).build(Vec::new());
        queue
            .send_control(Item::Msg(rtsp_types::Message::Response(resp)))
            .await?;
        return Err(Error::Terminated);
    }

    let SessionReply {
        response,
        session: new_session,
        destroyed,
    } = match reply_rx.await {
        Ok(r) => r,
        Err(_) => {
            // The session dissolved without answering; the peer retries.
            let resp = base_response(rtsp_types::StatusCode::SessionNotFound, Some(cseq))
                .build(Vec::new());
            *session = None;
            queue
                .send_control(Item::Msg(rtsp_types::Message::Response(resp)))
                .await?;
            return Ok(());
        }
    };
    if destroyed {
        *session = None;
    } else if let Some(s) = new_session {
        *session = Some(s);
    }
    queue
        .send_control(Item::Msg(rtsp_types::Message::Response(response)))
        .await?;
    Ok(())
}

/// Methods a connection answers without a session.
fn handle_conn_request(
    method: &rtsp_types::Method,
    req: &rtsp_types::Request<Vec<u8>>,
    cseq: u32,
    remote_addr: SocketAddr,
    shared: &Arc<Shared>,
) -> rtsp_types::Response<Vec<u8>> {
    use rtsp_types::Method;
    match method {
        Method::Options => base_response(rtsp_types::StatusCode::Ok, Some(cseq))
            .header(
                rtsp_types::headers::PUBLIC,
                shared.handlers.public_methods(),
            )
            .build(Vec::new()),
        Method::Describe => handle_describe(req, cseq, remote_addr, shared),
        Method::GetParameter => match (&shared.handlers.on_get_parameter, request_info(req, remote_addr)) {
            (Some(h), Some(info)) => match h(&info, req.body()) {
                Ok(body) => base_response(rtsp_types::StatusCode::Ok, Some(cseq)).build(body),
                Err(e) => handler_error_response(e, cseq),
            },
            // Parameter-less GET_PARAMETER doubles as a keepalive ping.
            _ => base_response(rtsp_types::StatusCode::Ok, Some(cseq)).build(Vec::new()),
        },
        Method::SetParameter => match (&shared.handlers.on_set_parameter, request_info(req, remote_addr)) {
            (Some(h), Some(info)) => match h(&info, req.body()) {
                Ok(body) => base_response(rtsp_types::StatusCode::Ok, Some(cseq)).build(body),
                Err(e) => handler_error_response(e, cseq),
            },
            _ => base_response(rtsp_types::StatusCode::NotImplemented, Some(cseq))
                .build(Vec::new()),
        },
        _ => base_response(rtsp_types::StatusCode::NotImplemented, Some(cseq)).build(Vec::new()),
    }
}

pub(crate) fn request_info(
    req: &rtsp_types::Request<Vec<u8>>,
    remote_addr: SocketAddr,
) -> Option<RequestInfo> {
    let uri = req.request_uri()?;
    Some(RequestInfo {
        path: uri.path().to_owned(),
        query: uri.query().unwrap_or("").to_owned(),
        authorization: req
            .header(&rtsp_types::headers::AUTHORIZATION)
            .map(|v| v.as_str().to_owned()),
        remote_addr,
    })
}

pub(crate) fn handler_error_response(
    e: crate::server::HandlerError,
    cseq: u32,
) -> rtsp_types::Response<Vec<u8>> {
    use crate::server::HandlerError;
    match e {
        HandlerError::Unauthorized(challenges) => {
            let mut b = base_response(rtsp_types::StatusCode::Unauthorized, Some(cseq));
            b = b.header(
                rtsp_types::headers::WWW_AUTHENTICATE,
                challenges.join(", "),
            );
            b.build(Vec::new())
        }
        HandlerError::NotFound => {
            base_response(rtsp_types::StatusCode::NotFound, Some(cseq)).build(Vec::new())
        }
        HandlerError::BadRequest(reason) => {
            log::debug!("refusing request: {}", reason);
            base_response(rtsp_types::StatusCode::BadRequest, Some(cseq)).build(Vec::new())
        }
    }
}

fn handle_describe(
    req: &rtsp_types::Request<Vec<u8>>,
    cseq: u32,
    remote_addr: SocketAddr,
    shared: &Arc<Shared>,
) -> rtsp_types::Response<Vec<u8>> {
    let handler = match &shared.handlers.on_describe {
        Some(h) => h,
        None => {
            return base_response(rtsp_types::StatusCode::NotImplemented, Some(cseq))
                .build(Vec::new());
        }
    };
    let (info, uri) = match (request_info(req, remote_addr), req.request_uri()) {
        (Some(i), Some(u)) => (i, u),
        _ => {
            return base_response(rtsp_types::StatusCode::BadRequest, Some(cseq))
                .build(Vec::new());
        }
    };
    let stream = match handler(&info) {
        Ok(s) => s,
        Err(e) => return handler_error_response(e, cseq),
    };

    let mut content_base = uri.as_str().to_owned();
    if !content_base.ends_with('/') {
        content_base.push('/');
    }
    let body = sdp_for_stream(&stream, &content_base);
    base_response(rtsp_types::StatusCode::Ok, Some(cseq))
        .header(rtsp_types::headers::CONTENT_BASE, content_base)
        .header(
            rtsp_types::headers::CONTENT_TYPE,
            "application/sdp".to_owned(),
        )
        .build(body.into_bytes())
}

/// Serializes a stream's medias with absolute control URLs, which keeps
/// GStreamer's rtspsrc happy (it mis-joins relative controls onto URLs
/// with queries).
pub(crate) fn sdp_for_stream(stream: &Arc<ServerStream>, content_base: &str) -> String {
    let medias: Vec<Media> = stream
        .medias()
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let mut m = m.clone();
            m.control = format!("{}trackID={}", content_base, i);
            m
        })
        .collect();
    let origin = Url::parse(content_base)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
        .unwrap_or_else(|| "0.0.0.0".to_owned());
    crate::media::marshal_sdp(&medias, &origin)
}
