// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error taxonomy shared by the client and the server.

/// An error in the RTSP engine.
///
/// Protocol and transport errors are fatal to the connection that produced
/// them (and, when one is attached, to its session); they never propagate
/// past the owning task. Session errors surface through handler callbacks
/// or the public operations that caused them.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    // Protocol.
    #[error("malformed RTSP message: {0}")]
    MalformedMessage(String),

    #[error("request has no usable CSeq header")]
    MissingCseq,

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("method {method} not valid in state {state}")]
    MethodNotValidInState {
        method: &'static str,
        state: &'static str,
    },

    #[error("session is linked to another connection")]
    LinkedToOtherConnection,

    #[error("bad interleaved frame: {0}")]
    BadInterleavedFrame(String),

    // Transport.
    #[error("unable to allocate a UDP port pair")]
    UdpPortAllocation,

    #[error("interleaved channel numbers exhausted")]
    ChannelExhaustion,

    #[error("write deadline exceeded")]
    WriteTimeout,

    #[error("read deadline exceeded")]
    ReadTimeout,

    #[error("I/O on the connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by peer")]
    ConnectionClosed,

    // Session.
    #[error("session timed out")]
    SessionTimedOut,

    #[error("operation {op} refused in state {state}")]
    InvalidClientState {
        op: &'static str,
        state: &'static str,
    },

    #[error("session not found")]
    SessionNotFound,

    // Auth.
    #[error("authentication challenge failed: {0}")]
    AuthChallenge(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    // Shutdown.
    #[error("terminated")]
    Terminated,

    /// The peer answered a request with an unexpected status code.
    #[error("{method} returned status {status}")]
    RequestFailed {
        method: &'static str,
        status: u16,
    },

    /// RTP or RTCP stream silence exceeded the configured timeout.
    #[error("no RTP or RTCP packets received recently")]
    StreamDead,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
