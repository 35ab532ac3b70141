// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Server behavior over raw TCP connections speaking literal RTSP text.

use std::sync::Arc;
use std::time::Duration;

use smallvec::smallvec;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use fovea::format::Format;
use fovea::media::{Media, MediaType};
use fovea::server::{Server, ServerConfig, ServerHandlers, ServerStream};

fn h264_media() -> Media {
    Media {
        media_type: MediaType::Video,
        direction: None,
        control: String::new(),
        formats: smallvec![Format::unmarshal(
            "video",
            96,
            Some("H264/90000"),
            Some("packetization-mode=1"),
        )
        .unwrap()],
    }
}

fn play_handlers(stream: Arc<ServerStream>) -> ServerHandlers {
    let stream2 = stream.clone();
    ServerHandlers {
        on_describe: Some(Box::new(move |_| Ok(stream.clone()))),
        on_setup: Some(Box::new(move |_| Ok(Some(stream2.clone())))),
        ..ServerHandlers::default()
    }
}

async fn start_server(config: ServerConfig, handlers: ServerHandlers) -> Server {
    Server::bind("127.0.0.1:0", config, handlers)
        .await
        .unwrap()
}

/// A raw RTSP control connection for tests.
struct RawConn {
    stream: TcpStream,
    buf: Vec<u8>,
}

struct RawResponse {
    status: u16,
    headers: Vec<(String, String)>,
    #[allow(dead_code)]
    body: Vec<u8>,
}

impl RawResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl RawConn {
    async fn connect(server: &Server) -> RawConn {
        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        RawConn {
            stream,
            buf: Vec::new(),
        }
    }

    async fn send(&mut self, text: &str) {
        self.stream.write_all(text.as_bytes()).await.unwrap();
    }

    async fn roundtrip(&mut self, text: &str) -> RawResponse {
        self.send(text).await;
        self.read_response().await
    }

    async fn read_response(&mut self) -> RawResponse {
        let header_end = loop {
            if let Some(i) = find_blank_line(&self.buf) {
                break i;
            }
            let mut chunk = [0u8; 4096];
            let n = tokio::time::timeout(
                Duration::from_secs(5),
                self.stream.read(&mut chunk),
            )
            .await
            .expect("response timeout")
            .unwrap();
            assert!(n > 0, "connection closed mid-response");
            self.buf.extend_from_slice(&chunk[..n]);
        };
        let head = String::from_utf8(self.buf[..header_end].to_vec()).unwrap();
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap();
        let status: u16 = status_line.split(' ').nth(1).unwrap().parse().unwrap();
        let headers: Vec<(String, String)> = lines
            .filter_map(|l| {
                let i = l.find(':')?;
                Some((l[..i].trim().to_owned(), l[i + 1..].trim().to_owned()))
            })
            .collect();
        let content_length: usize = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
            .map(|(_, v)| v.parse().unwrap())
            .unwrap_or(0);
        let body_start = header_end + 4;
        while self.buf.len() < body_start + content_length {
            let mut chunk = [0u8; 4096];
            let n = tokio::time::timeout(
                Duration::from_secs(5),
                self.stream.read(&mut chunk),
            )
            .await
            .expect("body timeout")
            .unwrap();
            assert!(n > 0, "connection closed mid-body");
            self.buf.extend_from_slice(&chunk[..n]);
        }
        let body = self.buf[body_start..body_start + content_length].to_vec();
        self.buf.drain(..body_start + content_length);
        RawResponse {
            status,
            headers,
            body,
        }
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn session_id(resp: &RawResponse) -> String {
    resp.header("Session")
        .expect("response has no Session header")
        .split(';')
        .next()
        .unwrap()
        .to_owned()
}

#[tokio::test]
async fn options_echoes_cseq_and_lists_methods() {
    let server = start_server(
        ServerConfig::default(),
        play_handlers(ServerStream::new(vec![h264_media()])),
    )
    .await;
    let mut conn = RawConn::connect(&server).await;
    let resp = conn
        .roundtrip("OPTIONS rtsp://127.0.0.1/cam RTSP/1.0\r\nCSeq: 7\r\n\r\n")
        .await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("CSeq"), Some("7"));
    let public = resp.header("Public").unwrap();
    assert!(public.contains("DESCRIBE"));
    assert!(public.contains("SETUP"));
    assert!(public.contains("TEARDOWN"));
    // No publishing handlers installed.
    assert!(!public.contains("ANNOUNCE"));
    assert!(resp.header("Server").is_some());
}

#[tokio::test]
async fn missing_cseq_is_rejected() {
    let server = start_server(
        ServerConfig::default(),
        play_handlers(ServerStream::new(vec![h264_media()])),
    )
    .await;
    let mut conn = RawConn::connect(&server).await;
    let resp = conn
        .roundtrip("OPTIONS rtsp://127.0.0.1/cam RTSP/1.0\r\n\r\n")
        .await;
    assert_eq!(resp.status, 400);
}

#[tokio::test]
async fn describe_serves_sdp_with_content_base() {
    let server = start_server(
        ServerConfig::default(),
        play_handlers(ServerStream::new(vec![h264_media()])),
    )
    .await;
    let mut conn = RawConn::connect(&server).await;
    let resp = conn
        .roundtrip("DESCRIBE rtsp://127.0.0.1/cam RTSP/1.0\r\nCSeq: 1\r\nAccept: application/sdp\r\n\r\n")
        .await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("Content-Type"), Some("application/sdp"));
    assert!(resp.header("Content-Base").unwrap().ends_with('/'));
    let body = String::from_utf8(resp.body.clone()).unwrap();
    assert!(body.contains("H264/90000"), "sdp body: {}", body);
    assert!(body.contains("trackID=0"));
}

#[tokio::test]
async fn describe_without_handler_is_not_implemented() {
    let server = start_server(ServerConfig::default(), ServerHandlers::default()).await;
    let mut conn = RawConn::connect(&server).await;
    let resp = conn
        .roundtrip("DESCRIBE rtsp://127.0.0.1/cam RTSP/1.0\r\nCSeq: 1\r\n\r\n")
        .await;
    assert_eq!(resp.status, 501);
}

#[tokio::test]
async fn setup_play_state_machine() {
    let server = start_server(
        ServerConfig::default(),
        play_handlers(ServerStream::new(vec![h264_media()])),
    )
    .await;
    let mut conn = RawConn::connect(&server).await;

    // PLAY with no session at all.
    let resp = conn
        .roundtrip("PLAY rtsp://127.0.0.1/cam/ RTSP/1.0\r\nCSeq: 1\r\n\r\n")
        .await;
    assert_eq!(resp.status, 454);

    let resp = conn
        .roundtrip(
            "SETUP rtsp://127.0.0.1/cam/trackID=0 RTSP/1.0\r\nCSeq: 2\r\n\
             Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
        )
        .await;
    assert_eq!(resp.status, 200);
    let transport = resp.header("Transport").unwrap();
    assert!(transport.contains("interleaved=0-1"), "{}", transport);
    let sid = session_id(&resp);

    // RECORD is not valid in PrePlay (and leaves the state intact).
    let resp = conn
        .roundtrip(&format!(
            "RECORD rtsp://127.0.0.1/cam/ RTSP/1.0\r\nCSeq: 3\r\nSession: {}\r\n\r\n",
            sid
        ))
        .await;
    assert_eq!(resp.status, 455);

    let resp = conn
        .roundtrip(&format!(
            "PLAY rtsp://127.0.0.1/cam/ RTSP/1.0\r\nCSeq: 4\r\nSession: {}\r\n\r\n",
            sid
        ))
        .await;
    assert_eq!(resp.status, 200);

    let resp = conn
        .roundtrip(&format!(
            "TEARDOWN rtsp://127.0.0.1/cam/ RTSP/1.0\r\nCSeq: 5\r\nSession: {}\r\n\r\n",
            sid
        ))
        .await;
    assert_eq!(resp.status, 200);

    // The session is gone afterwards.
    let resp = conn
        .roundtrip(&format!(
            "PLAY rtsp://127.0.0.1/cam/ RTSP/1.0\r\nCSeq: 6\r\nSession: {}\r\n\r\n",
            sid
        ))
        .await;
    assert_eq!(resp.status, 454);
}

#[tokio::test]
async fn transport_mode_locked_by_first_setup() {
    let stream = ServerStream::new(vec![h264_media(), h264_media()]);
    let server = start_server(ServerConfig::default(), play_handlers(stream)).await;
    let mut conn = RawConn::connect(&server).await;

    let resp = conn
        .roundtrip(
            "SETUP rtsp://127.0.0.1/cam/trackID=0 RTSP/1.0\r\nCSeq: 1\r\n\
             Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
        )
        .await;
    assert_eq!(resp.status, 200);
    let sid = session_id(&resp);

    // Same session, different transport mode: 461.
    let resp = conn
        .roundtrip(&format!(
            "SETUP rtsp://127.0.0.1/cam/trackID=1 RTSP/1.0\r\nCSeq: 2\r\nSession: {}\r\n\
             Transport: RTP/AVP;unicast;client_port=30000-30001\r\n\r\n",
            sid
        ))
        .await;
    assert_eq!(resp.status, 461);

    // The matching mode still works.
    let resp = conn
        .roundtrip(&format!(
            "SETUP rtsp://127.0.0.1/cam/trackID=1 RTSP/1.0\r\nCSeq: 3\r\nSession: {}\r\n\
             Transport: RTP/AVP/TCP;unicast;interleaved=2-3\r\n\r\n",
            sid
        ))
        .await;
    assert_eq!(resp.status, 200);
}

#[tokio::test]
async fn second_connection_cannot_steal_playing_session() {
    let server = start_server(
        ServerConfig::default(),
        play_handlers(ServerStream::new(vec![h264_media()])),
    )
    .await;
    let mut conn1 = RawConn::connect(&server).await;
    let resp = conn1
        .roundtrip(
            "SETUP rtsp://127.0.0.1/cam/trackID=0 RTSP/1.0\r\nCSeq: 1\r\n\
             Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
        )
        .await;
    assert_eq!(resp.status, 200);
    let sid = session_id(&resp);
    let resp = conn1
        .roundtrip(&format!(
            "PLAY rtsp://127.0.0.1/cam/ RTSP/1.0\r\nCSeq: 2\r\nSession: {}\r\n\r\n",
            sid
        ))
        .await;
    assert_eq!(resp.status, 200);

    // The first connection owns the session now.
    let mut conn2 = RawConn::connect(&server).await;
    let resp = conn2
        .roundtrip(&format!(
            "OPTIONS rtsp://127.0.0.1/cam/ RTSP/1.0\r\nCSeq: 1\r\nSession: {}\r\n\r\n",
            sid
        ))
        .await;
    assert_eq!(resp.status, 400);

    // And still works from the owner.
    let resp = conn1
        .roundtrip(&format!(
            "OPTIONS rtsp://127.0.0.1/cam/ RTSP/1.0\r\nCSeq: 3\r\nSession: {}\r\n\r\n",
            sid
        ))
        .await;
    assert_eq!(resp.status, 200);
}

#[tokio::test]
async fn udp_session_expires_after_timeout() {
    let config = ServerConfig {
        session_timeout: Duration::from_secs(1),
        ..ServerConfig::default()
    };
    let server = start_server(config, play_handlers(ServerStream::new(vec![h264_media()]))).await;
    let mut conn = RawConn::connect(&server).await;
    let resp = conn
        .roundtrip(
            "SETUP rtsp://127.0.0.1/cam/trackID=0 RTSP/1.0\r\nCSeq: 1\r\n\
             Transport: RTP/AVP;unicast;client_port=30000-30001\r\n\r\n",
        )
        .await;
    assert_eq!(resp.status, 200);
    assert!(resp.header("Transport").unwrap().contains("server_port="));
    let sid = session_id(&resp);

    // Keepalives hold it open (P6)...
    tokio::time::sleep(Duration::from_millis(600)).await;
    let resp = conn
        .roundtrip(&format!(
            "OPTIONS rtsp://127.0.0.1/cam/ RTSP/1.0\r\nCSeq: 2\r\nSession: {}\r\n\r\n",
            sid
        ))
        .await;
    assert_eq!(resp.status, 200);

    // ...but silence past the advertised timeout destroys it.
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    let resp = conn
        .roundtrip(&format!(
            "OPTIONS rtsp://127.0.0.1/cam/ RTSP/1.0\r\nCSeq: 3\r\nSession: {}\r\n\r\n",
            sid
        ))
        .await;
    assert_eq!(resp.status, 454);
}

#[tokio::test]
async fn teardown_racing_close_is_harmless() {
    let server = start_server(
        ServerConfig::default(),
        play_handlers(ServerStream::new(vec![h264_media()])),
    )
    .await;
    let mut conn = RawConn::connect(&server).await;
    let resp = conn
        .roundtrip(
            "SETUP rtsp://127.0.0.1/cam/trackID=0 RTSP/1.0\r\nCSeq: 1\r\n\
             Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
        )
        .await;
    assert_eq!(resp.status, 200);
    let sid = session_id(&resp);

    // Fire TEARDOWN and slam the connection shut without reading.
    conn.send(&format!(
        "TEARDOWN rtsp://127.0.0.1/cam/ RTSP/1.0\r\nCSeq: 2\r\nSession: {}\r\n\r\n",
        sid
    ))
    .await;
    drop(conn);

    // The server is still healthy.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut conn2 = RawConn::connect(&server).await;
    let resp = conn2
        .roundtrip("OPTIONS rtsp://127.0.0.1/cam RTSP/1.0\r\nCSeq: 1\r\n\r\n")
        .await;
    assert_eq!(resp.status, 200);
}

#[tokio::test]
async fn get_parameter_is_always_answered() {
    let server = start_server(
        ServerConfig::default(),
        play_handlers(ServerStream::new(vec![h264_media()])),
    )
    .await;
    let mut conn = RawConn::connect(&server).await;
    let resp = conn
        .roundtrip("GET_PARAMETER rtsp://127.0.0.1/cam RTSP/1.0\r\nCSeq: 9\r\n\r\n")
        .await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("CSeq"), Some("9"));
}
