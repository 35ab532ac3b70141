// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client and server wired together in-process.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use smallvec::smallvec;
use url::Url;

use fovea::auth::{Credentials, Validator};
use fovea::client::{Client, ClientConfig};
use fovea::format::Format;
use fovea::headers::Protocol;
use fovea::media::{Media, MediaType};
use fovea::rtp;
use fovea::server::{
    HandlerError, Server, ServerConfig, ServerHandlers, ServerStream,
};
use fovea::Error;

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

fn url_for(server: &Server, path: &str) -> Url {
    Url::parse(&format!("rtsp://{}{}", server.local_addr(), path)).unwrap()
}

fn host_of(server: &Server) -> String {
    server.local_addr().to_string()
}

async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn describe_setup_play_over_tcp() {
    let stream = ServerStream::new(vec![h264_media()]);
    let server = Server::bind("127.0.0.1:0", ServerConfig::default(), play_handlers(stream.clone()))
        .await
        .unwrap();

    let mut client = Client::new(ClientConfig {
        transport: Some(Protocol::Tcp),
        ..ClientConfig::default()
    });
    let url = url_for(&server, "/cam");
    let received = Arc::new(Mutex::new(Vec::<u16>::new()));
    {
        let received = received.clone();
        client.on_packet_rtp(move |ctx, pkt| {
            assert_eq!(ctx.media_idx, 0);
            assert_eq!(ctx.payload_type, 96);
            received.lock().unwrap().push(pkt.sequence_number);
        });
    }

    client.start("rtsp", &host_of(&server)).await.unwrap();
    client.options(&url).await.unwrap();
    let medias = client.describe(&url).await.unwrap();
    assert_eq!(medias.len(), 1);
    assert_eq!(medias[0].media_type, MediaType::Video);
    client.setup(&medias[0], &url, None).await.unwrap();
    client.play(None).await.unwrap();

    wait_for(|| stream.reader_count() == 1, "reader subscription").await;
    for i in 0..10u16 {
        let pkt = rtp::Packet::new(96, 100 + i, 3_000 * u32::from(i), 0x4242, false, b"nal")
            .unwrap();
        stream.write_packet_rtp(0, &pkt).await.unwrap();
    }

    wait_for(
        || received.lock().unwrap().len() >= 10,
        "interleaved delivery",
    )
    .await;
    // TCP is lossless and ordered.
    let got = received.lock().unwrap().clone();
    assert_eq!(got, (100..110).collect::<Vec<u16>>());

    client.teardown().await.unwrap();
}

#[tokio::test]
async fn publish_then_play_over_udp() {
    // Publisher → server → subscriber, everything over UDP.
    let stream = ServerStream::new(vec![h264_media()]);
    let (republish_tx, mut republish_rx) =
        tokio::sync::mpsc::unbounded_channel::<rtp::Packet>();
    {
        let stream = stream.clone();
        tokio::spawn(async move {
            while let Some(pkt) = republish_rx.recv().await {
                let _ = stream.write_packet_rtp(0, &pkt).await;
            }
        });
    }
    let stream2 = stream.clone();
    let stream3 = stream.clone();
    let handlers = ServerHandlers {
        on_describe: Some(Box::new(move |_| Ok(stream2.clone()))),
        on_setup: Some(Box::new(move |_| Ok(Some(stream3.clone())))),
        on_announce: Some(Box::new(|_, medias| {
            if medias.is_empty() {
                return Err(HandlerError::BadRequest("no medias".to_owned()));
            }
            Ok(())
        })),
        on_packet_rtp: Some(Box::new(move |_, _, pkt| {
            let _ = republish_tx.send(pkt.clone());
        })),
        ..ServerHandlers::default()
    };
    let server = Server::bind("127.0.0.1:0", ServerConfig::default(), handlers)
        .await
        .unwrap();
    let url = url_for(&server, "/pub");

    // Publisher.
    let mut publisher = Client::new(ClientConfig::default());
    publisher.start("rtsp", &host_of(&server)).await.unwrap();
    let announced = vec![h264_media()];
    publisher.announce(&url, announced.clone()).await.unwrap();
    let setup_media = {
        // announce() assigns control attributes; mirror that here.
        let mut m = announced[0].clone();
        m.control = "trackID=0".to_owned();
        m
    };
    publisher.setup(&setup_media, &url, None).await.unwrap();
    publisher.record().await.unwrap();

    // Subscriber.
    let mut subscriber = Client::new(ClientConfig::default());
    let received = Arc::new(Mutex::new(Vec::<u16>::new()));
    {
        let received = received.clone();
        subscriber.on_packet_rtp(move |_, pkt| {
            received.lock().unwrap().push(pkt.sequence_number);
        });
    }
    subscriber.start("rtsp", &host_of(&server)).await.unwrap();
    let medias = subscriber.describe(&url).await.unwrap();
    assert_eq!(medias.len(), 1);
    subscriber.setup(&medias[0], &url, None).await.unwrap();
    subscriber.play(None).await.unwrap();
    wait_for(|| stream.reader_count() == 1, "subscriber registration").await;

    for i in 0..100u16 {
        let pkt = rtp::Packet::new(
            96,
            1_000 + i,
            3_000 * u32::from(i),
            0x7777,
            false,
            b"payload",
        )
        .unwrap();
        publisher.write_packet_rtp(0, &pkt).await.unwrap();
        // Loopback can still drop bursts; pace the writes slightly.
        if i % 10 == 9 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    wait_for(
        || received.lock().unwrap().len() >= 95,
        "at least 95 of 100 packets",
    )
    .await;
    let got = received.lock().unwrap().clone();
    // Reordered delivery is fine; going backwards is not.
    for pair in got.windows(2) {
        assert!(pair[1] > pair[0], "sequence went backwards: {:?}", pair);
    }

    subscriber.teardown().await.unwrap();
    publisher.teardown().await.unwrap();
}

/// A refusing server: 461 to any UDP SETUP, 200 to a TCP one. Exercises the
/// client's automatic interleaved fallback, then feeds it one frame.
#[tokio::test]
async fn setup_falls_back_to_tcp_interleaved() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let saw_udp_attempt = Arc::new(Mutex::new(false));
    let saw = saw_udp_attempt.clone();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        loop {
            // Requests here have no bodies; a blank line ends each one.
            let head_end = loop {
                if let Some(i) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break i + 4;
                }
                let mut chunk = [0u8; 4096];
                match sock.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            };
            let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
            buf.drain(..head_end);
            let cseq = head
                .lines()
                .find_map(|l| l.strip_prefix("CSeq: "))
                .unwrap_or("0")
                .to_owned();
            let reply = if head.starts_with("SETUP") && head.contains("client_port=") {
                *saw.lock().unwrap() = true;
                format!("RTSP/1.0 461 Unsupported Transport\r\nCSeq: {}\r\n\r\n", cseq)
            } else if head.starts_with("SETUP") && head.contains("interleaved=0-1") {
                format!(
                    "RTSP/1.0 200 OK\r\nCSeq: {}\r\nSession: 1234ABCD;timeout=60\r\n\
                     Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n",
                    cseq
                )
            } else if head.starts_with("PLAY") {
                let resp = format!(
                    "RTSP/1.0 200 OK\r\nCSeq: {}\r\nSession: 1234ABCD\r\n\r\n",
                    cseq
                );
                sock.write_all(resp.as_bytes()).await.unwrap();
                // Give the client a moment to wire its channel sinks.
                tokio::time::sleep(Duration::from_millis(200)).await;
                // One interleaved RTP frame on channel 0.
                let pkt = rtp::Packet::new(96, 555, 90_000, 0x99, true, b"x").unwrap();
                let mut frame = vec![b'$', 0];
                frame.extend_from_slice(&(pkt.raw().len() as u16).to_be_bytes());
                frame.extend_from_slice(pkt.raw());
                sock.write_all(&frame).await.unwrap();
                continue;
            } else {
                format!("RTSP/1.0 200 OK\r\nCSeq: {}\r\n\r\n", cseq)
            };
            sock.write_all(reply.as_bytes()).await.unwrap();
        }
    });

    let mut client = Client::new(ClientConfig::default());
    let received = Arc::new(Mutex::new(Vec::<u16>::new()));
    {
        let received = received.clone();
        client.on_packet_rtp(move |_, pkt| {
            received.lock().unwrap().push(pkt.sequence_number);
        });
    }
    client.start("rtsp", &addr.to_string()).await.unwrap();
    let url = Url::parse(&format!("rtsp://{}/cam", addr)).unwrap();
    let media = h264_media();
    client.setup(&media, &url, None).await.unwrap();
    assert!(*saw_udp_attempt.lock().unwrap(), "UDP was never attempted");
    client.play(None).await.unwrap();

    wait_for(
        || !received.lock().unwrap().is_empty(),
        "the interleaved frame",
    )
    .await;
    assert_eq!(*received.lock().unwrap(), vec![555u16]);
}

#[tokio::test]
async fn digest_auth_on_describe() {
    let validator = Arc::new(Validator::with_methods("user", "correct", false, true));
    let stream = ServerStream::new(vec![h264_media()]);
    let v = validator.clone();
    let handlers = ServerHandlers {
        on_describe: Some(Box::new(move |info| {
            let uri = format!("rtsp://fovea-test{}", info.path);
            match v.validate(info.authorization.as_deref(), "DESCRIBE", &uri) {
                Ok(()) => Ok(stream.clone()),
                Err(_) => Err(HandlerError::Unauthorized(v.challenges())),
            }
        })),
        ..ServerHandlers::default()
    };
    let server = Server::bind("127.0.0.1:0", ServerConfig::default(), handlers)
        .await
        .unwrap();

    // The connection goes to the real server address; the request URL's
    // authority is only hashed into the digest, so a stable one keeps the
    // validator's recomputation in sync.
    let url = Url::parse("rtsp://fovea-test/cam").unwrap();

    // Correct password: the 401 challenge is answered and DESCRIBE succeeds.
    let mut good = Client::new(ClientConfig {
        credentials: Some(Credentials {
            username: "user".to_owned(),
            password: "correct".to_owned(),
        }),
        ..ClientConfig::default()
    });
    good.start("rtsp", &host_of(&server)).await.unwrap();
    let medias = good.describe(&url).await.unwrap();
    assert_eq!(medias.len(), 1);

    // Wrong password: the retry also fails and the error surfaces.
    let mut bad = Client::new(ClientConfig {
        credentials: Some(Credentials {
            username: "user".to_owned(),
            password: "wrong".to_owned(),
        }),
        ..ClientConfig::default()
    });
    bad.start("rtsp", &host_of(&server)).await.unwrap();
    match bad.describe(&url).await {
        Err(Error::RequestFailed { status: 401, .. }) => {}
        other => panic!("expected 401 failure, got {:?}", other.map(|_| ())),
    }
}
