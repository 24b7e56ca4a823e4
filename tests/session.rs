//! Session-engine tests over an in-memory duplex: handshake symmetry,
//! request-id discipline, stream validation and teardown on malformed input.

use std::thread;

use pretty_assertions::assert_eq;
use readwrite::ReadWrite;

use edb::protocol::wire::Map;
use edb::protocol::{self, Data, Message, ProtocolError, PullHeader, ReplyBody, Response};
use edb::session::{Role, Session, SessionState};
use edb::{Client, ClientError};

type Duplex = ReadWrite<pipe::PipeReader, pipe::PipeWriter>;

/// Two cross-connected in-memory streams.
fn duplex_pair() -> (Duplex, Duplex) {
    let (read_a, write_a) = pipe::pipe();
    let (read_b, write_b) = pipe::pipe();
    (
        ReadWrite::new(read_a, write_b),
        ReadWrite::new(read_b, write_a),
    )
}

#[test_log::test]
fn handshake_symmetry_client_initiates() {
    let (near, far) = duplex_pair();

    let agent = thread::spawn(move || Session::establish(far, Role::Agent, false).unwrap());
    let client = Session::establish(near, Role::Client, true).unwrap();
    let agent = agent.join().unwrap();

    assert_eq!(client.state(), SessionState::Ready);
    assert_eq!(agent.state(), SessionState::Ready);
    assert_eq!(client.peer_version(), protocol::PROTOCOL_VERSION);
    assert_eq!(agent.peer_version(), protocol::PROTOCOL_VERSION);
}

#[test_log::test]
fn handshake_symmetry_agent_initiates() {
    let (near, far) = duplex_pair();

    let agent = thread::spawn(move || Session::establish(far, Role::Agent, true).unwrap());
    let client = Session::establish(near, Role::Client, false).unwrap();
    let agent = agent.join().unwrap();

    assert_eq!(client.state(), SessionState::Ready);
    assert_eq!(agent.state(), SessionState::Ready);
    assert_eq!(client.peer_version(), protocol::PROTOCOL_VERSION);
    assert_eq!(agent.peer_version(), protocol::PROTOCOL_VERSION);
}

#[test_log::test]
fn higher_peer_versions_are_compatible() {
    let (mut near, far) = duplex_pair();

    let peer = thread::spawn(move || {
        let mut session = Session::new(far, Role::Client);
        session.handshake(true).unwrap();
        session.peer_version()
    });

    // Fake acceptor advertising a future version.
    match protocol::read_message(&mut near).unwrap() {
        Message::Hello(h) => assert_eq!(h.version, protocol::PROTOCOL_VERSION),
        other => panic!("expected hello, got {other:?}"),
    }
    protocol::write_message(
        &mut near,
        &Message::HelloAck(protocol::Hello {
            version: 99,
            agent: true,
        }),
    )
    .unwrap();

    assert_eq!(peer.join().unwrap(), 99);
}

#[test_log::test]
fn request_ids_strictly_increase() {
    let (near, far) = duplex_pair();

    let responder = thread::spawn(move || {
        let mut session = Session::establish(far, Role::Agent, false).unwrap();
        while let Some(req) = session.recv_request().unwrap() {
            session
                .send_response(Response::success(req.id, Map::new()))
                .unwrap();
        }
    });

    let mut session = Session::establish(near, Role::Client, true).unwrap();
    let mut ids = Vec::new();
    for _ in 0..5 {
        let id = session.send_request("pwd", Map::new()).unwrap();
        let resp = session.recv_response().unwrap();
        assert_eq!(resp.id, id);
        ids.push(id);
    }
    drop(session);
    responder.join().unwrap();

    assert!(
        ids.windows(2).all(|w| w[0] < w[1]),
        "ids not strictly increasing: {ids:?}"
    );
}

#[test_log::test]
fn malformed_frame_closes_the_session() {
    let (near, mut far) = duplex_pair();

    let peer = thread::spawn(move || {
        match protocol::read_message(&mut far).unwrap() {
            Message::Hello(_) => {}
            other => panic!("expected hello, got {other:?}"),
        }
        protocol::write_message(
            &mut far,
            &Message::HelloAck(protocol::Hello {
                version: 1,
                agent: true,
            }),
        )
        .unwrap();

        // Swallow the request, answer with a payload whose first marker
        // byte is outside the supported subset.
        protocol::read_message(&mut far).unwrap();
        protocol::write_frame(&mut far, &[0xff]).unwrap();
        far
    });

    let mut client = Client::from_stream(near, true).unwrap();
    let err = client.pwd().unwrap_err();
    match err {
        ClientError::Protocol(
            ProtocolError::MalformedValue(_) | ProtocolError::MalformedMessage(_),
        ) => {}
        other => panic!("expected a malformed-payload error, got {other:?}"),
    }
    assert!(client.is_closed());

    let err = client.pwd().unwrap_err();
    assert!(
        matches!(err, ClientError::Protocol(ProtocolError::SessionClosed)),
        "expected SessionClosed, got {err:?}"
    );

    drop(peer.join().unwrap());
}

#[test_log::test]
fn data_streams_are_contiguous_and_terminated_once() {
    let (near, far) = duplex_pair();
    let payload = vec![0x41u8; 100_000];
    let expected = payload.clone();

    let server = thread::spawn(move || {
        let mut session = Session::establish(far, Role::Agent, false).unwrap();
        let req = session.recv_request().unwrap().unwrap();
        assert_eq!(req.cmd, "pull");
        session
            .send_response(Response::success(
                req.id,
                PullHeader {
                    size: payload.len() as u64,
                    mode: 0o644,
                }
                .to_map(),
            ))
            .unwrap();
        session
            .send_data_stream(req.id, &payload, &mut |_, _| {})
            .unwrap();
        // Keep the stream open until the client has read everything.
        let _ = session.recv_request();
    });

    let mut session = Session::establish(near, Role::Client, true).unwrap();
    let mut args = Map::new();
    args.insert("path", "/flash.bin");
    let id = session.send_request("pull", args).unwrap();
    let resp = session.recv_response().unwrap();
    assert!(resp.ok);
    let header = PullHeader::from_map(&resp.data).unwrap();
    assert_eq!(header.size, 100_000);

    // Drain the stream by hand to observe sequencing: 100 000 bytes in
    // 64 KiB chunks is exactly two frames, `done` only on the last.
    let mut received = Vec::new();
    let mut frames = Vec::new();
    let mut seq = 0;
    loop {
        let data = session.recv_stream_data(id, seq).unwrap();
        frames.push((data.seq, data.chunk.len(), data.done));
        received.extend_from_slice(&data.chunk);
        if data.done {
            break;
        }
        seq += 1;
    }
    drop(session);
    server.join().unwrap();

    assert_eq!(frames, vec![(0, 65536, false), (1, 34464, true)]);
    assert_eq!(received, expected);
}

#[test_log::test]
fn empty_keepalive_frames_are_legal_mid_stream() {
    let (near, mut far) = duplex_pair();

    let server = thread::spawn(move || {
        match protocol::read_message(&mut far).unwrap() {
            Message::Hello(_) => {}
            other => panic!("expected hello, got {other:?}"),
        }
        protocol::write_message(
            &mut far,
            &Message::HelloAck(protocol::Hello {
                version: 1,
                agent: true,
            }),
        )
        .unwrap();

        let id = match protocol::read_message(&mut far).unwrap() {
            Message::Request(r) => r.id,
            other => panic!("expected request, got {other:?}"),
        };
        let mut data = Map::new();
        data.insert("size", 5u64);
        data.insert("mode", 0o600u64);
        protocol::write_message(&mut far, &Message::Response(Response::success(id, data)))
            .unwrap();
        protocol::write_message(
            &mut far,
            &Message::Data(Data {
                id,
                seq: 0,
                chunk: Vec::new(),
                done: false,
            }),
        )
        .unwrap();
        protocol::write_message(
            &mut far,
            &Message::Data(Data {
                id,
                seq: 1,
                chunk: b"hello".to_vec(),
                done: true,
            }),
        )
        .unwrap();
        far
    });

    let mut client = Client::from_stream(near, true).unwrap();
    let mut progress = Vec::new();
    let (bytes, mode) = client
        .pull("/anything", |done, total| progress.push((done, total)))
        .unwrap();
    assert_eq!(bytes, b"hello");
    assert_eq!(mode, 0o600);
    assert_eq!(progress, vec![(0, 5), (5, 5)]);

    drop(server.join().unwrap());
}

#[test_log::test]
fn sequence_gaps_are_fatal() {
    let (near, mut far) = duplex_pair();

    let server = thread::spawn(move || {
        match protocol::read_message(&mut far).unwrap() {
            Message::Hello(_) => {}
            other => panic!("expected hello, got {other:?}"),
        }
        protocol::write_message(
            &mut far,
            &Message::HelloAck(protocol::Hello {
                version: 1,
                agent: true,
            }),
        )
        .unwrap();

        let id = match protocol::read_message(&mut far).unwrap() {
            Message::Request(r) => r.id,
            other => panic!("expected request, got {other:?}"),
        };
        let mut data = Map::new();
        data.insert("size", 200_000u64);
        data.insert("mode", 0o644u64);
        protocol::write_message(&mut far, &Message::Response(Response::success(id, data)))
            .unwrap();
        protocol::write_message(
            &mut far,
            &Message::Data(Data {
                id,
                seq: 0,
                chunk: vec![0u8; 65536],
                done: false,
            }),
        )
        .unwrap();
        // Frame 1 goes missing.
        protocol::write_message(
            &mut far,
            &Message::Data(Data {
                id,
                seq: 2,
                chunk: vec![0u8; 65536],
                done: false,
            }),
        )
        .unwrap();
        far
    });

    let mut client = Client::from_stream(near, true).unwrap();
    let err = client.pull("/x", |_, _| {}).unwrap_err();
    assert!(
        matches!(err, ClientError::Protocol(ProtocolError::Stream(_))),
        "expected a stream error, got {err:?}"
    );
    assert!(client.is_closed());

    drop(server.join().unwrap());
}

#[test_log::test]
fn unexpected_handshake_message_is_fatal() {
    let (near, mut far) = duplex_pair();

    let server = thread::spawn(move || {
        protocol::read_message(&mut far).unwrap();
        protocol::write_message(
            &mut far,
            &Message::Response(Response::failure(1, "not a handshake")),
        )
        .unwrap();
        far
    });

    let err = Session::establish(near, Role::Client, true).unwrap_err();
    assert!(
        matches!(err, ProtocolError::UnexpectedType { expected: "hello_ack", .. }),
        "got {err:?}"
    );

    drop(server.join().unwrap());
}

#[test_log::test]
fn command_failures_leave_the_session_usable() {
    let (near, far) = duplex_pair();

    let responder = thread::spawn(move || {
        let mut session = Session::establish(far, Role::Agent, false).unwrap();
        while let Some(req) = session.recv_request().unwrap() {
            let resp = if req.cmd == "cd" {
                Response::failure(req.id, "/gone: No such file or directory")
            } else {
                Response::success(req.id, Map::new())
            };
            session.send_response(resp).unwrap();
        }
    });

    let mut client = Client::from_stream(near, true).unwrap();
    let err = client.cd("/gone").unwrap_err();
    match err {
        ClientError::Command(msg) => assert!(msg.to_lowercase().contains("no such")),
        other => panic!("expected a command failure, got {other:?}"),
    }
    assert!(!client.is_closed());
    client.pwd().unwrap();

    drop(client);
    responder.join().unwrap();
}
