use crate::*;

use tether_services::SEND_CLOSE_REASON;

fn close_code_of(frame: &Option<CloseFrame>) -> Option<u16> {
    frame.as_ref().map(|f| u16::from(f.code))
}

/// Inbound peer with an id: validated, opened, and addressable both ways.
#[test]
fn test_server_inbound_lifecycle() {
    let rt = peer_runtime();
    let server = RunningServer::start();

    let (mut peer, response) = dial_peer(&rt, &server.url("?id=alice")).expect("handshake");
    let banner = response
        .headers()
        .get("server")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(banner.starts_with("tether/"), "banner: {banner}");

    wait_until("open", || server.state("alice") == Some(ConnectionState::Open));

    send_text(&rt, &mut peer, "hello server");
    wait_until("message", || {
        server.endpoint.describe("alice").unwrap().received() == vec!["hello server"]
    });

    server.endpoint.send_data("alice", "hello peer").expect("send_data");
    match next_frame(&rt, &mut peer) {
        Some(Message::Text(text)) => assert_eq!(text.as_str(), "hello peer"),
        other => panic!("expected text frame, got {other:?}"),
    }

    let snap = server.endpoint.describe("alice").unwrap();
    assert_eq!(snap.uri, "/?id=alice");
    assert_eq!(snap.sent(), vec!["hello peer"]);
}

/// No query string → refused at validation, no record, registry unchanged.
#[test]
fn test_server_rejects_missing_id() {
    let rt = peer_runtime();
    let server = RunningServer::start();
    let before = server.endpoint.connection_count();

    for query in ["", "?room=1", "?id="] {
        let err = dial_peer(&rt, &server.url(query)).expect_err("upgrade should be refused");
        println!("refused {query:?}: {err}");
    }
    assert_eq!(server.endpoint.connection_count(), before);
}

#[test]
fn test_server_rejects_duplicate_live_id() {
    let rt = peer_runtime();
    let server = RunningServer::start();

    let (_first, _) = dial_peer(&rt, &server.url("?id=bob")).expect("first handshake");
    wait_until("open", || server.state("bob") == Some(ConnectionState::Open));

    assert!(dial_peer(&rt, &server.url("?id=bob")).is_err());
    assert_eq!(server.endpoint.connection_count(), 1);
    assert_eq!(server.state("bob"), Some(ConnectionState::Open));
}

/// send_close evicts immediately; the peer sees a normal close.
#[test]
fn test_server_send_close_evicts() {
    let rt = peer_runtime();
    let server = RunningServer::start();

    let (mut peer, _) = dial_peer(&rt, &server.url("?id=carol")).unwrap();
    wait_until("open", || server.state("carol") == Some(ConnectionState::Open));

    server.endpoint.send_close("carol").expect("send_close");
    assert!(server.endpoint.describe("carol").is_none());

    let frame = expect_close(&rt, &mut peer);
    assert_eq!(close_code_of(&frame), Some(1000));
    assert_eq!(frame.unwrap().reason.as_str(), SEND_CLOSE_REASON);

    assert!(server
        .endpoint
        .send_close("carol")
        .unwrap_err()
        .is_unknown_connection());
}

/// A peer that went away frees its id for the next peer.
#[test]
fn test_server_reclaims_closed_id() {
    let rt = peer_runtime();
    let server = RunningServer::start();

    let (mut first, _) = dial_peer(&rt, &server.url("?id=dave")).unwrap();
    wait_until("open", || server.state("dave") == Some(ConnectionState::Open));

    let frame = CloseFrame {
        code: CloseCode::Away,
        reason: "leaving".into(),
    };
    rt.block_on(first.close(Some(frame))).expect("peer close");
    wait_until("closed", || server.state("dave") == Some(ConnectionState::Closed));
    let detail = server.endpoint.describe("dave").unwrap().detail.unwrap();
    assert_eq!(detail, "close code: 1001 (Going away), close reason: leaving");

    let (_second, _) = dial_peer(&rt, &server.url("?id=dave")).expect("reclaimed id");
    wait_until("reopened", || server.state("dave") == Some(ConnectionState::Open));
}

/// stop closes every peer with the shutdown status and run() returns.
#[test]
fn test_server_stop_closes_peers() {
    let rt = peer_runtime();
    let mut server = RunningServer::start();

    let (mut a, _) = dial_peer(&rt, &server.url("?id=a")).unwrap();
    let (mut b, _) = dial_peer(&rt, &server.url("?id=b")).unwrap();
    wait_until("open", || {
        server.state("a") == Some(ConnectionState::Open)
            && server.state("b") == Some(ConnectionState::Open)
    });

    server.endpoint.stop();
    for peer in [&mut a, &mut b] {
        let frame = expect_close(&rt, peer);
        assert_eq!(close_code_of(&frame), Some(1000));
        assert_eq!(frame.unwrap().reason.as_str(), "Terminating connection...");
    }

    server.stop_and_join();
    assert_eq!(server.state("a"), Some(ConnectionState::Closed));
    assert_eq!(server.state("b"), Some(ConnectionState::Closed));

    // Nothing is listening any more.
    assert!(dial_peer(&rt, &server.url("?id=late")).is_err());
}
