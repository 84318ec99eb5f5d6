//! End-to-end tests against a live fake peer.
//!
//! Unlike the per-module unit tests, these run the whole stack — binder,
//! multiplexer, channel, dispatcher — against a real UNIX-datagram peer in a
//! background thread, covering the externally observable contract: lifecycle
//! hygiene, round-trip fidelity, timeout accounting, and event/reply
//! interleaving on one descriptor.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::channel::{Channel, ChannelOptions};
use crate::error::Error;
use crate::frame::{EventFrame, Frame};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Bind a fake peer socket and spawn a thread that answers each incoming
/// request with the scripted datagrams, in order, after `delay`.
///
/// The thread exits after serving `requests` requests.
fn spawn_peer(
    dir: &Path,
    responses: Vec<Vec<u8>>,
    delay: Duration,
    requests: usize,
) -> (PathBuf, thread::JoinHandle<()>) {
    let path = dir.join("peer.sock");
    let socket = std::os::unix::net::UnixDatagram::bind(&path).expect("bind fake peer");
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("peer read timeout");

    let handle = thread::spawn(move || {
        let mut buf = [0u8; 4096];
        for _ in 0..requests {
            let Ok((_, from)) = socket.recv_from(&mut buf) else {
                return;
            };
            let from = from.as_pathname().expect("client is bound").to_path_buf();
            thread::sleep(delay);
            for response in &responses {
                socket.send_to(response, &from).expect("peer reply");
            }
        }
    });
    (path, handle)
}

fn open_channel(dir: &Path, peer_path: &Path) -> Channel {
    let options = ChannelOptions {
        runtime_dir: dir.to_path_buf(),
        ..ChannelOptions::default()
    };
    Channel::open_with(peer_path, options).expect("open channel")
}

#[test]
fn ping_pong_round_trip() {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let (peer_path, peer) = spawn_peer(
        dir.path(),
        vec![b"PONG".to_vec()],
        Duration::from_millis(50),
        1,
    );

    let mut chan = open_channel(dir.path(), &peer_path);
    let reply = chan
        .request(b"PING", Duration::from_millis(200))
        .expect("request");
    assert_eq!(reply, b"PONG");
    assert!(chan.drain_events().is_empty(), "reply must not queue as event");

    peer.join().expect("peer thread");
}

#[test]
fn silent_peer_times_out_after_the_full_budget() {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    // Peer that reads the request but never answers.
    let (peer_path, peer) = spawn_peer(dir.path(), vec![], Duration::ZERO, 1);

    let mut chan = open_channel(dir.path(), &peer_path);
    let timeout = Duration::from_millis(200);
    let start = Instant::now();
    match chan.request(b"PING", timeout) {
        Err(Error::RequestTimeout { timeout: t }) => assert_eq!(t, timeout),
        other => panic!("expected RequestTimeout, got {other:?}"),
    }
    let elapsed = start.elapsed();
    assert!(elapsed >= timeout, "timed out early: {elapsed:?}");
    assert!(
        elapsed < Duration::from_secs(2),
        "timed out far too late: {elapsed:?}"
    );

    // Recoverable: the channel is usable again afterwards.
    assert!(!chan.is_closed());
    peer.join().expect("peer thread");
}

#[test]
fn events_before_the_reply_are_queued_in_order() {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let (peer_path, peer) = spawn_peer(
        dir.path(),
        vec![
            b"<3>CTRL-EVENT-X".to_vec(),
            b"<4>CTRL-EVENT-Y".to_vec(),
            b"OK".to_vec(),
        ],
        Duration::ZERO,
        1,
    );

    let mut chan = open_channel(dir.path(), &peer_path);
    let reply = chan
        .request(b"STATUS", Duration::from_millis(500))
        .expect("request");
    assert_eq!(reply, b"OK");

    let events = chan.drain_events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].as_bytes(), b"<3>CTRL-EVENT-X");
    assert_eq!(events[0].priority(), 3);
    assert_eq!(events[1].as_bytes(), b"<4>CTRL-EVENT-Y");
    assert!(chan.drain_events().is_empty(), "drain empties the queue");

    peer.join().expect("peer thread");
}

#[test]
fn attached_sink_sees_events_from_request_and_receive_paths() {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let peer_path = dir.path().join("peer.sock");
    let peer = std::os::unix::net::UnixDatagram::bind(&peer_path).expect("bind peer");
    peer.set_read_timeout(Some(Duration::from_secs(5)))
        .expect("peer read timeout");

    // Answer one request from a clone of the peer socket; the original stays
    // in this thread to emit the out-of-band event afterwards. A connected
    // datagram socket only accepts traffic from its connected peer, so both
    // sends must come from the same socket.
    let responder = peer.try_clone().expect("clone peer socket");
    let responder = thread::spawn(move || {
        let mut buf = [0u8; 4096];
        let (_, from) = responder.recv_from(&mut buf).expect("peer recv");
        let from = from.as_pathname().expect("client is bound").to_path_buf();
        responder
            .send_to(b"<3>DURING-REQUEST", &from)
            .expect("peer event");
        responder.send_to(b"OK", &from).expect("peer reply");
    });

    let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_in_sink = Arc::clone(&seen);

    let mut chan = open_channel(dir.path(), &peer_path);
    chan.attach_event_listener(move |ev: EventFrame| {
        seen_in_sink.lock().expect("sink mutex").push(ev.into_bytes());
    });

    let reply = chan
        .request(b"STATUS", Duration::from_millis(500))
        .expect("request");
    assert_eq!(reply, b"OK");
    responder.join().expect("responder thread");

    // Out-of-band event, observed through the standalone receive path.
    let local = chan.local_path().expect("open").to_path_buf();
    peer.send_to(b"<2>OUT-OF-BAND", &local).expect("send event");
    let got = chan.receive(Duration::from_millis(500)).expect("receive");
    assert!(got.is_none(), "sinked event is not returned to the caller");

    let seen = seen.lock().expect("sink mutex");
    assert_eq!(
        seen.as_slice(),
        &[b"<3>DURING-REQUEST".to_vec(), b"<2>OUT-OF-BAND".to_vec()]
    );
    assert_eq!(chan.queued_events(), 0);
}

#[test]
fn receive_without_sink_hands_the_event_to_the_caller() {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let peer_path = dir.path().join("peer.sock");
    let peer = std::os::unix::net::UnixDatagram::bind(&peer_path).expect("bind peer");

    let mut chan = open_channel(dir.path(), &peer_path);
    let local = chan.local_path().expect("open").to_path_buf();
    peer.send_to(b"<1>DIRECT", &local).expect("send event");

    match chan.receive(Duration::from_millis(500)).expect("receive") {
        Some(Frame::Event(ev)) => {
            assert_eq!(ev.priority(), 1);
            assert_eq!(ev.as_bytes(), b"<1>DIRECT");
        }
        other => panic!("expected the event frame, got {other:?}"),
    }
    // The caller consumed it; nothing queues.
    assert_eq!(chan.queued_events(), 0);

    // A stale reply outside a request cycle is returned as a reply frame.
    peer.send_to(b"LATE-REPLY", &local).expect("send stale reply");
    match chan.receive(Duration::from_millis(500)).expect("receive") {
        Some(Frame::Reply(bytes)) => assert_eq!(bytes, b"LATE-REPLY"),
        other => panic!("expected the stale reply, got {other:?}"),
    }
}

#[test]
fn open_then_close_leaves_no_residual_socket_node() {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let peer_path = dir.path().join("peer.sock");
    let _peer = std::os::unix::net::UnixDatagram::bind(&peer_path).expect("bind peer");

    let mut chan = open_channel(dir.path(), &peer_path);
    let local = chan.local_path().expect("open").to_path_buf();
    assert!(local.exists(), "local endpoint must exist while open");

    chan.close();
    assert!(!local.exists(), "close must unlink the local endpoint");

    // Drop-based cleanup too.
    let chan = open_channel(dir.path(), &peer_path);
    let local = chan.local_path().expect("open").to_path_buf();
    drop(chan);
    assert!(!local.exists(), "drop must unlink the local endpoint");
}

#[test]
fn consecutive_requests_reuse_the_channel() {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let (peer_path, peer) = spawn_peer(
        dir.path(),
        vec![b"OK".to_vec()],
        Duration::ZERO,
        3,
    );

    let mut chan = open_channel(dir.path(), &peer_path);
    for _ in 0..3 {
        let reply = chan
            .request(b"PING", Duration::from_millis(500))
            .expect("request");
        assert_eq!(reply, b"OK");
    }
    peer.join().expect("peer thread");
}
