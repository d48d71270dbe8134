use std::path::Path;
use std::time::Duration;

use lanroom_core::{
    Message, MessageKind, decode_file_payload, decode_frame, encode_file_payload, encode_frame,
};
use lanroom_host::{Host, HostConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

struct TestPeer {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl TestPeer {
    async fn connect(addr: &str) -> TestPeer {
        let stream = TcpStream::connect(addr).await.expect("connect to host");
        let (read_half, write_half) = stream.into_split();
        TestPeer {
            lines: BufReader::new(read_half).lines(),
            write: write_half,
        }
    }

    async fn join(addr: &str, nick: &str) -> TestPeer {
        let mut peer = TestPeer::connect(addr).await;
        peer.send(&Message::join(nick)).await;
        peer
    }

    async fn send(&mut self, message: &Message) {
        let frame = encode_frame(message).expect("encode frame");
        self.write
            .write_all(frame.as_bytes())
            .await
            .expect("send frame");
    }

    async fn send_raw(&mut self, line: &str) {
        self.write
            .write_all(line.as_bytes())
            .await
            .expect("send raw line");
    }

    async fn recv(&mut self, wait: Duration) -> Option<Message> {
        let line = timeout(wait, self.lines.next_line()).await.ok()?.ok()??;
        Some(decode_frame(&line).expect("decode frame"))
    }

    /// Next frame of the given kind, skipping everything else.
    async fn recv_kind(&mut self, kind: MessageKind, wait: Duration) -> Option<Message> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
            match self.recv(remaining).await {
                Some(message) if message.kind == kind => return Some(message),
                Some(_) => continue,
                None => return None,
            }
        }
    }

    async fn drain(&mut self) {
        while self.recv(Duration::from_millis(80)).await.is_some() {}
    }

    /// True once the host has closed this connection.
    async fn closed(&mut self, wait: Duration) -> bool {
        matches!(
            timeout(wait, self.lines.next_line()).await,
            Ok(Ok(None)) | Ok(Err(_))
        )
    }
}

async fn start_host(nick: &str, download_dir: &Path) -> (String, Host) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral host socket");
    let addr = listener.local_addr().expect("host local addr").to_string();
    let mut config = HostConfig::new(nick);
    config.download_dir = download_dir.to_owned();
    let host = Host::new(config);
    let server = host.clone();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (addr, host)
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..80 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

const QUIET: Duration = Duration::from_millis(300);
const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn chat_is_broadcast_to_everyone_but_the_sender_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _host) = start_host("alice", dir.path()).await;

    let mut bob = TestPeer::join(&addr, "bob").await;
    let mut carol = TestPeer::join(&addr, "carol").await;
    // Bob seeing carol's join notice proves both are registered.
    assert!(bob.recv_kind(MessageKind::System, WAIT).await.is_some());
    carol.drain().await;

    for text in ["one", "two", "three"] {
        bob.send(&Message::chat("bob", text)).await;
    }

    for expected in ["one", "two", "three"] {
        let message = carol
            .recv_kind(MessageKind::Chat, WAIT)
            .await
            .expect("carol receives chat");
        assert_eq!(message.nick, "bob");
        assert_eq!(message.text, expected);
    }
    assert!(
        bob.recv(QUIET).await.is_none(),
        "sender received its own chat broadcast"
    );
}

#[tokio::test]
async fn nick_change_is_reflected_in_the_user_list() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _host) = start_host("alice", dir.path()).await;

    let mut bob = TestPeer::join(&addr, "bob").await;
    let mut carol = TestPeer::join(&addr, "carol").await;
    bob.drain().await;

    bob.send(&Message::nick_change("bob", "bobby")).await;
    let notice = carol
        .recv_kind(MessageKind::System, WAIT)
        .await
        .expect("carol sees rename notice");
    assert_eq!(notice.text, "bob is now known as bobby");

    bob.send(&Message::new(MessageKind::UserListRequest)).await;
    let reply = bob
        .recv_kind(MessageKind::UserListReply, WAIT)
        .await
        .expect("user list reply");
    assert_eq!(reply.text, "alice (host), bobby, carol");
}

#[tokio::test]
async fn ping_gets_a_direct_pong() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _host) = start_host("alice", dir.path()).await;

    let mut bob = TestPeer::join(&addr, "bob").await;
    let mut carol = TestPeer::join(&addr, "carol").await;
    bob.drain().await;

    bob.send(&Message::new(MessageKind::Ping)).await;
    assert!(bob.recv_kind(MessageKind::Pong, WAIT).await.is_some());
    assert!(
        carol.recv_kind(MessageKind::Pong, QUIET).await.is_none(),
        "pong was broadcast instead of sent to the pinger"
    );
}

#[tokio::test]
async fn targeted_offer_and_accept_correlate_back_to_the_sender() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _host) = start_host("alice", dir.path()).await;

    let mut bob = TestPeer::join(&addr, "bob").await;
    let mut carol = TestPeer::join(&addr, "carol").await;
    bob.drain().await;
    carol.drain().await;

    bob.send(&Message::file_offer("bob", "notes.txt", "2.1KB", "carol"))
        .await;
    let offer = carol
        .recv_kind(MessageKind::FileOffer, WAIT)
        .await
        .expect("carol receives the offer");
    assert_eq!(offer.nick, "bob");
    assert_eq!(offer.text, "notes.txt");
    assert_eq!(offer.payload, "2.1KB");

    carol
        .send(&Message {
            kind: MessageKind::FileAccept,
            nick: "carol".to_owned(),
            text: "bob".to_owned(),
            ..Default::default()
        })
        .await;
    let accept = bob
        .recv_kind(MessageKind::FileAccept, WAIT)
        .await
        .expect("bob hears about the accept");
    assert_eq!(accept.nick, "carol");
    assert_eq!(accept.text, "notes.txt");

    // No unresolved offer remains; a second accept citing bob is
    // silently dropped.
    carol
        .send(&Message {
            kind: MessageKind::FileAccept,
            nick: "carol".to_owned(),
            text: "bob".to_owned(),
            ..Default::default()
        })
        .await;
    assert!(bob.recv(QUIET).await.is_none());
}

#[tokio::test]
async fn newer_offer_from_the_same_sender_overwrites_the_first() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _host) = start_host("alice", dir.path()).await;

    let mut bob = TestPeer::join(&addr, "bob").await;
    let mut carol = TestPeer::join(&addr, "carol").await;
    bob.drain().await;
    carol.drain().await;

    bob.send(&Message::file_offer("bob", "first.txt", "1B", "carol"))
        .await;
    bob.send(&Message::file_offer("bob", "second.txt", "1B", "carol"))
        .await;
    assert!(carol.recv_kind(MessageKind::FileOffer, WAIT).await.is_some());
    assert!(carol.recv_kind(MessageKind::FileOffer, WAIT).await.is_some());

    carol
        .send(&Message {
            kind: MessageKind::FileAccept,
            nick: "carol".to_owned(),
            text: "bob".to_owned(),
            ..Default::default()
        })
        .await;
    let accept = bob
        .recv_kind(MessageKind::FileAccept, WAIT)
        .await
        .expect("accept for the surviving offer");
    assert_eq!(accept.text, "second.txt");

    // The overwritten first offer must not be double-resolvable.
    carol
        .send(&Message {
            kind: MessageKind::FileReject,
            nick: "carol".to_owned(),
            text: "bob".to_owned(),
            ..Default::default()
        })
        .await;
    assert!(bob.recv(QUIET).await.is_none());
}

#[tokio::test]
async fn unicast_to_an_unknown_nick_is_a_silent_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _host) = start_host("alice", dir.path()).await;

    let mut bob = TestPeer::join(&addr, "bob").await;
    let mut carol = TestPeer::join(&addr, "carol").await;
    bob.drain().await;
    carol.drain().await;

    bob.send(&Message::file_data(
        "bob",
        "ghost.txt",
        encode_file_payload(b"boo"),
        "ghost",
    ))
    .await;
    assert!(carol.recv(QUIET).await.is_none());

    // No error came back and the connection is still healthy.
    bob.send(&Message::new(MessageKind::Ping)).await;
    assert!(bob.recv_kind(MessageKind::Pong, WAIT).await.is_some());
}

#[tokio::test]
async fn disconnect_removes_the_participant_and_announces_it() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _host) = start_host("alice", dir.path()).await;

    let bob = TestPeer::join(&addr, "bob").await;
    let mut carol = TestPeer::join(&addr, "carol").await;
    carol.drain().await;

    drop(bob);
    let notice = carol
        .recv_kind(MessageKind::System, WAIT)
        .await
        .expect("carol hears about the departure");
    assert_eq!(notice.text, "bob left");

    carol.send(&Message::new(MessageKind::UserListRequest)).await;
    let reply = carol
        .recv_kind(MessageKind::UserListReply, WAIT)
        .await
        .expect("user list reply");
    assert_eq!(reply.text, "alice (host), carol");
}

#[tokio::test]
async fn non_join_first_frame_closes_the_connection_silently() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _host) = start_host("alice", dir.path()).await;

    let mut carol = TestPeer::join(&addr, "carol").await;
    carol.drain().await;

    let mut stranger = TestPeer::connect(&addr).await;
    stranger.send(&Message::chat("stranger", "let me in")).await;
    assert!(stranger.closed(WAIT).await, "connection should be closed");

    // The stranger never existed as far as the room is concerned.
    assert!(carol.recv(QUIET).await.is_none());
}

#[tokio::test]
async fn malformed_frame_drops_only_the_offending_connection() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _host) = start_host("alice", dir.path()).await;

    let mut bob = TestPeer::join(&addr, "bob").await;
    let mut carol = TestPeer::join(&addr, "carol").await;
    bob.drain().await;
    carol.drain().await;

    bob.send_raw("{definitely not json\n").await;
    assert!(bob.closed(WAIT).await, "corrupt stream should be dropped");

    let notice = carol
        .recv_kind(MessageKind::System, WAIT)
        .await
        .expect("carol sees bob leave");
    assert_eq!(notice.text, "bob left");

    // Carol's session is untouched.
    carol.send(&Message::new(MessageKind::Ping)).await;
    assert!(carol.recv_kind(MessageKind::Pong, WAIT).await.is_some());
}

#[tokio::test]
async fn signal_relay_rewrites_the_sender_to_the_true_origin() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _host) = start_host("alice", dir.path()).await;

    let mut bob = TestPeer::join(&addr, "bob").await;
    let mut carol = TestPeer::join(&addr, "carol").await;
    bob.drain().await;
    carol.drain().await;

    bob.send(&Message::signal("mallory", "{\"sdp\":\"offer\"}", "carol"))
        .await;
    let signal = carol
        .recv_kind(MessageKind::SignalRelay, WAIT)
        .await
        .expect("carol receives the signal");
    assert_eq!(signal.nick, "bob", "origin must not be spoofable");
    assert_eq!(signal.payload, "{\"sdp\":\"offer\"}");
}

#[tokio::test]
async fn file_data_addressed_to_the_host_is_persisted_not_relayed() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, _host) = start_host("alice", dir.path()).await;

    let mut bob = TestPeer::join(&addr, "bob").await;
    let mut carol = TestPeer::join(&addr, "carol").await;
    bob.drain().await;
    carol.drain().await;

    bob.send(&Message::file_data(
        "bob",
        "../sneaky/report.txt",
        encode_file_payload(b"quarterly numbers"),
        "alice",
    ))
    .await;

    let saved = dir.path().join("report.txt");
    assert!(
        wait_for(|| saved.exists()).await,
        "host should persist the payload under its basename"
    );
    assert_eq!(std::fs::read(&saved).unwrap(), b"quarterly numbers");
    assert!(carol.recv(QUIET).await.is_none());
}

#[tokio::test]
async fn broadcast_offer_is_acceptable_by_the_host() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, host) = start_host("alice", dir.path()).await;

    let mut bob = TestPeer::join(&addr, "bob").await;
    let mut carol = TestPeer::join(&addr, "carol").await;
    bob.drain().await;
    carol.drain().await;

    bob.send(&Message::file_offer("bob", "notes.txt", "17B", ""))
        .await;
    assert!(carol.recv_kind(MessageKind::FileOffer, WAIT).await.is_some());

    let mut pending = None;
    for _ in 0..80 {
        pending = host.pending_offer().await;
        if pending.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let pending = pending.expect("broadcast offer should surface as host-local pending");
    assert_eq!(pending.sender_nick, "bob");
    assert_eq!(pending.filename, "notes.txt");

    assert!(host.accept_pending().await);
    let accept = bob
        .recv_kind(MessageKind::FileAccept, WAIT)
        .await
        .expect("bob hears the host accepted");
    assert_eq!(accept.nick, "alice");
    assert_eq!(accept.text, "notes.txt");

    // The host's accept resolved the shared entry too; carol's late
    // accept is dropped.
    carol
        .send(&Message {
            kind: MessageKind::FileAccept,
            nick: "carol".to_owned(),
            text: "bob".to_owned(),
            ..Default::default()
        })
        .await;
    assert!(bob.recv(QUIET).await.is_none());
}

#[tokio::test]
async fn host_offer_is_accepted_and_the_payload_follows_automatically() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, host) = start_host("alice", dir.path()).await;

    let offered = dir.path().join("notes.txt");
    std::fs::write(&offered, b"meeting at noon").unwrap();

    let mut bob = TestPeer::join(&addr, "bob").await;
    bob.drain().await;

    host.offer_file(&offered, "").await.expect("offer file");
    let offer = bob
        .recv_kind(MessageKind::FileOffer, WAIT)
        .await
        .expect("bob receives the host's offer");
    assert_eq!(offer.nick, "alice");
    assert_eq!(offer.text, "notes.txt");

    bob.send(&Message {
        kind: MessageKind::FileAccept,
        nick: "bob".to_owned(),
        text: "alice".to_owned(),
        ..Default::default()
    })
    .await;

    let data = bob
        .recv_kind(MessageKind::FileData, WAIT)
        .await
        .expect("payload follows the accept");
    assert_eq!(data.nick, "alice");
    assert_eq!(data.text, "notes.txt");
    assert_eq!(decode_file_payload(&data.payload).unwrap(), b"meeting at noon");

    // The offer is resolved; a repeat accept yields nothing.
    bob.send(&Message {
        kind: MessageKind::FileAccept,
        nick: "bob".to_owned(),
        text: "alice".to_owned(),
        ..Default::default()
    })
    .await;
    assert!(bob.recv(QUIET).await.is_none());
}

#[tokio::test]
async fn shutdown_broadcasts_the_closing_notice_then_disconnects() {
    let dir = tempfile::tempdir().unwrap();
    let (addr, host) = start_host("alice", dir.path()).await;

    let mut bob = TestPeer::join(&addr, "bob").await;
    let mut carol = TestPeer::join(&addr, "carol").await;
    bob.drain().await;
    carol.drain().await;

    host.shutdown();

    for peer in [&mut bob, &mut carol] {
        let notice = peer
            .recv_kind(MessageKind::System, WAIT)
            .await
            .expect("closing notice");
        assert_eq!(notice.text, "Room closed by host");
        assert!(peer.closed(WAIT).await, "connection should close");
    }
}
