//! Agent behavior against a scripted peer over an in-memory stream.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dirsync::protocol::transport::{self, encode_frame};
use dirsync::protocol::{
    AdmissionCheck, Agent, AgentOptions, Message, MessageReader, Phase, Role, Transport,
    DEFAULT_MAX_FRAME,
};
use dirsync::ProtocolError;
use futures::FutureExt;
use tempfile::TempDir;
use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

const QUIET: Duration = Duration::from_millis(100);

struct Peer {
    tx: Transport,
    rx: MessageReader,
}

impl Peer {
    fn new(stream: DuplexStream) -> Self {
        let (tx, rx) = transport::split(stream, DEFAULT_MAX_FRAME, Duration::from_secs(5));
        Self { tx, rx }
    }

    async fn send(&self, message: Message) {
        self.tx.send_message(&message).await.unwrap();
    }

    async fn recv(&mut self) -> Option<Message> {
        timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("agent went silent")
            .unwrap()
    }

    async fn expect(&mut self, expected: Message) {
        assert_eq!(self.recv().await, Some(expected));
    }

    async fn expect_fail_and_close(&mut self) -> String {
        let Some(Message::Fail { error }) = self.recv().await else {
            panic!("expected FAIL");
        };
        assert_eq!(self.recv().await, None);
        error
    }

    async fn expect_silence(&mut self) {
        assert!(timeout(QUIET, self.rx.recv()).await.is_err());
    }

    /// Handshake initiated by the peer.
    async fn shake(&mut self) {
        self.send(Message::handshake()).await;
        self.expect(Message::Success).await;
        self.expect(Message::handshake()).await;
        self.send(Message::Success).await;
    }
}

fn options(role: Role) -> AgentOptions {
    AgentOptions {
        ack_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        ..AgentOptions::new(role)
    }
}

async fn shaken(role: Role, root: &Path) -> (Arc<Agent>, Peer) {
    let (ours, theirs) = duplex(64 * 1024);
    let agent = Agent::spawn(ours, root, options(role), None);
    let mut peer = Peer::new(theirs);

    peer.shake().await;
    agent.wait_handshake().await.unwrap();
    assert_eq!(agent.phase(), Phase::Ready);
    (agent, peer)
}

#[tokio::test]
async fn negotiation_started_by_agent() {
    let temp = TempDir::new().unwrap();
    let (ours, theirs) = duplex(4096);
    let agent = Agent::spawn(ours, temp.path(), options(Role::Client), None);
    let mut peer = Peer::new(theirs);

    let negotiation = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.start_negotiation().await })
    };

    peer.expect(Message::handshake()).await;
    peer.send(Message::Success).await;
    peer.send(Message::handshake()).await;
    peer.expect(Message::Success).await;

    negotiation.await.unwrap().unwrap();
    assert!(agent.is_ready());
}

#[tokio::test]
async fn simultaneous_negotiation() {
    let (left_root, right_root) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let (left, right) = duplex(4096);
    let left = Agent::spawn(left, left_root.path(), options(Role::Client), None);
    let right = Agent::spawn(right, right_root.path(), options(Role::Server), None);

    let (a, b) = tokio::join!(left.start_negotiation(), right.start_negotiation());
    a.unwrap();
    b.unwrap();
    assert!(left.is_ready() && right.is_ready());
}

#[tokio::test]
async fn wrong_handshake_text_is_rejected() {
    let temp = TempDir::new().unwrap();
    let (ours, theirs) = duplex(4096);
    let agent = Agent::spawn(ours, temp.path(), options(Role::Server), None);
    let mut peer = Peer::new(theirs);

    peer.send(Message::Handshake {
        text: "not the protocol".into(),
    })
    .await;
    let error = peer.expect_fail_and_close().await;
    assert!(error.contains("handshake"), "{error}");

    agent.closed().await;
    assert_eq!(agent.phase(), Phase::Ended);
    assert!(matches!(
        agent.wait_handshake().await,
        Err(ProtocolError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn requests_before_handshake_fail() {
    let temp = TempDir::new().unwrap();
    let (ours, theirs) = duplex(4096);
    let _agent = Agent::spawn(ours, temp.path(), options(Role::Server), None);
    let mut peer = Peer::new(theirs);

    peer.send(Message::Transaction).await;
    let error = peer.expect_fail_and_close().await;
    assert!(error.contains("TRANSACTION"), "{error}");
}

#[tokio::test]
async fn handshake_times_out() {
    let temp = TempDir::new().unwrap();
    let (ours, _theirs) = duplex(4096);
    let agent = Agent::spawn(
        ours,
        temp.path(),
        AgentOptions {
            handshake_timeout: Duration::from_millis(50),
            ..options(Role::Server)
        },
        None,
    );

    assert!(matches!(
        agent.wait_handshake().await,
        Err(ProtocolError::Timeout(_))
    ));
    agent.closed().await;
}

#[tokio::test]
async fn unknown_message_type_fails_the_connection() {
    let temp = TempDir::new().unwrap();
    let (ours, theirs) = duplex(4096);
    let agent = Agent::spawn(ours, temp.path(), options(Role::Server), None);

    let (read_half, mut write_half) = tokio::io::split(theirs);
    let mut rx = MessageReader::new(Box::new(read_half), DEFAULT_MAX_FRAME);

    write_half
        .write_all(&encode_frame(&Message::handshake()).unwrap())
        .await
        .unwrap();
    assert_eq!(rx.recv().await.unwrap(), Some(Message::Success));
    assert_eq!(rx.recv().await.unwrap(), Some(Message::handshake()));
    write_half
        .write_all(&encode_frame(&Message::Success).unwrap())
        .await
        .unwrap();
    agent.wait_handshake().await.unwrap();

    let body = br#"{"type":"BOGUS"}"#;
    write_half
        .write_all(&(body.len() as u32).to_be_bytes())
        .await
        .unwrap();
    write_half.write_all(body).await.unwrap();

    assert!(matches!(rx.recv().await.unwrap(), Some(Message::Fail { .. })));
    assert_eq!(rx.recv().await.unwrap(), None);
    agent.closed().await;
}

#[tokio::test]
async fn zero_byte_file_gets_a_single_ack() {
    let temp = TempDir::new().unwrap();
    let (agent, mut peer) = shaken(Role::Client, temp.path()).await;
    let mut commits = agent.subscribe_commits();

    peer.send(Message::Transaction).await;
    peer.expect(Message::Success).await;
    peer.send(Message::GetFile {
        path: "empty.txt".into(),
        size: 0,
    })
    .await;
    peer.expect(Message::Success).await;
    peer.expect_silence().await;
    peer.send(Message::Transaction).await;
    peer.expect(Message::Success).await;

    let committed = commits.recv().await.unwrap();
    assert!(committed.files_to_add.contains("empty.txt"));
    let meta = std::fs::metadata(temp.path().join("empty.txt")).unwrap();
    assert_eq!(meta.len(), 0);
}

#[tokio::test]
async fn receives_file_into_new_directory() {
    let temp = TempDir::new().unwrap();
    let (agent, mut peer) = shaken(Role::Client, temp.path()).await;
    let mut applied = agent.subscribe_applied();

    let content = b"0123456789";
    let source_dir = TempDir::new().unwrap();
    let source = source_dir.path().join("a.txt");
    std::fs::write(&source, content).unwrap();

    peer.send(Message::Transaction).await;
    peer.expect(Message::Success).await;
    peer.send(Message::GetFile {
        path: "nested\\dir/a.txt".into(),
        size: content.len() as u64,
    })
    .await;
    peer.expect(Message::Success).await;
    peer.tx.send_file(&source, content.len() as u64).await.unwrap();
    peer.expect(Message::Success).await;

    assert_eq!(
        std::fs::read(temp.path().join("nested/dir/a.txt")).unwrap(),
        content
    );
    assert_eq!(applied.recv().await.unwrap(), "nested/dir/a.txt");
    assert!(agent
        .transaction_diff()
        .files_to_add
        .contains("nested/dir/a.txt"));
}

#[tokio::test]
async fn directory_operations_and_tolerated_unlink() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join("old/inner")).unwrap();
    std::fs::write(temp.path().join("old/inner/x"), b"x").unwrap();
    let (agent, mut peer) = shaken(Role::Client, temp.path()).await;
    let mut commits = agent.subscribe_commits();

    peer.send(Message::Transaction).await;
    peer.expect(Message::Success).await;
    peer.send(Message::MakeDir { path: "fresh/sub".into() }).await;
    peer.expect(Message::Success).await;
    peer.send(Message::Unlink {
        path: "never-existed.txt".into(),
    })
    .await;
    peer.expect(Message::Success).await;
    peer.send(Message::UnlinkDir { path: "old".into() }).await;
    peer.expect(Message::Success).await;
    peer.send(Message::Transaction).await;
    peer.expect(Message::Success).await;

    assert!(temp.path().join("fresh/sub").is_dir());
    assert!(!temp.path().join("old").exists());

    let committed = commits.recv().await.unwrap();
    assert!(committed.dirs_to_add.contains("fresh/sub"));
    assert!(committed.files_to_unlink.contains("never-existed.txt"));
    assert!(committed.dirs_to_unlink.contains("old"));
}

#[tokio::test]
async fn unlinking_missing_directory_is_fatal() {
    let temp = TempDir::new().unwrap();
    let (agent, mut peer) = shaken(Role::Client, temp.path()).await;

    peer.send(Message::Transaction).await;
    peer.expect(Message::Success).await;
    peer.send(Message::UnlinkDir {
        path: "missing".into(),
    })
    .await;
    peer.expect_fail_and_close().await;
    agent.closed().await;
}

#[tokio::test]
async fn operation_outside_transaction_is_fatal() {
    let temp = TempDir::new().unwrap();
    let (_agent, mut peer) = shaken(Role::Server, temp.path()).await;

    peer.send(Message::MakeDir { path: "d".into() }).await;
    peer.expect_fail_and_close().await;
    assert!(!temp.path().join("d").exists());
}

#[tokio::test]
async fn escaping_path_is_fatal() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("root");
    std::fs::create_dir(&root).unwrap();
    let (_agent, mut peer) = shaken(Role::Client, &root).await;

    peer.send(Message::Transaction).await;
    peer.expect(Message::Success).await;
    peer.send(Message::GetFile {
        path: "../evil.txt".into(),
        size: 0,
    })
    .await;
    peer.expect_fail_and_close().await;
    assert!(!temp.path().join("evil.txt").exists());
}

#[tokio::test]
async fn sends_a_file_transaction() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("a.txt"), b"0123456789").unwrap();
    let (agent, mut peer) = shaken(Role::Client, temp.path()).await;
    let target_dir = TempDir::new().unwrap();
    let target = target_dir.path().join("a.txt");

    let sender = {
        let agent = agent.clone();
        tokio::spawn(async move {
            agent.start_transaction().await?;
            agent.send_file("a.txt").await?;
            agent.end_transaction().await
        })
    };

    peer.expect(Message::Transaction).await;
    peer.send(Message::Success).await;
    peer.expect(Message::GetFile {
        path: "a.txt".into(),
        size: 10,
    })
    .await;
    peer.send(Message::Success).await;
    peer.rx.get_file(&target, 10).await.unwrap();
    peer.send(Message::Success).await;
    peer.expect(Message::Transaction).await;
    peer.send(Message::Success).await;

    sender.await.unwrap().unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), b"0123456789");
    assert!(!agent.in_transaction());
}

#[tokio::test]
async fn missing_local_file_is_skippable() {
    let temp = TempDir::new().unwrap();
    let (agent, mut peer) = shaken(Role::Client, temp.path()).await;

    let opener = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.start_transaction().await })
    };
    peer.expect(Message::Transaction).await;
    peer.send(Message::Success).await;
    opener.await.unwrap().unwrap();

    let err = agent.send_file("gone.txt").await.unwrap_err();
    assert!(matches!(err, ProtocolError::LocalFileMissing(_)));
    assert!(!err.is_fatal());
    peer.expect_silence().await;
    assert!(agent.is_ready());
}

#[tokio::test]
async fn mutations_need_an_open_transaction() {
    let temp = TempDir::new().unwrap();
    let (agent, mut peer) = shaken(Role::Client, temp.path()).await;

    assert!(matches!(
        agent.send_dir("d").await,
        Err(ProtocolError::NotInTransaction)
    ));
    assert!(matches!(
        agent.end_transaction().await,
        Err(ProtocolError::NotInTransaction)
    ));
    peer.expect_silence().await;
}

#[tokio::test]
async fn unanswered_request_times_out_and_closes() {
    let temp = TempDir::new().unwrap();
    let (agent, mut peer) = shaken(Role::Client, temp.path()).await;
    agent.set_timeout(Duration::from_millis(100));

    let result = agent.start_transaction().await;
    assert!(matches!(result, Err(ProtocolError::Timeout(_))));
    peer.expect(Message::Transaction).await;
    assert_eq!(peer.recv().await, None);
    agent.closed().await;
}

#[tokio::test]
async fn peer_disconnect_abandons_waits() {
    let temp = TempDir::new().unwrap();
    let (agent, peer) = shaken(Role::Client, temp.path()).await;

    let opener = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.start_transaction().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(peer);

    assert!(matches!(
        opener.await.unwrap(),
        Err(ProtocolError::ConnectionClosed)
    ));
    assert_eq!(agent.phase(), Phase::Ended);
}

#[tokio::test]
async fn own_transaction_waits_for_peer_transaction() {
    let temp = TempDir::new().unwrap();
    let (agent, mut peer) = shaken(Role::Server, temp.path()).await;

    peer.send(Message::Transaction).await;
    peer.expect(Message::Success).await;
    assert!(agent.peer_in_transaction());

    let opener = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.start_transaction().await })
    };
    peer.expect_silence().await;

    peer.send(Message::Transaction).await;
    peer.expect(Message::Success).await;
    peer.expect(Message::Transaction).await;
    peer.send(Message::Success).await;

    opener.await.unwrap().unwrap();
    assert!(agent.in_transaction());
    assert!(!agent.peer_in_transaction());
}

#[tokio::test]
async fn client_yields_to_server_transaction() {
    let temp = TempDir::new().unwrap();
    let (agent, mut peer) = shaken(Role::Client, temp.path()).await;

    let opener = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.start_transaction().await })
    };
    peer.expect(Message::Transaction).await;

    // Both sides asked at once; the client gives way.
    peer.send(Message::Transaction).await;
    peer.expect(Message::Success).await;
    peer.send(Message::MakeDir { path: "x".into() }).await;
    peer.expect(Message::Success).await;
    peer.send(Message::Transaction).await;
    peer.expect(Message::Success).await;

    peer.send(Message::Success).await;
    opener.await.unwrap().unwrap();
    assert!(temp.path().join("x").is_dir());
    assert!(agent.in_transaction());
}

#[tokio::test]
async fn rejected_admission_fails_the_connection() {
    let temp = TempDir::new().unwrap();
    let (ours, theirs) = duplex(4096);
    let reject: AdmissionCheck = Arc::new(|_agent: Arc<Agent>| {
        async { Err::<(), _>(anyhow::anyhow!("not now")) }.boxed()
    });
    let agent = Agent::spawn(ours, temp.path(), options(Role::Server), Some(reject));
    let mut peer = Peer::new(theirs);
    peer.shake().await;
    agent.wait_handshake().await.unwrap();

    peer.send(Message::Transaction).await;
    let error = peer.expect_fail_and_close().await;
    assert!(error.contains("not now"), "{error}");
}

#[tokio::test]
async fn peer_failure_closes_without_reply() {
    let temp = TempDir::new().unwrap();
    let (agent, mut peer) = shaken(Role::Client, temp.path()).await;

    peer.send(Message::fail("disk on fire")).await;
    assert_eq!(peer.recv().await, None);
    agent.closed().await;
}

#[tokio::test]
async fn unsolicited_success_is_fatal() {
    let temp = TempDir::new().unwrap();
    let (agent, mut peer) = shaken(Role::Client, temp.path()).await;

    peer.send(Message::Success).await;
    let error = peer.expect_fail_and_close().await;
    assert!(error.contains("SUCCESS"), "{error}");
    agent.closed().await;

    // Nothing left over to stand in for a real acknowledgement.
    assert!(agent.start_transaction().await.is_err());
}

#[tokio::test]
async fn concurrent_sends_never_overlap_on_the_wire() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("f.txt"), b"payload").unwrap();
    let (agent, mut peer) = shaken(Role::Client, temp.path()).await;

    let opener = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.start_transaction().await })
    };
    peer.expect(Message::Transaction).await;
    peer.send(Message::Success).await;
    opener.await.unwrap().unwrap();

    let senders = vec![
        {
            let agent = agent.clone();
            tokio::spawn(async move { agent.send_dir("a").await })
        },
        {
            let agent = agent.clone();
            tokio::spawn(async move { agent.send_file("f.txt").await })
        },
        {
            let agent = agent.clone();
            tokio::spawn(async move { agent.send_unlink("u.txt").await })
        },
    ];

    let target_dir = TempDir::new().unwrap();
    let mut seen = Vec::new();
    for _ in 0..senders.len() {
        let request = peer.recv().await.unwrap();
        // Nothing else may follow until this request has been answered.
        peer.expect_silence().await;
        if let Message::GetFile { size, .. } = &request {
            let size = *size;
            peer.send(Message::Success).await;
            peer.rx
                .get_file(&target_dir.path().join("f.txt"), size)
                .await
                .unwrap();
            peer.expect_silence().await;
        }
        seen.push(request.kind());
        peer.send(Message::Success).await;
    }

    for sender in senders {
        sender.await.unwrap().unwrap();
    }
    seen.sort_unstable();
    assert_eq!(seen, vec!["GET_FILE", "MKDIR", "UNLINK"]);
    assert_eq!(
        std::fs::read(target_dir.path().join("f.txt")).unwrap(),
        b"payload"
    );
}
