//! Per-connection protocol state machine
//!
//! An [`Agent`] owns one connection. Its receive loop answers the peer's
//! requests (writing into the local root and recording them into the open
//! transaction's [`Diff`]), while callers drive the outbound side through
//! `start_transaction` / `send_*` / `end_transaction`. Every outbound
//! operation completes a full request/acknowledge round trip before the next
//! one may start.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dispatcher::EventDispatcher;
use super::message::{Message, HANDSHAKE_TEXT};
use super::transport::{self, MessageReader, Transport, DEFAULT_MAX_FRAME};
use crate::diff::Diff;
use crate::error::{ProtocolError, ProtocolResult, TransportError};
use crate::tree;

const NOTIFICATION_CAPACITY: usize = 1024;

/// Which end of the connection this agent plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Serializes peer transactions with its own through one lock.
    Server,
    /// Admits a server transaction even while its own request is pending.
    Client,
}

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub role: Role,
    pub ack_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_frame: usize,
    pub handshake_text: String,
}

impl AgentOptions {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            ack_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            max_frame: DEFAULT_MAX_FRAME,
            handshake_text: HANDSHAKE_TEXT.to_string(),
        }
    }
}

/// Hook consulted before a peer transaction is acknowledged. An error
/// rejects the transaction and ends the connection.
pub type AdmissionCheck =
    Arc<dyn Fn(Arc<Agent>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Events awaited through the agent's dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentEvent {
    Handshake,
    OperationSuccess,
    TransactionEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingHandshake,
    Ready,
    Ended,
}

#[derive(Debug, Default)]
struct ConnectionState {
    ready: bool,
    handshake_sent: bool,
    handshake_received: bool,
    handshake_acked: bool,
    admission_pending: bool,
    /// SUCCESS replies our outstanding requests still expect.
    pending_acks: usize,
    incoming_transaction: bool,
    outgoing_transaction: bool,
    diff: Diff,
}

pub struct Agent {
    id: Uuid,
    root: PathBuf,
    options: AgentOptions,
    transport: Transport,
    events: EventDispatcher<AgentEvent>,
    state: Mutex<ConnectionState>,
    transaction_lock: Arc<AsyncMutex<()>>,
    outgoing_guard: Mutex<Option<OwnedMutexGuard<()>>>,
    incoming_guard: Mutex<Option<OwnedMutexGuard<()>>>,
    operation_lock: AsyncMutex<()>,
    admission: Option<AdmissionCheck>,
    commits: broadcast::Sender<Diff>,
    applied: broadcast::Sender<String>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("role", &self.options.role)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Agent {
    /// Wraps `stream` and starts the receive loop.
    pub fn spawn<S>(
        stream: S,
        root: impl Into<PathBuf>,
        options: AgentOptions,
        admission: Option<AdmissionCheck>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (transport, reader) = transport::split(stream, options.max_frame, options.ack_timeout);
        let (commits, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (applied, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        let agent = Arc::new(Self {
            id: Uuid::new_v4(),
            root: root.into(),
            options,
            transport,
            events: EventDispatcher::new(),
            state: Mutex::new(ConnectionState::default()),
            transaction_lock: Arc::new(AsyncMutex::new(())),
            outgoing_guard: Mutex::new(None),
            incoming_guard: Mutex::new(None),
            operation_lock: AsyncMutex::new(()),
            admission,
            commits,
            applied,
        });

        tokio::spawn(agent.clone().receive_loop(reader));
        agent
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn phase(&self) -> Phase {
        if self.transport.is_closed() {
            Phase::Ended
        } else if self.state.lock().ready {
            Phase::Ready
        } else {
            Phase::AwaitingHandshake
        }
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == Phase::Ready
    }

    /// Whether this side currently holds an open transaction on the wire.
    pub fn in_transaction(&self) -> bool {
        self.state.lock().outgoing_transaction
    }

    /// Whether the peer currently holds an open transaction on the wire.
    pub fn peer_in_transaction(&self) -> bool {
        self.state.lock().incoming_transaction
    }

    /// Changes recorded so far in the peer's open transaction.
    pub fn transaction_diff(&self) -> Diff {
        self.state.lock().diff.clone()
    }

    /// Diffs of peer transactions, one per commit.
    pub fn subscribe_commits(&self) -> broadcast::Receiver<Diff> {
        self.commits.subscribe()
    }

    /// Relative paths written or removed on behalf of the peer.
    pub fn subscribe_applied(&self) -> broadcast::Receiver<String> {
        self.applied.subscribe()
    }

    /// Overrides the acknowledgement deadline.
    pub fn set_timeout(&self, timeout: Duration) {
        self.transport.set_timeout(timeout);
    }

    pub async fn close(&self) {
        self.transport.close_connection(None).await;
    }

    /// Resolves once the connection has ended.
    pub async fn closed(&self) {
        self.transport.closed().await;
    }

    /// Sends our handshake and waits until both sides are shaken.
    pub async fn start_negotiation(&self) -> ProtocolResult<()> {
        {
            let mut state = self.state.lock();
            if state.handshake_sent {
                return Err(ProtocolError::UnexpectedMessage("HANDSHAKE"));
            }
            state.handshake_sent = true;
        }
        self.send(&self.handshake_message()).await?;
        self.wait_handshake().await
    }

    /// Waits until the handshake completes, whichever side started it.
    pub async fn wait_handshake(&self) -> ProtocolResult<()> {
        if self.is_ready() {
            return Ok(());
        }
        match tokio::time::timeout(
            self.options.handshake_timeout,
            self.wait_for(AgentEvent::Handshake),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                self.close().await;
                Err(ProtocolError::Timeout("handshake"))
            }
        }
    }

    /// Opens a transaction once the peer's transaction, if any, has closed.
    /// Only one local caller can hold a transaction at a time.
    pub async fn start_transaction(&self) -> ProtocolResult<()> {
        let guard = tokio::select! {
            guard = self.transaction_lock.clone().lock_owned() => guard,
            _ = self.transport.closed() => return Err(ProtocolError::ConnectionClosed),
        };
        self.wait_peer_transaction().await?;

        {
            let _op = self.operation_lock.lock().await;
            self.exchange(&Message::Transaction, "transaction start").await?;
        }

        self.state.lock().outgoing_transaction = true;
        *self.outgoing_guard.lock() = Some(guard);
        debug!(agent = %self.id, "transaction opened");
        Ok(())
    }

    pub async fn end_transaction(&self) -> ProtocolResult<()> {
        let open = self.state.lock().outgoing_transaction;
        if !open {
            return Err(ProtocolError::NotInTransaction);
        }

        {
            let _op = self.operation_lock.lock().await;
            self.exchange(&Message::Transaction, "transaction end").await?;
        }

        self.state.lock().outgoing_transaction = false;
        self.outgoing_guard.lock().take();
        debug!(agent = %self.id, "transaction closed");
        Ok(())
    }

    /// Sends the file at `path` (relative to the root). Fails with
    /// [`ProtocolError::LocalFileMissing`] before touching the wire when the
    /// file is gone.
    pub async fn send_file(&self, path: &str) -> ProtocolResult<()> {
        let (local, relative) = tree::resolve(&self.root, path)?;
        let _op = self.operation_lock.lock().await;
        self.check_transaction().await?;

        let size = match fs::metadata(&local).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return Err(ProtocolError::LocalFileMissing(local)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ProtocolError::LocalFileMissing(local))
            }
            Err(e) => return Err(e.into()),
        };

        debug!(agent = %self.id, path = %relative, size, "sending file");
        let request = Message::GetFile {
            path: relative,
            size,
        };
        if size == 0 {
            return self.exchange(&request, "file received").await;
        }

        self.exchange(&request, "file go-ahead").await?;
        self.expect_ack();
        if let Err(err) = self.transport.send_file(&local, size).await {
            self.close().await;
            return Err(err.into());
        }
        self.await_ack("file received").await
    }

    pub async fn send_dir(&self, path: &str) -> ProtocolResult<()> {
        let path = tree::normalize(path)?;
        self.request(Message::MakeDir { path }, "mkdir").await
    }

    pub async fn send_unlink(&self, path: &str) -> ProtocolResult<()> {
        let path = tree::normalize(path)?;
        self.request(Message::Unlink { path }, "unlink").await
    }

    pub async fn send_unlink_dir(&self, path: &str) -> ProtocolResult<()> {
        let path = tree::normalize(path)?;
        self.request(Message::UnlinkDir { path }, "unlink dir").await
    }

    async fn request(&self, message: Message, what: &'static str) -> ProtocolResult<()> {
        let _op = self.operation_lock.lock().await;
        self.check_transaction().await?;
        debug!(agent = %self.id, kind = message.kind(), "sending request");
        self.exchange(&message, what).await
    }

    /// Sends a request that the peer answers with exactly one SUCCESS.
    async fn exchange(&self, message: &Message, what: &'static str) -> ProtocolResult<()> {
        self.expect_ack();
        self.send(message).await?;
        self.await_ack(what).await
    }

    /// Registers one SUCCESS as owed to us. Must happen before the request
    /// leaves, since the reply can arrive before `send` returns.
    fn expect_ack(&self) {
        self.state.lock().pending_acks += 1;
    }

    async fn check_transaction(&self) -> ProtocolResult<()> {
        let open = self.state.lock().outgoing_transaction;
        if !open {
            return Err(ProtocolError::NotInTransaction);
        }
        self.wait_peer_transaction().await
    }

    async fn wait_peer_transaction(&self) -> ProtocolResult<()> {
        loop {
            let open = self.state.lock().incoming_transaction;
            if !open {
                return Ok(());
            }
            self.wait_for(AgentEvent::TransactionEnd).await?;
        }
    }

    async fn wait_for(&self, event: AgentEvent) -> ProtocolResult<()> {
        tokio::select! {
            _ = self.events.wait_event(event) => Ok(()),
            _ = self.transport.closed() => Err(ProtocolError::ConnectionClosed),
        }
    }

    async fn await_ack(&self, what: &'static str) -> ProtocolResult<()> {
        match self
            .transport
            .await_response(self.wait_for(AgentEvent::OperationSuccess))
            .await
        {
            Ok(result) => result,
            Err(TransportError::Timeout) => Err(ProtocolError::Timeout(what)),
            Err(err) => Err(err.into()),
        }
    }

    async fn send(&self, message: &Message) -> ProtocolResult<()> {
        self.transport.send_message(message).await?;
        Ok(())
    }

    fn handshake_message(&self) -> Message {
        Message::Handshake {
            text: self.options.handshake_text.clone(),
        }
    }

    async fn receive_loop(self: Arc<Self>, mut reader: MessageReader) {
        loop {
            let received = tokio::select! {
                received = reader.recv() => received,
                _ = self.transport.closed() => break,
            };

            let outcome = match received {
                Ok(Some(message)) => {
                    self.transport.touch();
                    tokio::select! {
                        outcome = self.process_message(message, &mut reader) => outcome,
                        _ = self.transport.closed() => break,
                    }
                }
                Ok(None) => {
                    debug!(agent = %self.id, "peer closed the stream");
                    break;
                }
                Err(err) => Err(err.into()),
            };

            if let Err(err) = outcome {
                self.abort(err).await;
                break;
            }
        }

        self.finish().await;
    }

    async fn abort(&self, err: ProtocolError) {
        warn!(agent = %self.id, error = %err, "closing connection");
        let farewell = err
            .should_notify_peer()
            .then(|| Message::fail(err.to_string()));
        self.transport.close_connection(farewell.as_ref()).await;
    }

    async fn finish(&self) {
        self.transport.close_connection(None).await;
        {
            let mut state = self.state.lock();
            state.incoming_transaction = false;
            state.outgoing_transaction = false;
        }
        self.incoming_guard.lock().take();
        self.outgoing_guard.lock().take();
        info!(agent = %self.id, "connection ended");
    }

    async fn process_message(
        self: &Arc<Self>,
        message: Message,
        reader: &mut MessageReader,
    ) -> ProtocolResult<()> {
        match message {
            Message::Handshake { text } => self.shake_hands(text).await,
            Message::Success => self.acknowledge(),
            Message::Fail { error } => Err(ProtocolError::PeerFailed(error)),
            other if !self.is_ready() => Err(ProtocolError::HandshakeRequired(other.kind())),
            Message::Transaction => self.toggle_transaction().await,
            Message::GetFile { path, size } => self.get_file(&path, size, reader).await,
            Message::MakeDir { path } => self.create_dir(&path).await,
            Message::Unlink { path } => self.unlink_file(&path).await,
            Message::UnlinkDir { path } => self.unlink_dir(&path).await,
        }
    }

    async fn shake_hands(&self, text: String) -> ProtocolResult<()> {
        if text != self.options.handshake_text {
            return Err(ProtocolError::BadHandshake {
                expected: self.options.handshake_text.clone(),
                actual: text,
            });
        }

        let reply = {
            let mut state = self.state.lock();
            if state.handshake_received {
                return Err(ProtocolError::UnexpectedMessage("HANDSHAKE"));
            }
            state.handshake_received = true;
            let reply = !state.handshake_sent;
            state.handshake_sent = true;
            reply
        };

        self.send(&Message::Success).await?;
        if reply {
            self.send(&self.handshake_message()).await?;
        }
        self.check_handshake();
        Ok(())
    }

    fn acknowledge(&self) -> ProtocolResult<()> {
        let handshake_ack = {
            let mut state = self.state.lock();
            if state.ready {
                if state.pending_acks == 0 {
                    return Err(ProtocolError::UnexpectedMessage("SUCCESS"));
                }
                state.pending_acks -= 1;
                false
            } else if state.handshake_sent && !state.handshake_acked {
                state.handshake_acked = true;
                true
            } else {
                return Err(ProtocolError::UnexpectedMessage("SUCCESS"));
            }
        };

        if handshake_ack {
            self.check_handshake();
        } else {
            self.events.register_event(AgentEvent::OperationSuccess);
        }
        Ok(())
    }

    fn check_handshake(&self) {
        let shaken = {
            let mut state = self.state.lock();
            let shaken = !state.ready && state.handshake_received && state.handshake_acked;
            if shaken {
                state.ready = true;
            }
            shaken
        };

        if shaken {
            info!(agent = %self.id, role = ?self.options.role, "handshake complete");
            self.events.register_event(AgentEvent::Handshake);
        }
    }

    async fn toggle_transaction(self: &Arc<Self>) -> ProtocolResult<()> {
        enum Toggle {
            Close(Diff),
            Open,
        }

        let toggle = {
            let mut state = self.state.lock();
            if state.incoming_transaction {
                state.incoming_transaction = false;
                Toggle::Close(std::mem::take(&mut state.diff))
            } else if state.admission_pending {
                return Err(ProtocolError::UnexpectedMessage("TRANSACTION"));
            } else {
                state.admission_pending = true;
                Toggle::Open
            }
        };

        match toggle {
            Toggle::Close(diff) => {
                // Acknowledge before waking our own queued transaction so
                // the peer sees the ack first.
                let acked = self.send(&Message::Success).await;
                self.incoming_guard.lock().take();
                info!(agent = %self.id, changes = diff.len(), "peer transaction committed");
                let _ = self.commits.send(diff);
                self.events.register_event(AgentEvent::TransactionEnd);
                acked
            }
            Toggle::Open => {
                // Admission may wait on other connections; the receive loop
                // has to keep draining acknowledgements meanwhile.
                let agent = self.clone();
                tokio::spawn(async move {
                    if let Err(err) = agent.admit_transaction().await {
                        agent.abort(err).await;
                    }
                });
                Ok(())
            }
        }
    }

    async fn admit_transaction(self: &Arc<Self>) -> ProtocolResult<()> {
        if let Some(check) = &self.admission {
            check(self.clone())
                .await
                .map_err(|e| ProtocolError::Rejected(format!("{e:#}")))?;
        }

        let guard = match self.options.role {
            Role::Server => Some(tokio::select! {
                guard = self.transaction_lock.clone().lock_owned() => guard,
                _ = self.transport.closed() => return Err(ProtocolError::ConnectionClosed),
            }),
            Role::Client => None,
        };

        {
            let mut state = self.state.lock();
            state.admission_pending = false;
            state.incoming_transaction = true;
            state.diff = Diff::new();
        }
        *self.incoming_guard.lock() = guard;

        debug!(agent = %self.id, "peer transaction opened");
        self.send(&Message::Success).await
    }

    fn require_transaction(&self) -> ProtocolResult<()> {
        if self.state.lock().incoming_transaction {
            Ok(())
        } else {
            Err(ProtocolError::NotInTransaction)
        }
    }

    fn record(&self, relative: &str, update: impl FnOnce(&mut Diff)) {
        update(&mut self.state.lock().diff);
        let _ = self.applied.send(relative.to_string());
    }

    async fn get_file(
        &self,
        path: &str,
        size: u64,
        reader: &mut MessageReader,
    ) -> ProtocolResult<()> {
        self.require_transaction()?;
        let (local, relative) = tree::resolve(&self.root, path)?;
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).await?;
        }

        if size == 0 {
            fs::File::create(&local).await?;
        } else {
            self.send(&Message::Success).await?;
            reader.get_file(&local, size).await?;
        }

        debug!(agent = %self.id, path = %relative, size, "file received");
        self.record(&relative, |diff| diff.add_file(&relative));
        self.send(&Message::Success).await
    }

    async fn create_dir(&self, path: &str) -> ProtocolResult<()> {
        self.require_transaction()?;
        let (local, relative) = tree::resolve(&self.root, path)?;
        fs::create_dir_all(&local).await?;

        debug!(agent = %self.id, path = %relative, "directory created");
        self.record(&relative, |diff| diff.add_dir(&relative));
        self.send(&Message::Success).await
    }

    async fn unlink_file(&self, path: &str) -> ProtocolResult<()> {
        self.require_transaction()?;
        let (local, relative) = tree::resolve(&self.root, path)?;
        match fs::remove_file(&local).await {
            Ok(()) => debug!(agent = %self.id, path = %relative, "file removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(agent = %self.id, path = %relative, "file already absent");
            }
            Err(e) => return Err(e.into()),
        }

        self.record(&relative, |diff| diff.add_unlink(&relative));
        self.send(&Message::Success).await
    }

    async fn unlink_dir(&self, path: &str) -> ProtocolResult<()> {
        self.require_transaction()?;
        let (local, relative) = tree::resolve(&self.root, path)?;
        fs::remove_dir_all(&local).await?;

        debug!(agent = %self.id, path = %relative, "directory removed");
        self.record(&relative, |diff| diff.add_unlink_dir(&relative));
        self.send(&Message::Success).await
    }
}
