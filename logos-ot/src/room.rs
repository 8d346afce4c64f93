//! One actor per document: serialised commits and fan-out.
//!
//! ```text
//! Client A ──submit──┐                                 ┌──▶ Membership A (Ack)
//!                    ├─▶ mpsc ─▶ room task ─▶ broadcast ┤
//! Client B ──submit──┘           (OTServer)            └──▶ Membership B (Remote)
//! ```
//!
//! The room task is the only owner of its [`OTServer`], so commits for one
//! document happen strictly one at a time while different documents run in
//! parallel. Joining takes the snapshot and subscribes to commits in the
//! same step, so a member sees every commit after its snapshot exactly once.
//! A member that overflows its broadcast buffer is caught up from the
//! server's log in the same way, and only gets a snapshot once the log has
//! been truncated past its last revision.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};

use crate::error::{OtError, Result};
use crate::protocol::{ClientId, DocumentId, EditEnvelope, ServerMessage, Snapshot};
use crate::server::{OTServer, Receipt, ServerConfig, ServerStats};

/// Room configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Configuration of the room's [`OTServer`]
    pub server: ServerConfig,
    /// Commits buffered per member before it lags and has to catch up
    pub broadcast_capacity: usize,
    /// Pending commands before submitters wait
    pub command_queue: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            broadcast_capacity: 256,
            command_queue: 128,
        }
    }
}

type Commits = broadcast::Receiver<Arc<EditEnvelope>>;

/// What a lagging member needs to continue.
enum CatchUp {
    /// Everything committed after the member's last revision, oldest first.
    Commits(Vec<EditEnvelope>),
    /// The log was truncated past the member's last revision.
    Snapshot(Snapshot),
}

enum RoomCommand {
    Submit {
        envelope: EditEnvelope,
        reply: oneshot::Sender<Result<Receipt>>,
    },
    Join {
        reply: oneshot::Sender<(Snapshot, Commits)>,
    },
    /// Commits after `since` for a lagging member, with a fresh receiver.
    CatchUp {
        since: u64,
        reply: oneshot::Sender<(CatchUp, Commits)>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    Stats {
        reply: oneshot::Sender<ServerStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running document actor. Cheap to clone.
#[derive(Clone)]
pub struct DocumentRoom {
    doc_id: DocumentId,
    commands: mpsc::Sender<RoomCommand>,
}

impl DocumentRoom {
    /// Start the actor on the current tokio runtime.
    pub fn spawn(doc_id: DocumentId, text: impl Into<String>, config: RoomConfig) -> Self {
        let (commands, inbox) = mpsc::channel(config.command_queue.max(1));
        let (commits, _) = broadcast::channel(config.broadcast_capacity.max(1));
        let server = OTServer::with_config(text, config.server);
        tokio::spawn(run(doc_id, server, inbox, commits));
        Self { doc_id, commands }
    }

    /// Document this room serves.
    pub fn doc_id(&self) -> DocumentId {
        self.doc_id
    }

    /// Whether the actor has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> RoomCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| OtError::RoomClosed)?;
        response.await.map_err(|_| OtError::RoomClosed)
    }

    /// Hand an envelope to the server. Committed envelopes are broadcast to
    /// every member, the author included.
    pub async fn submit(&self, envelope: EditEnvelope) -> Result<Receipt> {
        self.request(|reply| RoomCommand::Submit { envelope, reply })
            .await?
    }

    /// Subscribe `client_id` to the room, starting from the current snapshot.
    pub async fn join(&self, client_id: ClientId) -> Result<Membership> {
        let (snapshot, commits) = self.request(|reply| RoomCommand::Join { reply }).await?;
        log::debug!(
            "Client {client_id} joined {} at revision {}",
            self.doc_id, snapshot.revision
        );
        Ok(Membership::new(client_id, self.clone(), snapshot, commits))
    }

    /// Current text and revision.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.request(|reply| RoomCommand::Snapshot { reply }).await
    }

    /// Counters of the room's server.
    pub async fn stats(&self) -> Result<ServerStats> {
        self.request(|reply| RoomCommand::Stats { reply }).await
    }

    /// Stop the actor. Members see [`OtError::RoomClosed`] once drained.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| RoomCommand::Shutdown { reply }).await
    }
}

async fn run(
    doc_id: DocumentId,
    mut server: OTServer,
    mut inbox: mpsc::Receiver<RoomCommand>,
    commits: broadcast::Sender<Arc<EditEnvelope>>,
) {
    log::info!("Room {doc_id} open at revision {}", server.revision());

    while let Some(command) = inbox.recv().await {
        match command {
            RoomCommand::Submit { envelope, reply } => {
                let result = server.receive(envelope);
                if let Ok(Receipt::Committed(committed)) = &result {
                    let receivers = commits.send(Arc::new(committed.clone())).unwrap_or(0);
                    log::debug!(
                        "Room {doc_id} broadcast revision {} to {receivers} members",
                        server.revision()
                    );
                }
                let _ = reply.send(result);
            }
            RoomCommand::Join { reply } => {
                let _ = reply.send((server.snapshot(), commits.subscribe()));
            }
            RoomCommand::CatchUp { since, reply } => {
                let catch_up = match server.edits_since(since) {
                    Ok(missed) => CatchUp::Commits(missed),
                    Err(e) => {
                        log::debug!("Room {doc_id} cannot replay from revision {since}: {e}");
                        CatchUp::Snapshot(server.snapshot())
                    }
                };
                let _ = reply.send((catch_up, commits.subscribe()));
            }
            RoomCommand::Snapshot { reply } => {
                let _ = reply.send(server.snapshot());
            }
            RoomCommand::Stats { reply } => {
                let _ = reply.send(server.stats().clone());
            }
            RoomCommand::Shutdown { reply } => {
                let _ = reply.send(());
                break;
            }
        }
    }

    log::info!(
        "Room {doc_id} closed at revision {} ({} commits)",
        server.revision(),
        server.stats().commits
    );
}

/// A client's view of a room: its latest snapshot and every commit after it.
pub struct Membership {
    client_id: ClientId,
    room: DocumentRoom,
    /// Join snapshot, or the one handed out by the last fallback resync
    snapshot: Snapshot,
    commits: Commits,
    /// Missed commits fetched after a lag, handed out before the live feed
    backlog: VecDeque<EditEnvelope>,
    /// Revision of the last commit handed out
    last_seen: u64,
}

impl Membership {
    fn new(client_id: ClientId, room: DocumentRoom, snapshot: Snapshot, commits: Commits) -> Self {
        Self {
            client_id,
            room,
            last_seen: snapshot.revision,
            snapshot,
            commits,
            backlog: VecDeque::new(),
        }
    }

    /// Document state at joining, or at the last snapshot resync.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Room to submit envelopes to.
    pub fn room(&self) -> &DocumentRoom {
        &self.room
    }

    /// Revision of the last commit this member was handed.
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Next message for this member: `Ack` for its own commits, `Remote` for
    /// everyone else's.
    ///
    /// A member that falls behind the broadcast buffer is caught up with the
    /// commits it missed, in order. Only when the room's log no longer reaches
    /// back that far does it get a fresh `Snapshot` instead.
    pub async fn recv(&mut self) -> Result<ServerMessage> {
        loop {
            if let Some(committed) = self.backlog.pop_front() {
                return Ok(self.deliver(&committed));
            }
            match self.commits.recv().await {
                Ok(committed) => return Ok(self.deliver(&committed)),
                Err(RecvError::Lagged(skipped)) => {
                    if let Some(snapshot) = self.catch_up(skipped).await? {
                        return Ok(snapshot);
                    }
                }
                Err(RecvError::Closed) => return Err(OtError::RoomClosed),
            }
        }
    }

    /// Like [`Membership::recv`] but returns `None` when nothing is queued.
    pub async fn try_recv(&mut self) -> Result<Option<ServerMessage>> {
        use tokio::sync::broadcast::error::TryRecvError;

        loop {
            if let Some(committed) = self.backlog.pop_front() {
                return Ok(Some(self.deliver(&committed)));
            }
            match self.commits.try_recv() {
                Ok(committed) => return Ok(Some(self.deliver(&committed))),
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Lagged(skipped)) => {
                    if let Some(snapshot) = self.catch_up(skipped).await? {
                        return Ok(Some(snapshot));
                    }
                }
                Err(TryRecvError::Closed) => return Err(OtError::RoomClosed),
            }
        }
    }

    fn deliver(&mut self, committed: &EditEnvelope) -> ServerMessage {
        self.last_seen = committed.committed_revision();
        ServerMessage::for_recipient(committed, self.client_id)
    }

    /// Refill the backlog after missing `skipped` broadcasts. Returns a
    /// snapshot message when the missed commits are no longer available.
    async fn catch_up(&mut self, skipped: u64) -> Result<Option<ServerMessage>> {
        let since = self.last_seen;
        let (catch_up, commits) = self
            .room
            .request(|reply| RoomCommand::CatchUp { since, reply })
            .await?;
        self.commits = commits;

        match catch_up {
            CatchUp::Commits(missed) => {
                log::debug!(
                    "Client {} lagged {skipped} broadcasts behind in {}, replaying {} commits after revision {since}",
                    self.client_id,
                    self.room.doc_id(),
                    missed.len()
                );
                self.backlog.extend(missed);
                Ok(None)
            }
            CatchUp::Snapshot(snapshot) => {
                log::warn!(
                    "Client {} lagged past the log of {} (last saw revision {since}), resynchronising at {}",
                    self.client_id,
                    self.room.doc_id(),
                    snapshot.revision
                );
                self.backlog.clear();
                self.last_seen = snapshot.revision;
                self.snapshot = snapshot.clone();
                Ok(Some(ServerMessage::from(snapshot)))
            }
        }
    }
}

/// Room manager: maps document IDs to running rooms.
pub struct RoomManager {
    /// Running rooms by document
    rooms: Arc<RwLock<HashMap<DocumentId, DocumentRoom>>>,
    /// Used for every room this manager starts
    config: RoomConfig,
}

impl RoomManager {
    pub fn new(config: RoomConfig) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Get the room for `doc_id`, starting it with `initial_text` if needed.
    pub async fn get_or_create(&self, doc_id: DocumentId, initial_text: &str) -> DocumentRoom {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&doc_id).filter(|room| !room.is_closed()) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(&doc_id).filter(|room| !room.is_closed()) {
            return room.clone();
        }

        let room = DocumentRoom::spawn(doc_id, initial_text, self.config.clone());
        rooms.insert(doc_id, room.clone());
        room
    }

    /// The room for `doc_id`, if one was started.
    pub async fn get(&self, doc_id: DocumentId) -> Option<DocumentRoom> {
        self.rooms.read().await.get(&doc_id).cloned()
    }

    /// Stop and forget a room.
    pub async fn remove(&self, doc_id: DocumentId) -> bool {
        let room = self.rooms.write().await.remove(&doc_id);
        match room {
            Some(room) => {
                if room.shutdown().await.is_err() {
                    log::debug!("Room {doc_id} was already closed");
                }
                true
            }
            None => false,
        }
    }

    /// Number of rooms being tracked.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<DocumentId> {
        self.rooms.read().await.keys().copied().collect()
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new(RoomConfig::default())
    }
}
