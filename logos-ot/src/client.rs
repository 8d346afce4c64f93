//! Client-side coordinator for one replica of a document.
//!
//! Provides:
//! - Optimistic local edits with at most one envelope in flight
//! - Buffering of edits made while waiting for an acknowledgment
//! - Transformation of remote edits against the unacknowledged ones
//! - Undo/redo that stays correct across interleaved remote edits
//!
//! ```text
//!                  local edit                      local edit
//!  Synchronized ──────────────▶ AwaitingAck ──────────────────▶ AwaitingAckWithBuffer
//!       ▲                        │     ▲                                 │
//!       └──── ack (no buffer) ───┘     └───── ack (buffer becomes ───────┘
//!                                              the new pending)
//! ```
//!
//! A rejected envelope or a revision gap leaves the replica out of step. It
//! then refuses local edits and ignores broadcasts until
//! [`OTClient::apply_snapshot`] puts it back on the server's text.
//!
//! The client never talks to a transport itself: outgoing envelopes are handed
//! to the [`OTClient::on_operation`] callback and incoming messages are fed to
//! [`OTClient::receive`].

use std::collections::VecDeque;

use crate::algebra::{apply, compose, invert, transform, transform_pair, Priority};
use crate::edit::Edit;
use crate::error::{OtError, Result};
use crate::protocol::{ClientId, EditEnvelope, EnvelopeId, RejectReason, ServerMessage, Snapshot};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Maximum depth of the undo and redo stacks
    pub max_undo: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { max_undo: 100 }
    }
}

/// Where the replica stands relative to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    /// Everything local has been acknowledged.
    Synchronized,
    /// One envelope is in flight.
    AwaitingAck {
        /// Sent and not yet acknowledged
        pending: EditEnvelope,
    },
    /// One envelope is in flight and later local edits are held back,
    /// composed into a single edit.
    AwaitingAckWithBuffer {
        /// Sent and not yet acknowledged
        pending: EditEnvelope,
        /// Applies after `pending`; sent once it is acknowledged
        buffered: Edit,
    },
}

impl SyncState {
    /// The envelope in flight, if any.
    pub fn pending(&self) -> Option<&EditEnvelope> {
        match self {
            SyncState::Synchronized => None,
            SyncState::AwaitingAck { pending } | SyncState::AwaitingAckWithBuffer { pending, .. } => {
                Some(pending)
            }
        }
    }

    /// Local edits held back behind the pending envelope.
    pub fn buffered(&self) -> Option<&Edit> {
        match self {
            SyncState::AwaitingAckWithBuffer { buffered, .. } => Some(buffered),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            SyncState::Synchronized => "Synchronized",
            SyncState::AwaitingAck { .. } => "AwaitingAck",
            SyncState::AwaitingAckWithBuffer { .. } => "AwaitingAckWithBuffer",
        }
    }
}

/// Handle returned by [`OTClient::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn FnMut(&str) + Send>;
type OperationCallback = Box<dyn FnMut(&EditEnvelope) + Send>;

/// A change the user can take back.
#[derive(Debug, Clone)]
struct UndoEntry {
    edit: Edit,
    /// Local text the edit was applied to.
    before: String,
    /// Absolute index of `edit` in the applied history.
    at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    User,
    Undo,
    Redo,
}

/// One replica's coordinator.
pub struct OTClient {
    client_id: ClientId,
    config: ClientConfig,
    /// Server text plus every unacknowledged local edit
    local_text: String,
    /// Last server revision incorporated into `local_text`
    server_revision: u64,
    state: SyncState,
    /// Set by a rejection or a revision gap, cleared by a snapshot
    awaiting_snapshot: bool,
    undo_stack: VecDeque<UndoEntry>,
    redo_stack: VecDeque<UndoEntry>,
    /// Every edit applied to `local_text` that an undo entry may still need
    /// to be transformed past. `history[0]` has absolute index `history_start`.
    history: VecDeque<Edit>,
    history_start: u64,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_subscription: u64,
    on_operation: Option<OperationCallback>,
}

impl OTClient {
    /// An empty replica at revision 0. Apply the document's snapshot first.
    pub fn new(client_id: ClientId) -> Self {
        Self::with_config(client_id, ClientConfig::default())
    }

    pub fn with_config(client_id: ClientId, config: ClientConfig) -> Self {
        Self {
            client_id,
            config,
            local_text: String::new(),
            server_revision: 0,
            state: SyncState::Synchronized,
            awaiting_snapshot: false,
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            history: VecDeque::new(),
            history_start: 0,
            listeners: Vec::new(),
            next_subscription: 0,
            on_operation: None,
        }
    }

    /// Register the sink for outgoing envelopes. Called once per envelope
    /// that becomes pending.
    pub fn on_operation(&mut self, callback: impl FnMut(&EditEnvelope) + Send + 'static) {
        self.on_operation = Some(Box::new(callback));
    }

    /// Register a listener for the local text.
    pub fn subscribe(&mut self, listener: impl FnMut(&str) + Send + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Returns whether a listener was removed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sid, _)| *sid != id);
        self.listeners.len() != before
    }

    // ── Local edits ──────────────────────────────────────────

    /// Apply a user edit optimistically and queue it for the server.
    pub fn apply_local(&mut self, edit: Edit) -> Result<()> {
        self.commit_local(edit, Origin::User)
    }

    /// Insert `text` at `position` of the local text.
    pub fn insert(&mut self, position: usize, text: impl Into<String>) -> Result<()> {
        let edit = Edit::insert(self.local_len(), position, text)?;
        self.apply_local(edit)
    }

    /// Remove `length` chars at `position` of the local text.
    pub fn delete(&mut self, position: usize, length: usize) -> Result<()> {
        let edit = Edit::delete(self.local_len(), position, length)?;
        self.apply_local(edit)
    }

    /// Replace `length` chars at `position` of the local text with `text`.
    pub fn replace(&mut self, position: usize, length: usize, text: impl Into<String>) -> Result<()> {
        let edit = Edit::replace(self.local_len(), position, length, text)?;
        self.apply_local(edit)
    }

    /// Revert the most recent undoable change, accounting for everything
    /// applied since.
    pub fn undo(&mut self) -> Result<()> {
        let entry = self.undo_stack.pop_back().ok_or(OtError::NothingToUndo)?;
        self.revert(entry, Origin::Undo)
    }

    /// Reapply the most recently undone change.
    pub fn redo(&mut self) -> Result<()> {
        let entry = self.redo_stack.pop_back().ok_or(OtError::NothingToRedo)?;
        self.revert(entry, Origin::Redo)
    }

    fn revert(&mut self, entry: UndoEntry, origin: Origin) -> Result<()> {
        let result = self
            .rebased_inverse(&entry)
            .and_then(|inverse| self.commit_local(inverse, origin));
        if result.is_err() {
            match origin {
                Origin::Redo => self.redo_stack.push_back(entry),
                _ => self.undo_stack.push_back(entry),
            }
        }
        result
    }

    /// Inverse of `entry.edit`, transformed to apply to the current text.
    fn rebased_inverse(&self, entry: &UndoEntry) -> Result<Edit> {
        let mut inverse = invert(&entry.edit, &entry.before)?;
        let skip = (entry.at + 1).saturating_sub(self.history_start) as usize;
        for later in self.history.iter().skip(skip) {
            inverse = transform(&inverse, later, Priority::Right)?;
        }
        Ok(inverse)
    }

    fn commit_local(&mut self, edit: Edit, origin: Origin) -> Result<()> {
        if self.awaiting_snapshot {
            return Err(OtError::NeedsResync);
        }
        let text = apply(&self.local_text, &edit)?;
        if edit.is_noop() {
            return Ok(());
        }
        let (state, fresh) = self.enqueue(&edit)?;

        let before = std::mem::replace(&mut self.local_text, text);
        self.state = state;
        let at = self.push_history(edit.clone());
        let entry = UndoEntry { edit, before, at };
        match origin {
            Origin::User => {
                self.redo_stack.clear();
                push_bounded(&mut self.undo_stack, entry, self.config.max_undo);
            }
            Origin::Undo => push_bounded(&mut self.redo_stack, entry, self.config.max_undo),
            Origin::Redo => push_bounded(&mut self.undo_stack, entry, self.config.max_undo),
        }
        self.trim_history();

        log::debug!(
            "Client {} applied {origin:?} edit, now {}",
            self.client_id,
            self.state.name()
        );
        if fresh {
            self.emit_pending();
        }
        self.notify();
        Ok(())
    }

    /// The state after queuing `edit`, and whether a new envelope went pending.
    fn enqueue(&self, edit: &Edit) -> Result<(SyncState, bool)> {
        Ok(match &self.state {
            SyncState::Synchronized => {
                let pending = EditEnvelope::new(self.client_id, self.server_revision, edit.clone());
                (SyncState::AwaitingAck { pending }, true)
            }
            SyncState::AwaitingAck { pending } => (
                SyncState::AwaitingAckWithBuffer {
                    pending: pending.clone(),
                    buffered: edit.clone(),
                },
                false,
            ),
            SyncState::AwaitingAckWithBuffer { pending, buffered } => (
                SyncState::AwaitingAckWithBuffer {
                    pending: pending.clone(),
                    buffered: compose(buffered, edit)?,
                },
                false,
            ),
        })
    }

    // ── Server messages ──────────────────────────────────────

    /// Feed one message from the server.
    pub fn receive(&mut self, msg: ServerMessage) -> Result<()> {
        match msg {
            ServerMessage::Ack { id, revision, .. } => self.apply_ack(id, revision),
            ServerMessage::Remote { revision, edit, .. } => self.apply_remote(revision, edit),
            ServerMessage::Snapshot { text, revision } => {
                self.apply_snapshot(Snapshot { text, revision });
                Ok(())
            }
            ServerMessage::Rejected { id, reason } => self.apply_rejection(id, reason),
        }
    }

    /// Our pending envelope was committed at `revision`.
    pub fn apply_ack(&mut self, id: EnvelopeId, revision: u64) -> Result<()> {
        if self.awaiting_snapshot {
            log::debug!(
                "Client {} ignoring ack {id} while waiting for a snapshot",
                self.client_id
            );
            return Ok(());
        }
        if !self.check_sequence(revision)? {
            log::debug!("Client {} ignoring duplicate ack {id}", self.client_id);
            return Ok(());
        }

        let state = std::mem::replace(&mut self.state, SyncState::Synchronized);
        let (next, fresh) = match state {
            SyncState::AwaitingAck { pending } if pending.id == id => (SyncState::Synchronized, false),
            SyncState::AwaitingAckWithBuffer { pending, buffered } if pending.id == id => {
                let pending = EditEnvelope::new(self.client_id, revision, buffered);
                (SyncState::AwaitingAck { pending }, true)
            }
            other => {
                self.state = other;
                log::warn!("Client {} got ack for unknown envelope {id}", self.client_id);
                return Err(OtError::UnexpectedAck(id));
            }
        };

        self.server_revision = revision;
        self.state = next;
        log::debug!(
            "Client {} acked at revision {revision}, now {}",
            self.client_id,
            self.state.name()
        );
        if fresh {
            self.emit_pending();
        }
        self.notify();
        Ok(())
    }

    /// Another client's edit was committed at `revision`.
    pub fn apply_remote(&mut self, revision: u64, edit: Edit) -> Result<()> {
        if self.awaiting_snapshot {
            log::debug!(
                "Client {} ignoring remote {revision} while waiting for a snapshot",
                self.client_id
            );
            return Ok(());
        }
        if !self.check_sequence(revision)? {
            log::debug!("Client {} ignoring duplicate remote {revision}", self.client_id);
            return Ok(());
        }

        let (state, applied) = match &self.state {
            SyncState::Synchronized => (SyncState::Synchronized, edit),
            SyncState::AwaitingAck { pending } => {
                let (remote, mine) = transform_pair(&edit, &pending.edit, Priority::Left)?;
                let pending = rebased(pending, revision, mine);
                (SyncState::AwaitingAck { pending }, remote)
            }
            SyncState::AwaitingAckWithBuffer { pending, buffered } => {
                let (remote, mine) = transform_pair(&edit, &pending.edit, Priority::Left)?;
                let (remote, buffered) = transform_pair(&remote, buffered, Priority::Left)?;
                let pending = rebased(pending, revision, mine);
                (SyncState::AwaitingAckWithBuffer { pending, buffered }, remote)
            }
        };
        let text = apply(&self.local_text, &applied)?;

        self.local_text = text;
        self.server_revision = revision;
        self.state = state;
        self.push_history(applied);
        self.trim_history();

        log::debug!(
            "Client {} applied remote revision {revision}, now {}",
            self.client_id,
            self.state.name()
        );
        self.notify();
        Ok(())
    }

    /// Reset to the server's state. Anything unacknowledged is dropped.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) {
        if let Some(pending) = self.state.pending() {
            log::warn!(
                "Client {} dropping unacknowledged envelope {} on snapshot",
                self.client_id, pending.id
            );
        }
        self.local_text = snapshot.text;
        self.server_revision = snapshot.revision;
        self.state = SyncState::Synchronized;
        self.awaiting_snapshot = false;
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.history_start += self.history.len() as u64;
        self.history.clear();
        log::debug!(
            "Client {} synchronised at revision {}",
            self.client_id, snapshot.revision
        );
        self.notify();
    }

    fn apply_rejection(&mut self, id: EnvelopeId, reason: RejectReason) -> Result<()> {
        let err = reason.into_error();
        if self.state.pending().is_some_and(|p| p.id == id) {
            log::warn!(
                "Client {} envelope {id} rejected ({err}), waiting for snapshot",
                self.client_id
            );
            self.state = SyncState::Synchronized;
            self.awaiting_snapshot = true;
        }
        Err(err)
    }

    /// `Ok(false)` for an already-seen revision, `Ok(true)` for the next one.
    /// A gap leaves the replica waiting for a snapshot.
    fn check_sequence(&mut self, revision: u64) -> Result<bool> {
        if revision <= self.server_revision {
            return Ok(false);
        }
        let expected = self.server_revision.saturating_add(1);
        if revision != expected {
            log::warn!(
                "Client {} missed revisions: expected {expected}, got {revision}",
                self.client_id
            );
            self.awaiting_snapshot = true;
            return Err(OtError::RevisionGap {
                expected,
                got: revision,
            });
        }
        Ok(true)
    }

    /// The in-flight envelope, unchanged, for a transport retry.
    pub fn resend_pending(&self) -> Option<EditEnvelope> {
        self.state.pending().cloned()
    }

    // ── History ──────────────────────────────────────────────

    fn push_history(&mut self, edit: Edit) -> u64 {
        let at = self.history_start + self.history.len() as u64;
        self.history.push_back(edit);
        at
    }

    /// Drop history no undo or redo entry needs any more.
    fn trim_history(&mut self) {
        let oldest = self
            .undo_stack
            .iter()
            .chain(self.redo_stack.iter())
            .map(|entry| entry.at)
            .min();
        let keep_from = oldest.map_or(self.history_start + self.history.len() as u64, |at| at + 1);
        while self.history_start < keep_from && self.history.pop_front().is_some() {
            self.history_start += 1;
        }
    }

    fn emit_pending(&mut self) {
        if let (Some(callback), Some(pending)) = (self.on_operation.as_mut(), self.state.pending()) {
            callback(pending);
        }
    }

    fn notify(&mut self) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(&self.local_text);
        }
    }

    // ── Accessors ────────────────────────────────────────────

    fn local_len(&self) -> usize {
        self.local_text.chars().count()
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Local text, including unacknowledged edits.
    pub fn text(&self) -> &str {
        &self.local_text
    }

    /// Last server revision this replica has incorporated.
    pub fn revision(&self) -> u64 {
        self.server_revision
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    /// Whether local edits are refused until a snapshot is applied.
    pub fn needs_resync(&self) -> bool {
        self.awaiting_snapshot
    }

    pub fn pending(&self) -> Option<&EditEnvelope> {
        self.state.pending()
    }

    pub fn buffered(&self) -> Option<&Edit> {
        self.state.buffered()
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }
}

/// `pending` carried over a remote commit: same identity, new base.
fn rebased(pending: &EditEnvelope, revision: u64, edit: Edit) -> EditEnvelope {
    EditEnvelope {
        base_revision: revision,
        edit,
        ..pending.clone()
    }
}

fn push_bounded(stack: &mut VecDeque<UndoEntry>, entry: UndoEntry, max: usize) {
    stack.push_back(entry);
    while stack.len() > max {
        stack.pop_front();
    }
}
