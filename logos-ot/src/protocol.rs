//! Messages exchanged between clients and the document authority.
//!
//! ```text
//! Client ── Submit { id, client_id, base_revision, edit } ──▶ Server
//!                                                               │
//!        ◀── Ack { id, revision, edit } ───── (own envelope) ───┤
//!        ◀── Remote { client_id, revision, edit } ── (others) ──┤
//!        ◀── Snapshot { text, revision } ── (join / resync) ────┤
//!        ◀── Rejected { id, reason } ───── (stale / malformed) ─┘
//! ```
//!
//! Every message is serde-serialisable; [`ClientMessage::encode`] and
//! [`ServerMessage::encode`] provide a compact bincode form for transports
//! that have no format of their own.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::edit::Edit;
use crate::error::{OtError, Result};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identity of one editing replica.
    ClientId
);
uuid_id!(
    /// Unique per submission; survives retries so the server can dedupe.
    EnvelopeId
);
uuid_id!(
    /// Key of one document and its room.
    DocumentId
);

/// One edit in transit, tagged with the revision it was computed against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditEnvelope {
    /// Stable across retries of the same submission
    pub id: EnvelopeId,
    /// Author of the edit
    pub client_id: ClientId,
    /// Server revision `edit` applies to
    pub base_revision: u64,
    pub edit: Edit,
    /// Milliseconds since the Unix epoch, taken at creation.
    pub timestamp: u64,
    /// Set by the server on commit.
    pub revision: Option<u64>,
}

impl EditEnvelope {
    /// Wrap `edit` in a fresh envelope.
    pub fn new(client_id: ClientId, base_revision: u64, edit: Edit) -> Self {
        Self {
            id: EnvelopeId::new(),
            client_id,
            base_revision,
            edit,
            timestamp: now_millis(),
            revision: None,
        }
    }

    /// Whether the server has assigned a revision.
    pub fn is_committed(&self) -> bool {
        self.revision.is_some()
    }

    /// The revision this envelope has, or would get if committed right on
    /// top of its base.
    pub fn committed_revision(&self) -> u64 {
        self.revision
            .unwrap_or_else(|| self.base_revision.saturating_add(1))
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Full document state at a revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub text: String,
    /// Revision `text` is at
    pub revision: u64,
}

/// Client → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    Submit {
        id: EnvelopeId,
        client_id: ClientId,
        base_revision: u64,
        edit: Edit,
    },
}

impl ClientMessage {
    /// Rebuild the envelope on the receiving side.
    pub fn into_envelope(self) -> EditEnvelope {
        match self {
            ClientMessage::Submit {
                id,
                client_id,
                base_revision,
                edit,
            } => EditEnvelope {
                id,
                client_id,
                base_revision,
                edit,
                timestamp: now_millis(),
                revision: None,
            },
        }
    }

    /// Serialise with bincode.
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    /// Inverse of [`ClientMessage::encode`]. The edit inside is not
    /// validated here; the server checks it when applying.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

impl From<&EditEnvelope> for ClientMessage {
    fn from(envelope: &EditEnvelope) -> Self {
        ClientMessage::Submit {
            id: envelope.id,
            client_id: envelope.client_id,
            base_revision: envelope.base_revision,
            edit: envelope.edit.clone(),
        }
    }
}

/// Why the server refused an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The base revision is outside the server's log.
    Stale {
        base_revision: u64,
        oldest: u64,
        current: u64,
    },
    /// The edit does not span the text it claims to.
    Malformed(String),
    /// The edit's length disagrees with the document's.
    Incompatible {
        left: usize,
        right: usize,
    },
}

impl RejectReason {
    /// The error the client reports for this rejection.
    pub fn into_error(self) -> OtError {
        match self {
            RejectReason::Stale {
                base_revision,
                oldest,
                current,
            } => OtError::StaleEnvelope {
                base_revision,
                oldest,
                current,
            },
            RejectReason::Malformed(msg) => OtError::MalformedEdit(msg),
            RejectReason::Incompatible { left, right } => OtError::IncompatibleEdit { left, right },
        }
    }
}

impl From<&OtError> for RejectReason {
    fn from(err: &OtError) -> Self {
        match err {
            OtError::StaleEnvelope {
                base_revision,
                oldest,
                current,
            } => RejectReason::Stale {
                base_revision: *base_revision,
                oldest: *oldest,
                current: *current,
            },
            OtError::IncompatibleEdit { left, right } => RejectReason::Incompatible {
                left: *left,
                right: *right,
            },
            OtError::MalformedEdit(msg) => RejectReason::Malformed(msg.clone()),
            other => RejectReason::Malformed(other.to_string()),
        }
    }
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// The recipient's own envelope was committed.
    Ack {
        id: EnvelopeId,
        revision: u64,
        edit: Edit,
    },
    /// Another client's envelope was committed.
    Remote {
        client_id: ClientId,
        revision: u64,
        edit: Edit,
    },
    /// Full state, on join or when a replica has to start over.
    Snapshot {
        text: String,
        revision: u64,
    },
    /// The recipient's envelope was refused.
    Rejected {
        id: EnvelopeId,
        reason: RejectReason,
    },
}

impl ServerMessage {
    /// The broadcast of a committed envelope as seen by `recipient`.
    pub fn for_recipient(committed: &EditEnvelope, recipient: ClientId) -> Self {
        let revision = committed.committed_revision();
        if committed.client_id == recipient {
            ServerMessage::Ack {
                id: committed.id,
                revision,
                edit: committed.edit.clone(),
            }
        } else {
            ServerMessage::Remote {
                client_id: committed.client_id,
                revision,
                edit: committed.edit.clone(),
            }
        }
    }

    /// Rejection of envelope `id` because of `err`.
    pub fn rejected(id: EnvelopeId, err: &OtError) -> Self {
        ServerMessage::Rejected {
            id,
            reason: RejectReason::from(err),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

impl From<Snapshot> for ServerMessage {
    fn from(snapshot: Snapshot) -> Self {
        ServerMessage::Snapshot {
            text: snapshot.text,
            revision: snapshot.revision,
        }
    }
}

fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| OtError::Codec(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| OtError::Codec(e.to_string()))?;
    Ok(msg)
}
