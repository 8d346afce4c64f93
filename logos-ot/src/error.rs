//! Error taxonomy shared by the algebra, client, server and rooms.

use thiserror::Error;

use crate::protocol::EnvelopeId;

/// Errors raised by the OT core.
///
/// Duplicate submissions are not errors: a replayed envelope is a
/// successful no-op (see [`crate::server::Receipt::Replayed`]).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtError {
    /// The edit does not fully and consistently span the text it targets.
    #[error("malformed edit: {0}")]
    MalformedEdit(String),

    /// Two edits combined by `transform` or `compose` disagree on length.
    #[error("incompatible edits: length {left} does not match length {right}")]
    IncompatibleEdit { left: usize, right: usize },

    /// The envelope's base revision is no longer (or not yet) reachable.
    #[error("stale envelope: base revision {base_revision} outside [{oldest}, {current}]")]
    StaleEnvelope {
        base_revision: u64,
        oldest: u64,
        current: u64,
    },

    /// A broadcast arrived out of sequence; the client must resynchronise.
    #[error("revision gap: expected {expected}, got {got}")]
    RevisionGap { expected: u64, got: u64 },

    /// An acknowledgment arrived for an envelope that is not in flight.
    #[error("unexpected ack for envelope {0}")]
    UnexpectedAck(EnvelopeId),

    /// The undo stack is empty.
    #[error("nothing to undo")]
    NothingToUndo,

    /// The redo stack is empty.
    #[error("nothing to redo")]
    NothingToRedo,

    /// A rejection or revision gap left the replica out of step with the
    /// server. Local edits are refused until a snapshot is applied.
    #[error("replica is waiting for a snapshot")]
    NeedsResync,

    /// The document room actor has shut down.
    #[error("document room closed")]
    RoomClosed,

    /// A message could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl OtError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedEdit(msg.into())
    }

    /// Whether the caller has to fetch a fresh snapshot to continue.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            Self::StaleEnvelope { .. } | Self::RevisionGap { .. } | Self::NeedsResync
        )
    }
}

pub type Result<T> = std::result::Result<T, OtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resync_classification() {
        let stale = OtError::StaleEnvelope {
            base_revision: 1,
            oldest: 5,
            current: 9,
        };
        assert!(stale.requires_resync());
        assert!(OtError::RevisionGap { expected: 3, got: 5 }.requires_resync());
        assert!(OtError::NeedsResync.requires_resync());
        assert!(!OtError::malformed("x").requires_resync());
        assert!(!OtError::IncompatibleEdit { left: 1, right: 2 }.requires_resync());
    }

    #[test]
    fn test_display_messages() {
        let err = OtError::IncompatibleEdit { left: 3, right: 4 };
        assert_eq!(
            err.to_string(),
            "incompatible edits: length 3 does not match length 4"
        );
        assert_eq!(OtError::NothingToUndo.to_string(), "nothing to undo");
    }
}
