//! The single authority for one document.
//!
//! ```text
//!  envelope ──▶ replay guard ──▶ staleness check ──▶ transform past log suffix
//!                  │                                          │
//!                  ▼                                          ▼
//!          Receipt::Replayed                       apply ─▶ revision += 1
//!                                                             │
//!                                                   log.push ─┴─▶ Receipt::Committed
//! ```
//!
//! The server is a plain value driven through `&mut self`; callers that share
//! it between tasks serialise access (see [`crate::room`]).

use std::collections::VecDeque;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::algebra::{apply, transform, Priority};
use crate::error::{OtError, Result};
use crate::protocol::{EditEnvelope, EnvelopeId, Snapshot};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Committed envelopes remembered for duplicate detection
    pub replay_window: usize,
    /// Log entries retained for transforming late submissions
    pub max_log_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            replay_window: 1024,
            max_log_len: 10_000,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Envelopes applied to the document
    pub commits: u64,
    /// Resubmissions answered from the replay window
    pub replays: u64,
    /// Envelopes refused as stale, malformed or incompatible
    pub rejections: u64,
}

/// Outcome of a successful [`OTServer::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Receipt {
    /// Newly committed; broadcast it.
    Committed(EditEnvelope),
    /// Seen before; this is the earlier commit, nothing changed.
    Replayed(EditEnvelope),
}

impl Receipt {
    /// The committed envelope, with its revision set.
    pub fn envelope(&self) -> &EditEnvelope {
        match self {
            Receipt::Committed(envelope) | Receipt::Replayed(envelope) => envelope,
        }
    }

    pub fn into_envelope(self) -> EditEnvelope {
        match self {
            Receipt::Committed(envelope) | Receipt::Replayed(envelope) => envelope,
        }
    }

    /// Whether the envelope had been committed before.
    pub fn is_replay(&self) -> bool {
        matches!(self, Receipt::Replayed(_))
    }
}

/// Authoritative document state, revision counter and edit log.
pub struct OTServer {
    config: ServerConfig,
    /// Authoritative document text
    text: String,
    /// Number of commits applied since revision 0
    revision: u64,
    /// Committed envelopes, newest last; the last entry has `revision`.
    log: VecDeque<EditEnvelope>,
    /// Recently committed envelopes by id, for duplicate detection
    recent: LruCache<EnvelopeId, EditEnvelope>,
    stats: ServerStats,
}

impl OTServer {
    /// A document at revision 0 with the default configuration.
    pub fn new(text: impl Into<String>) -> Self {
        Self::with_config(text, ServerConfig::default())
    }

    pub fn with_config(text: impl Into<String>, config: ServerConfig) -> Self {
        Self::from_snapshot(
            Snapshot {
                text: text.into(),
                revision: 0,
            },
            config,
        )
    }

    /// Resume from a stored snapshot. Clients based on earlier revisions
    /// will be told to resynchronise.
    pub fn from_snapshot(snapshot: Snapshot, config: ServerConfig) -> Self {
        let window = NonZeroUsize::new(config.replay_window).unwrap_or(NonZeroUsize::MIN);
        Self {
            text: snapshot.text,
            revision: snapshot.revision,
            log: VecDeque::new(),
            recent: LruCache::new(window),
            stats: ServerStats::default(),
            config,
        }
    }

    /// Accept a client envelope: dedupe, transform, apply, log.
    ///
    /// On error the document, revision and log are untouched.
    pub fn receive(&mut self, envelope: EditEnvelope) -> Result<Receipt> {
        if let Some(previous) = self.recent.get(&envelope.id) {
            self.stats.replays += 1;
            log::debug!(
                "Replayed envelope {} from {} (revision {:?})",
                envelope.id, envelope.client_id, previous.revision
            );
            return Ok(Receipt::Replayed(previous.clone()));
        }

        let id = envelope.id;
        let client_id = envelope.client_id;
        match self.commit(envelope) {
            Ok(committed) => Ok(Receipt::Committed(committed)),
            Err(e) => {
                self.stats.rejections += 1;
                log::warn!("Rejected envelope {id} from {client_id}: {e}");
                Err(e)
            }
        }
    }

    fn commit(&mut self, envelope: EditEnvelope) -> Result<EditEnvelope> {
        let start = self.suffix_start(envelope.base_revision)?;

        let EditEnvelope {
            id,
            client_id,
            base_revision,
            mut edit,
            timestamp,
            ..
        } = envelope;

        // Earlier commits keep their inserts ahead of ours.
        for logged in self.log.range(start..) {
            edit = transform(&edit, &logged.edit, Priority::Right)?;
        }
        let text = apply(&self.text, &edit)?;

        self.text = text;
        self.revision += 1;
        let committed = EditEnvelope {
            id,
            client_id,
            base_revision: self.revision - 1,
            edit,
            timestamp,
            revision: Some(self.revision),
        };

        self.log.push_back(committed.clone());
        while self.log.len() > self.config.max_log_len {
            self.log.pop_front();
        }
        self.recent.put(id, committed.clone());
        self.stats.commits += 1;

        log::debug!(
            "Committed {id} from {client_id} at revision {} (based on {base_revision})",
            self.revision
        );
        Ok(committed)
    }

    /// Index of the first log entry newer than `base_revision`.
    fn suffix_start(&self, base_revision: u64) -> Result<usize> {
        let oldest = self.oldest_base();
        if base_revision > self.revision || base_revision < oldest {
            return Err(OtError::StaleEnvelope {
                base_revision,
                oldest,
                current: self.revision,
            });
        }
        Ok(self.log.len() - (self.revision - base_revision) as usize)
    }

    /// Oldest revision a submission may still be based on.
    pub fn oldest_base(&self) -> u64 {
        self.revision - self.log.len() as u64
    }

    /// Committed envelopes after `revision`, for catching a client up.
    pub fn edits_since(&self, revision: u64) -> Result<Vec<EditEnvelope>> {
        let start = self.suffix_start(revision)?;
        Ok(self.log.range(start..).cloned().collect())
    }

    /// Current text and revision.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            text: self.text.clone(),
            revision: self.revision,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Entries currently held in the log.
    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edit::Edit;
    use crate::protocol::ClientId;

    fn envelope(base_revision: u64, edit: Edit) -> EditEnvelope {
        EditEnvelope::new(ClientId::new(), base_revision, edit)
    }

    #[test]
    fn test_sequential_commits() {
        let mut server = OTServer::new("hello");
        let r1 = server
            .receive(envelope(0, Edit::insert(5, 5, "!").unwrap()))
            .unwrap();
        assert!(!r1.is_replay());
        assert_eq!(r1.envelope().revision, Some(1));
        assert_eq!(server.text(), "hello!");

        server
            .receive(envelope(1, Edit::delete(6, 0, 1).unwrap()))
            .unwrap();
        assert_eq!(server.text(), "ello!");
        assert_eq!(server.revision(), 2);
        assert_eq!(server.log_len(), 2);
    }

    #[test]
    fn test_late_submission_is_transformed() {
        let mut server = OTServer::new("hello");
        server
            .receive(envelope(0, Edit::insert(5, 5, " world").unwrap()))
            .unwrap();
        let receipt = server
            .receive(envelope(0, Edit::delete(5, 0, 5).unwrap()))
            .unwrap();

        assert_eq!(server.text(), " world");
        let committed = receipt.into_envelope();
        assert_eq!(committed.base_revision, 1);
        assert_eq!(committed.revision, Some(2));
        assert_eq!(committed.edit, Edit::delete(11, 0, 5).unwrap());
    }

    #[test]
    fn test_first_commit_wins_insert_tie() {
        let mut server = OTServer::new("abc");
        server
            .receive(envelope(0, Edit::insert(3, 2, "X").unwrap()))
            .unwrap();
        server
            .receive(envelope(0, Edit::insert(3, 2, "Y").unwrap()))
            .unwrap();
        assert_eq!(server.text(), "abXYc");
    }

    #[test]
    fn test_duplicate_is_replayed() {
        let mut server = OTServer::new("abc");
        let env = envelope(0, Edit::insert(3, 0, "z").unwrap());
        let first = server.receive(env.clone()).unwrap();
        let second = server.receive(env).unwrap();

        assert!(second.is_replay());
        assert_eq!(first.envelope(), second.envelope());
        assert_eq!(server.revision(), 1);
        assert_eq!(server.text(), "zabc");
        assert_eq!(
            server.stats(),
            &ServerStats {
                commits: 1,
                replays: 1,
                rejections: 0
            }
        );
    }

    #[test]
    fn test_future_base_is_stale() {
        let mut server = OTServer::new("abc");
        let err = server
            .receive(envelope(3, Edit::insert(3, 0, "z").unwrap()))
            .unwrap_err();
        assert_eq!(
            err,
            OtError::StaleEnvelope {
                base_revision: 3,
                oldest: 0,
                current: 0
            }
        );
        assert_eq!(server.stats().rejections, 1);
    }

    #[test]
    fn test_truncated_log_rejects_old_base() {
        let config = ServerConfig {
            max_log_len: 2,
            ..ServerConfig::default()
        };
        let mut server = OTServer::with_config("", config);
        for (rev, c) in ["a", "b", "c"].iter().enumerate() {
            server
                .receive(envelope(rev as u64, Edit::insert(rev, rev, *c).unwrap()))
                .unwrap();
        }
        assert_eq!(server.log_len(), 2);
        assert_eq!(server.oldest_base(), 1);

        let err = server
            .receive(envelope(0, Edit::insert(0, 0, "z").unwrap()))
            .unwrap_err();
        assert!(err.requires_resync());

        server
            .receive(envelope(1, Edit::insert(1, 0, "z").unwrap()))
            .unwrap();
        assert_eq!(server.text(), "zabc");
    }

    #[test]
    fn test_malformed_edit_leaves_state_untouched() {
        let mut server = OTServer::new("abc");
        let err = server
            .receive(envelope(0, Edit::insert(5, 0, "z").unwrap()))
            .unwrap_err();
        assert!(matches!(err, OtError::IncompatibleEdit { .. } | OtError::MalformedEdit(_)));
        assert_eq!(server.text(), "abc");
        assert_eq!(server.revision(), 0);
        assert_eq!(server.log_len(), 0);
    }

    #[test]
    fn test_decoded_oversized_edit_is_rejected() {
        use crate::edit::Component;
        use crate::protocol::ClientMessage;
        use serde::Serialize;

        // Same wire shape as `ClientMessage::Submit`, without validation.
        #[derive(Serialize)]
        enum WireMessage {
            Submit {
                id: EnvelopeId,
                client_id: ClientId,
                base_revision: u64,
                edit: WireEdit,
            },
        }
        #[derive(Serialize)]
        struct WireEdit {
            base_len: usize,
            components: Vec<Component>,
        }

        let bytes = bincode::serde::encode_to_vec(
            WireMessage::Submit {
                id: EnvelopeId::new(),
                client_id: ClientId::new(),
                base_revision: 0,
                edit: WireEdit {
                    base_len: 3,
                    components: vec![
                        Component::Retain { count: 1 },
                        Component::Retain { count: usize::MAX },
                    ],
                },
            },
            bincode::config::standard(),
        )
        .unwrap();
        let envelope = ClientMessage::decode(&bytes).unwrap().into_envelope();

        let mut server = OTServer::new("abc");
        let err = server.receive(envelope).unwrap_err();
        assert!(matches!(err, OtError::MalformedEdit(_)));
        assert_eq!(server.text(), "abc");
        assert_eq!(server.revision(), 0);
        assert_eq!(server.stats().rejections, 1);
    }

    #[test]
    fn test_edits_since() {
        let mut server = OTServer::new("");
        for rev in 0..3 {
            server
                .receive(envelope(rev, Edit::insert(rev as usize, 0, "x").unwrap()))
                .unwrap();
        }
        let tail = server.edits_since(1).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].revision, Some(2));
        assert!(server.edits_since(3).unwrap().is_empty());
        assert!(server.edits_since(4).is_err());
    }

    #[test]
    fn test_from_snapshot_resumes_revision() {
        let mut server = OTServer::from_snapshot(
            Snapshot {
                text: "abc".into(),
                revision: 9,
            },
            ServerConfig::default(),
        );
        assert!(server
            .receive(envelope(8, Edit::identity(3)))
            .unwrap_err()
            .requires_resync());
        let receipt = server.receive(envelope(9, Edit::identity(3))).unwrap();
        assert_eq!(receipt.envelope().revision, Some(10));
        assert_eq!(server.snapshot().revision, 10);
    }
}
