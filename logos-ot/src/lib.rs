//! # logos-ot: Operational-transform synchronization for plain text
//!
//! One server arbitrates, clients edit optimistically and buffer, and every
//! replica converges on the same text.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ClientMessage    ┌──────────────┐
//! │  OTClient   │ ─────────────────► │ DocumentRoom │
//! │ (per user)  │ ◄───────────────── │ (tokio task) │
//! └──────┬──────┘   ServerMessage    └──────┬───────┘
//!        │                                  │
//!        ▼                                  ▼
//! ┌─────────────┐                    ┌──────────────┐
//! │ local text  │                    │   OTServer   │
//! │ + pending   │                    │ (authority)  │
//! │ + buffered  │                    └──────┬───────┘
//! └─────────────┘                           │
//!                                   ┌───────┴───────┐
//!                                   │ revision log  │
//!                                   │ replay window │
//!                                   └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`edit`]: `Component` / `Edit` model and validation
//! - [`algebra`]: `apply`, `compose`, `transform`, `invert`
//! - [`protocol`]: envelopes and messages, optional bincode codec
//! - [`client`]: per-replica state machine with undo/redo
//! - [`server`]: revision log and transformation of late submissions
//! - [`room`]: per-document actor and fan-out
//!
//! Positions and lengths are counted in `char`s throughout.

pub mod algebra;
pub mod client;
pub mod edit;
pub mod error;
pub mod protocol;
pub mod room;
pub mod server;

// Re-exports for convenience
pub use algebra::{apply, compose, invert, transform, transform_pair, Priority};
pub use client::{ClientConfig, OTClient, SubscriptionId, SyncState};
pub use edit::{Component, Edit};
pub use error::{OtError, Result};
pub use protocol::{
    ClientId, ClientMessage, DocumentId, EditEnvelope, EnvelopeId, RejectReason, ServerMessage,
    Snapshot,
};
pub use room::{DocumentRoom, Membership, RoomConfig, RoomManager};
pub use server::{OTServer, Receipt, ServerConfig, ServerStats};
