//! htunnel-core: Shared protocol library for the HTTP TCP tunnel.
//!
//! Provides the tagged tunnel message type and its JSON/base64 wire form,
//! the per-session state entity, and the sequencer that turns retried,
//! reordered `sync` batches into an ordered inbound stream and paginates
//! the outbound backlog.

pub mod error;
pub mod message;
pub mod session;

// Re-export commonly used items at crate root.
pub use error::{TunnelError, TunnelResult};
pub use message::{status, Message, StreamId};
pub use session::{OutboundBatch, Session, Submission, DEFAULT_DRAIN_LIMIT, REORDER_WINDOW};
