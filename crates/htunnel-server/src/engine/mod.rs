//! Tunnel engine: owns the TCP streams of one session and drives them from
//! the session's mailbox.
//!
//! # Submodule Architecture
//!
//! - **[`policy`]**: [`DestinationPolicy`] configuration and the
//!   [`PolicyEnforcer`](policy::PolicyEnforcer) that checks every `Connect`
//!   against the destination allowlist and the per-session stream cap.
//!
//! - **[`resolver`]**: the [`Resolve`] seam and the system [`DnsResolver`].
//!   Name resolution is an external capability: it yields one IP or a
//!   failure reason.
//!
//! - **[`streams`]**: the [`StreamManager`](streams::StreamManager): pending connects, active
//!   sockets, writes of inbound payloads, and the bounded readiness wait that
//!   turns socket events into outbound messages.
//!
//! - **[`runner`]**: the [`TunnelEngine`] loop: exchange with the session
//!   store, apply inbound messages, wait on sockets, repeat until the session
//!   stops.
//!
//! # Data Flow
//!
//! ```text
//! sync handler → Session.incoming_queue
//!   → TunnelEngine::exchange (one exclusive section)
//!     → StreamManager::handle_connect / handle_sync_in / handle_client_close
//!     → StreamManager::poll → Status / Sync messages
//!   → Session.outgoing_queue (next exchange)
//! → sync handler drains a bounded page
//! ```

pub mod policy;
pub mod resolver;
pub mod runner;
pub mod streams;

pub use policy::DestinationPolicy;
pub use resolver::{DnsResolver, Resolve};
pub use runner::TunnelEngine;

use htunnel_core::DEFAULT_DRAIN_LIMIT;
use std::time::Duration;

/// Tunables of one engine and of the pages it feeds.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound of one readiness wait; also how quickly `stop` is seen.
    pub poll_interval: Duration,
    /// Messages returned per `sync` reply.
    pub drain_limit: usize,
    /// Largest payload read from one stream per iteration.
    pub read_chunk: usize,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub policy: DestinationPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            drain_limit: DEFAULT_DRAIN_LIMIT,
            read_chunk: 48750,
            connect_timeout: Duration::from_secs(8),
            write_timeout: Duration::from_secs(10),
            policy: DestinationPolicy::default(),
        }
    }
}
