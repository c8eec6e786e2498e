//! Per-session tunnel state and the message sequencer.
//!
//! A [`Session`] is the whole cross-request state of one tunnel: the
//! lifecycle flag, one sequence cursor per direction, the reorder buffer for
//! inbound batches that arrived early, and the two mailbox queues shared by
//! request handlers and the engine.
//!
//! Inbound batches are numbered by the client. A batch at the expected
//! sequence is appended to the incoming queue together with any contiguous
//! run already waiting in the reorder buffer; a batch from the future is
//! parked; a batch from the past is a retry of something already applied and
//! is discarded. Outbound messages are paginated: every non-empty drain takes
//! a bounded prefix of the outgoing queue and consumes one outbound sequence
//! number.

use crate::message::Message;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Maximum number of messages returned by one drain.
pub const DEFAULT_DRAIN_LIMIT: usize = 64;

/// How far ahead of the expected sequence an inbound batch may be parked.
/// Bounds the reorder buffer to this many batches.
pub const REORDER_WINDOW: u64 = 256;

/// Result of submitting an inbound batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// The batch was in order. `batches` counts it plus every buffered
    /// batch that became contiguous and was applied behind it.
    Applied { batches: usize },
    /// The batch is ahead of the cursor and waits in the reorder buffer.
    Buffered,
    /// The batch is behind the cursor (a retry) and was discarded.
    Stale { expected: u64 },
    /// The batch is further ahead than [`REORDER_WINDOW`] and was discarded.
    OutOfWindow { expected: u64 },
}

/// A page of outbound messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundBatch {
    /// Outbound sequence number of this page.
    pub seq: u64,
    pub msgs: Vec<Message>,
}

/// Durable state of one tunnel session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    running: bool,
    inbound_seq: u64,
    outbound_seq: u64,
    /// Inbound batches strictly ahead of `inbound_seq`.
    inbound_reorder_buffer: BTreeMap<u64, Vec<Message>>,
    incoming_queue: VecDeque<Message>,
    outgoing_queue: VecDeque<Message>,
    heartbeat: u64,
}

impl Session {
    /// A fresh, running session with both cursors at zero.
    pub fn new() -> Self {
        Self {
            running: true,
            ..Self::default()
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Clear the lifecycle flag. The engine notices on its next iteration.
    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn inbound_seq(&self) -> u64 {
        self.inbound_seq
    }

    pub fn outbound_seq(&self) -> u64 {
        self.outbound_seq
    }

    pub fn heartbeat(&self) -> u64 {
        self.heartbeat
    }

    /// Record one engine iteration.
    pub fn beat(&mut self) {
        self.heartbeat = self.heartbeat.wrapping_add(1);
    }

    /// Number of batches parked in the reorder buffer.
    pub fn buffered_batches(&self) -> usize {
        self.inbound_reorder_buffer.len()
    }

    pub fn incoming_len(&self) -> usize {
        self.incoming_queue.len()
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing_queue.len()
    }

    /// Submit a client batch numbered `seq`.
    pub fn submit_inbound(&mut self, seq: u64, batch: Vec<Message>) -> Submission {
        if seq < self.inbound_seq {
            return Submission::Stale {
                expected: self.inbound_seq,
            };
        }

        if seq - self.inbound_seq > REORDER_WINDOW {
            return Submission::OutOfWindow {
                expected: self.inbound_seq,
            };
        }

        if seq > self.inbound_seq {
            self.inbound_reorder_buffer.insert(seq, batch);
            return Submission::Buffered;
        }

        self.incoming_queue.extend(batch);
        self.inbound_seq += 1;
        let mut batches = 1;

        while let Some(next) = self.inbound_reorder_buffer.remove(&self.inbound_seq) {
            self.incoming_queue.extend(next);
            self.inbound_seq += 1;
            batches += 1;
        }

        Submission::Applied { batches }
    }

    /// Take every reassembled inbound message, in order.
    pub fn take_incoming(&mut self) -> Vec<Message> {
        self.incoming_queue.drain(..).collect()
    }

    /// Append engine-produced messages to the outgoing queue.
    pub fn push_outgoing<I: IntoIterator<Item = Message>>(&mut self, msgs: I) {
        self.outgoing_queue.extend(msgs);
    }

    /// Remove up to `limit` messages from the head of the outgoing queue.
    ///
    /// A non-empty page consumes the current outbound sequence number. An
    /// empty page carries the current number without consuming it, so the
    /// client only ever sees each number attached to one set of messages.
    pub fn drain_outbound(&mut self, limit: usize) -> OutboundBatch {
        let take = limit.min(self.outgoing_queue.len());
        let msgs: Vec<Message> = self.outgoing_queue.drain(..take).collect();
        let seq = self.outbound_seq;
        if !msgs.is_empty() {
            self.outbound_seq += 1;
        }
        OutboundBatch { seq, msgs }
    }
}
