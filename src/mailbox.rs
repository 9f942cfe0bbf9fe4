//! Raw per-rank message queues.
//!
//! These are low-level byte carriers. Use the typed wrappers on
//! [`Communicator`](crate::Communicator).

use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Context id of the world communicator.
pub(crate) const WORLD_CONTEXT: u64 = 0;

/// Context of the packet a dying rank posts to every inbox. Never allocated.
pub(crate) const ABORT_CONTEXT: u64 = u64::MAX;

/// One encoded message in flight.
#[derive(Debug)]
pub(crate) struct Packet {
    pub context: u64,
    /// World rank of the sender.
    pub source: usize,
    pub tag: i32,
    pub payload: Vec<u8>,
}

impl Packet {
    fn matches(&self, context: u64, source: usize, tag: i32) -> bool {
        self.context == context && self.source == source && self.tag == tag
    }
}

/// Channel ends handed to one rank when a universe is launched.
pub(crate) struct Endpoint {
    pub rank: usize,
    pub outboxes: Vec<Sender<Packet>>,
    pub inbox: Receiver<Packet>,
    pub contexts: Arc<AtomicU64>,
}

/// Create the fully connected channel mesh for `size` ranks.
pub(crate) fn mesh(size: usize) -> Vec<Endpoint> {
    let (outboxes, inboxes): (Vec<_>, Vec<_>) =
        (0..size).map(|_| crossbeam_channel::unbounded()).unzip();
    let contexts = Arc::new(AtomicU64::new(WORLD_CONTEXT + 1));
    inboxes
        .into_iter()
        .enumerate()
        .map(|(rank, inbox)| Endpoint {
            rank,
            outboxes: outboxes.clone(),
            inbox,
            contexts: Arc::clone(&contexts),
        })
        .collect()
}

/// Tell every rank that `source` is gone.
///
/// Ranks blocked in [`Mailbox::take`] wake up with [`Error::Disconnected`],
/// and so does every later `take` on those ranks. Inboxes that are already
/// closed are skipped.
pub(crate) fn abort_all(outboxes: &[Sender<Packet>], source: usize) {
    for outbox in outboxes {
        let _ = outbox.send(Packet {
            context: ABORT_CONTEXT,
            source,
            tag: 0,
            payload: Vec::new(),
        });
    }
}

/// A rank's view of the transport: senders to every rank, its own inbox, and
/// the messages that arrived before anyone asked for them.
pub(crate) struct Mailbox {
    rank: usize,
    outboxes: Vec<Sender<Packet>>,
    inbox: Receiver<Packet>,
    pending: RefCell<VecDeque<Packet>>,
    contexts: Arc<AtomicU64>,
    /// Rank whose abort packet has been seen, if any.
    aborted: Cell<Option<usize>>,
}

impl Mailbox {
    pub fn new(endpoint: Endpoint) -> Self {
        Mailbox {
            rank: endpoint.rank,
            outboxes: endpoint.outboxes,
            inbox: endpoint.inbox,
            pending: RefCell::new(VecDeque::new()),
            contexts: endpoint.contexts,
            aborted: Cell::new(None),
        }
    }

    /// World rank owning this mailbox.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of ranks in the universe.
    pub fn universe_size(&self) -> usize {
        self.outboxes.len()
    }

    /// Reserve a context id no other communicator in the universe uses.
    pub fn allocate_context(&self) -> u64 {
        self.contexts.fetch_add(1, Ordering::Relaxed)
    }

    /// Post `payload` to world rank `dest`. Never blocks.
    pub fn post(&self, dest: usize, context: u64, tag: i32, payload: Vec<u8>) -> Result<()> {
        let outbox = self.outboxes.get(dest).ok_or(Error::InvalidRank {
            rank: dest,
            size: self.outboxes.len(),
        })?;
        outbox
            .send(Packet {
                context,
                source: self.rank,
                tag,
                payload,
            })
            .map_err(|_| Error::Disconnected(dest))
    }

    /// Block until a message from world rank `source` with `(context, tag)` arrives.
    ///
    /// Parked messages are searched first, oldest first, so messages sharing
    /// `(context, source, tag)` are taken in the order they were posted.
    ///
    /// Once any rank has aborted, every call that finds no parked match fails
    /// with [`Error::Disconnected`] naming that rank.
    pub fn take(&self, context: u64, source: usize, tag: i32) -> Result<Vec<u8>> {
        {
            let mut pending = self.pending.borrow_mut();
            if let Some(pos) = pending
                .iter()
                .position(|p| p.matches(context, source, tag))
            {
                if let Some(packet) = pending.remove(pos) {
                    return Ok(packet.payload);
                }
            }
        }

        if let Some(dead) = self.aborted.get() {
            return Err(Error::Disconnected(dead));
        }

        loop {
            let packet = self
                .inbox
                .recv()
                .map_err(|_| Error::Disconnected(self.rank))?;
            if packet.context == ABORT_CONTEXT {
                tracing::debug!(rank = self.rank, dead = packet.source, "peer aborted");
                self.aborted.set(Some(packet.source));
                return Err(Error::Disconnected(packet.source));
            }
            if packet.matches(context, source, tag) {
                return Ok(packet.payload);
            }
            tracing::trace!(
                context = packet.context,
                source = packet.source,
                tag = packet.tag,
                "parking unmatched message"
            );
            self.pending.borrow_mut().push_back(packet);
        }
    }
}
