//! The I/O queue: pairs outstanding requests with their responses.
//!
//! Two structures under separate locks: a *pending* FIFO of contexts waiting
//! to emit their next request, and a *processing* map, keyed by correlation
//! ID, of contexts that have emitted a request and await its response. A
//! context lives in at most one of the two at any moment; the transact loop
//! owns it exclusively while it is in neither. That exclusivity is what lets
//! contexts run single-threaded state machines under a preemptive caller
//! pool.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use rustc_hash::FxHashMap;
use tracing::{trace, warn};

use crate::context::Context;

/// The instance-wide I/O queue.
#[derive(Debug)]
pub struct Ioq {
    pending: Mutex<VecDeque<Box<Context>>>,
    processing: Mutex<FxHashMap<u64, Box<Context>>>,
    next_unique: AtomicU64,
}

impl Default for Ioq {
    fn default() -> Self {
        Self::new()
    }
}

#[expect(
    clippy::expect_used,
    reason = "Mutex poisoning is unrecoverable; panicking is the correct behavior"
)]
impl Ioq {
    /// An empty queue.
    #[must_use]
    pub fn new() -> Self {
        Ioq {
            pending: Mutex::new(VecDeque::new()),
            processing: Mutex::new(FxHashMap::default()),
            next_unique: AtomicU64::new(1),
        }
    }

    /// Allocate a correlation ID. Tickets are unique for the lifetime of the
    /// queue, which makes them unique across all in-flight contexts.
    pub fn allocate_unique(&self) -> u64 {
        self.next_unique.fetch_add(1, Ordering::Relaxed)
    }

    /// Append a context to the pending FIFO.
    pub fn post_pending(&self, context: Box<Context>) {
        trace!(unique = context.unique(), "post pending");
        self.pending.lock().expect("poisoned").push_back(context);
    }

    /// Pop the head of the pending FIFO.
    pub fn next_pending(&self) -> Option<Box<Context>> {
        self.pending.lock().expect("poisoned").pop_front()
    }

    /// Move a context that just emitted a request into the processing map.
    pub fn start_processing(&self, context: Box<Context>) {
        let unique = context.unique();
        trace!(unique, "start processing");
        if let Some(stale) = self
            .processing
            .lock()
            .expect("poisoned")
            .insert(unique, context)
        {
            // Tickets never repeat; a collision means a context was leaked.
            warn!(unique = stale.unique(), "processing map collision, dropping stale context");
        }
    }

    /// Remove and return the context a response correlates with. `None`
    /// means the response is spurious or late.
    pub fn end_processing(&self, unique: u64) -> Option<Box<Context>> {
        let context = self.processing.lock().expect("poisoned").remove(&unique);
        if context.is_none() {
            trace!(unique, "no context for response");
        }
        context
    }

    /// Number of contexts awaiting a response.
    #[must_use]
    pub fn processing_count(&self) -> usize {
        self.processing.lock().expect("poisoned").len()
    }

    /// Number of contexts awaiting a send.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("poisoned").len()
    }

    /// Empty both structures, returning every queued context so the caller
    /// can run their release logic. Used at instance teardown.
    pub fn drain(&self) -> Vec<Box<Context>> {
        let mut drained: Vec<Box<Context>> =
            self.pending.lock().expect("poisoned").drain(..).collect();
        drained.extend(
            self.processing
                .lock()
                .expect("poisoned")
                .drain()
                .map(|(_, context)| context),
        );
        drained
    }
}
