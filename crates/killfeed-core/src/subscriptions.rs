//! Local view of the system subscription.
//!
//! Subscribe and unsubscribe commands change the visible set as soon as they
//! are sent. Each change is also kept as a pending operation keyed by its
//! correlation id until the server answers: an `ok` reply commits it, any
//! other reply drops it again. The visible set is always the confirmed set
//! with every pending, not-failed operation applied in send order.
//!
//! The queue is bounded. Once more than `limit` operations are waiting, the
//! oldest unanswered one is given up on and rolled back as if the server had
//! refused it, which also lets the answered ones behind it commit.

use killfeed_protocol::{Ref, SystemId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Default bound on operations waiting for a reply.
pub const DEFAULT_PENDING_LIMIT: usize = 1024;

/// Kind of subscription change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone)]
struct PendingOp {
    kind: OpKind,
    systems: Vec<SystemId>,
    /// `None` until the reply arrives, then whether it was `ok`.
    outcome: Option<bool>,
}

impl PendingOp {
    fn apply(&self, set: &mut BTreeSet<SystemId>) {
        match self.kind {
            OpKind::Subscribe => set.extend(self.systems.iter().copied()),
            OpKind::Unsubscribe => {
                for system in &self.systems {
                    set.remove(system);
                }
            }
        }
    }
}

/// Confirmed subscriptions plus operations awaiting a reply.
#[derive(Debug, Clone)]
pub struct SubscriptionLedger {
    confirmed: BTreeSet<SystemId>,
    pending: BTreeMap<Ref, PendingOp>,
    limit: usize,
}

impl Default for SubscriptionLedger {
    fn default() -> Self {
        Self::with_limit(DEFAULT_PENDING_LIMIT)
    }
}

impl SubscriptionLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty ledger holding at most `limit` pending operations.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            confirmed: BTreeSet::new(),
            pending: BTreeMap::new(),
            limit: limit.max(1),
        }
    }

    /// Record a sent operation and return the resulting visible set.
    pub fn record(
        &mut self,
        reference: Ref,
        kind: OpKind,
        systems: &[SystemId],
    ) -> BTreeSet<SystemId> {
        self.pending.insert(
            reference,
            PendingOp {
                kind,
                systems: systems.to_vec(),
                outcome: None,
            },
        );
        while self.pending.len() > self.limit {
            self.expire_oldest();
        }
        self.current()
    }

    /// Apply the server's answer to a pending operation.
    ///
    /// Returns the operation kind, or `None` if the reference is not a
    /// pending subscription change.
    pub fn resolve(&mut self, reference: Ref, ok: bool) -> Option<OpKind> {
        let op = self.pending.get_mut(&reference)?;
        if op.outcome.is_some() {
            return None;
        }
        op.outcome = Some(ok);
        let kind = op.kind;

        if !ok {
            debug!(reference = %reference, ?kind, systems = ?op.systems, "Rolling back subscription change");
        }

        self.settle();
        Some(kind)
    }

    /// Forget an operation that never reached the server.
    pub fn discard(&mut self, reference: Ref) {
        if let Some(op) = self.pending.get_mut(&reference) {
            op.outcome = Some(false);
            self.settle();
        }
    }

    fn expire_oldest(&mut self) {
        if let Some(mut entry) = self.pending.first_entry() {
            let reference = *entry.key();
            let op = entry.get_mut();
            warn!(reference = %reference, kind = ?op.kind, systems = ?op.systems, "Giving up on unanswered subscription change");
            op.outcome = Some(false);
        }
        self.settle();
    }

    /// Fold answered operations at the front of the queue into the confirmed
    /// set. Stops at the first unanswered one so commits keep send order.
    fn settle(&mut self) {
        while let Some(entry) = self.pending.first_entry() {
            match entry.get().outcome {
                Some(true) => {
                    let op = entry.remove();
                    op.apply(&mut self.confirmed);
                }
                Some(false) => {
                    entry.remove();
                }
                None => break,
            }
        }
    }

    /// The visible subscription set.
    #[must_use]
    pub fn current(&self) -> BTreeSet<SystemId> {
        let mut set = self.confirmed.clone();
        for op in self.pending.values() {
            if op.outcome != Some(false) {
                op.apply(&mut set);
            }
        }
        set
    }

    /// Subscriptions the server has acknowledged.
    #[must_use]
    pub fn confirmed(&self) -> &BTreeSet<SystemId> {
        &self.confirmed
    }

    /// Number of operations still waiting on, or queued behind, a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Check if a reference is a pending subscription change.
    #[must_use]
    pub fn is_pending(&self, reference: Ref) -> bool {
        self.pending
            .get(&reference)
            .is_some_and(|op| op.outcome.is_none())
    }
}
