use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use log::debug;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::errors::{MontageError, Result};
use crate::types::{Decision, NodeId, ParticipantResources, ResourceId, TransactionId};

/// Where a transaction stands from the coordinator's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    Init,
    AwaitingVotes,
    Decided,
    AwaitingAcks,
    Complete,
}

#[derive(Debug)]
struct Progress {
    phase: TransactionPhase,
    votes: HashMap<NodeId, Decision>,
    acks: HashSet<NodeId>,
    decision: Option<Decision>,
}

/// Vote and acknowledgment bookkeeping for one transaction.
///
/// Votes are deduplicated per participant (the first vote a participant
/// casts is the one that counts) and acknowledgments are a set, so messages
/// that are re-sent after a crash or a retry never count twice. Threads
/// waiting on the entry are woken whenever it changes.
#[derive(Debug)]
pub struct TransactionEntry {
    id: TransactionId,
    participants: ParticipantResources,
    progress: Mutex<Progress>,
    changed: Condvar,
}

impl TransactionEntry {
    fn new(id: TransactionId, participants: ParticipantResources) -> Self {
        Self {
            id,
            participants,
            progress: Mutex::new(Progress {
                phase: TransactionPhase::Init,
                votes: HashMap::new(),
                acks: HashSet::new(),
                decision: None,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn participants(&self) -> &ParticipantResources {
        &self.participants
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn resources_of(&self, node: &NodeId) -> Option<&[ResourceId]> {
        self.participants.get(node).map(Vec::as_slice)
    }

    pub fn phase(&self) -> TransactionPhase {
        self.progress.lock().phase
    }

    pub fn set_phase(&self, phase: TransactionPhase) {
        self.progress.lock().phase = phase;
        self.changed.notify_all();
    }

    /// Counts `vote` from `node`.
    ///
    /// Returns `false` when the vote was ignored: `node` is not a participant,
    /// it already voted, or the transaction is already decided.
    pub fn record_vote(&self, node: &NodeId, vote: Decision) -> bool {
        if !self.participants.contains_key(node) {
            return false;
        }
        let mut progress = self.progress.lock();
        if progress.decision.is_some() || progress.votes.contains_key(node) {
            return false;
        }
        progress.votes.insert(node.clone(), vote);
        drop(progress);
        self.changed.notify_all();
        true
    }

    /// Records that `node` acknowledged the decision. Returns `false` for
    /// duplicates and non-participants.
    pub fn record_ack(&self, node: &NodeId) -> bool {
        if !self.participants.contains_key(node) {
            return false;
        }
        let inserted = self.progress.lock().acks.insert(node.clone());
        if inserted {
            self.changed.notify_all();
        }
        inserted
    }

    pub fn vote_count(&self) -> usize {
        self.count_votes(Decision::Commit)
    }

    pub fn abort_count(&self) -> usize {
        self.count_votes(Decision::Abort)
    }

    fn count_votes(&self, kind: Decision) -> usize {
        self.progress
            .lock()
            .votes
            .values()
            .filter(|vote| **vote == kind)
            .count()
    }

    pub fn ack_count(&self) -> usize {
        self.progress.lock().acks.len()
    }

    pub fn acked(&self) -> BTreeSet<NodeId> {
        self.progress.lock().acks.iter().cloned().collect()
    }

    pub fn all_acked(&self) -> bool {
        self.progress.lock().acks.len() == self.participants.len()
    }

    /// Fixes the decision. The first call wins; later calls return the
    /// decision already in place.
    pub fn decide(&self, decision: Decision) -> Decision {
        let mut progress = self.progress.lock();
        if let Some(existing) = progress.decision {
            return existing;
        }
        progress.decision = Some(decision);
        progress.phase = TransactionPhase::Decided;
        drop(progress);
        self.changed.notify_all();
        decision
    }

    pub fn decision(&self) -> Option<Decision> {
        self.progress.lock().decision
    }

    /// Blocks until the vote outcome is known or `deadline` passes.
    ///
    /// Returns `Commit` only if every participant voted commit; a single abort
    /// vote or the deadline yields `Abort`.
    pub fn wait_for_votes(&self, deadline: Instant) -> Decision {
        let total = self.participants.len();
        let mut progress = self.progress.lock();
        loop {
            let commits = progress
                .votes
                .values()
                .filter(|vote| vote.is_commit())
                .count();
            if commits < progress.votes.len() {
                return Decision::Abort;
            }
            if commits == total {
                return Decision::Commit;
            }
            if Instant::now() >= deadline {
                debug!(
                    "Vote deadline passed for {} with {}/{} votes",
                    self.id, commits, total
                );
                return Decision::Abort;
            }
            self.changed.wait_until(&mut progress, deadline);
        }
    }

    /// Blocks until every participant has acknowledged or `timeout` elapses.
    /// Returns whether all acknowledgments are in.
    pub fn wait_for_acks(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut progress = self.progress.lock();
        loop {
            if progress.acks.len() == self.participants.len() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.changed.wait_until(&mut progress, deadline);
        }
    }
}

/// Concurrent map of in-flight transactions on the coordinator.
///
/// Entries are independent: each has its own lock, so bookkeeping for one
/// transaction never waits on another. Completed transactions are evicted.
#[derive(Debug, Default)]
pub struct TransactionRegistry {
    entries: RwLock<HashMap<TransactionId, Arc<TransactionEntry>>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fresh entry for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`MontageError::Config`] if `id` is still in flight; the
    /// existing entry is left untouched.
    pub fn register(
        &self,
        id: TransactionId,
        participants: ParticipantResources,
    ) -> Result<Arc<TransactionEntry>> {
        let mut entries = self.entries.write();
        if entries.contains_key(&id) {
            return Err(MontageError::Config(format!(
                "transaction {} is already in flight",
                id
            )));
        }
        let entry = Arc::new(TransactionEntry::new(id.clone(), participants));
        entries.insert(id, Arc::clone(&entry));
        Ok(entry)
    }

    /// Re-creates the entry for a transaction whose decision was recovered
    /// from the log, replacing any entry already under `id`.
    pub fn restore(
        &self,
        id: TransactionId,
        participants: ParticipantResources,
        decision: Decision,
        acked: &BTreeSet<NodeId>,
    ) -> Arc<TransactionEntry> {
        let entry = Arc::new(TransactionEntry::new(id.clone(), participants));
        entry.decide(decision);
        for node in acked {
            entry.record_ack(node);
        }
        self.entries.write().insert(id, Arc::clone(&entry));
        entry
    }

    pub fn get(&self, id: &TransactionId) -> Option<Arc<TransactionEntry>> {
        self.entries.read().get(id).cloned()
    }

    pub fn evict(&self, id: &TransactionId) -> Option<Arc<TransactionEntry>> {
        self.entries.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
