use ahash::AHashMap as HashMap;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::thread;

use crate::config::ParticipantConfig;
use crate::errors::Result;
use crate::lock_table::{LockResult, ResourceLockTable};
use crate::protocol::Message;
use crate::recovery_log::{ParticipantPhase, ParticipantRecord, RecoveryLog};
use crate::storage::SourceStore;
use crate::transport::{MessageHandler, Transport, send_message};
use crate::twopc::VoteDecider;
use crate::types::{Decision, NodeId, ResourceId, TransactionId};

// What this node knows about a transaction it has locked resources for.
#[derive(Debug, Clone)]
enum LocalState {
    // Resources locked, the decider has not answered yet.
    Deciding(Vec<ResourceId>),
    // Voted commit and logged it; waiting for the outcome.
    Prepared(Vec<ResourceId>),
    // The outcome is being logged and applied.
    Applying,
    // The outcome arrived while the decider was still running.
    Resolved,
}

/// Answers vote requests and applies outcomes for one participant node.
///
/// A vote request is checked against the local [`SourceStore`] and the
/// [`ResourceLockTable`] before the [`VoteDecider`] is consulted. The decider
/// runs on its own thread so a slow answer for one transaction does not hold
/// up messages for any other.
///
/// Only commit votes are logged: a participant that votes abort knows the
/// outcome already and releases its locks at once. Outcomes are logged before
/// any source is finalized or any lock released, and the record is dropped
/// once the acknowledgment is sent. Log writes and finalization happen
/// outside the in-flight table lock, so disk I/O for one transaction never
/// stalls requests for another.
pub struct Participant {
    config: ParticipantConfig,
    transport: Arc<dyn Transport>,
    log: Arc<dyn RecoveryLog<ParticipantRecord>>,
    sources: Arc<dyn SourceStore>,
    decider: Arc<dyn VoteDecider>,
    locks: ResourceLockTable,
    inflight: Mutex<HashMap<TransactionId, LocalState>>,
    this: Weak<Participant>,
}

impl Participant {
    /// Creates a participant.
    ///
    /// # Arguments
    ///
    /// * `config` - This node's id and the coordinator's id.
    /// * `transport` - Where votes and acknowledgments are sent.
    /// * `log` - Recovery log for participant records.
    /// * `sources` - The local resources transactions ask for.
    /// * `decider` - Decides this node's vote once its resources are reserved.
    pub fn new(
        config: ParticipantConfig,
        transport: Arc<dyn Transport>,
        log: Arc<dyn RecoveryLog<ParticipantRecord>>,
        sources: Arc<dyn SourceStore>,
        decider: Arc<dyn VoteDecider>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            transport,
            log,
            sources,
            decider,
            locks: ResourceLockTable::new(),
            inflight: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &ParticipantConfig {
        &self.config
    }

    pub fn locks(&self) -> &ResourceLockTable {
        &self.locks
    }

    /// Resumes transactions left in the recovery log.
    ///
    /// A `Prepared` transaction gets its locks back and its commit vote
    /// re-sent. A `Decided` one has its outcome re-applied and acknowledged.
    /// Returns how many records were resumed.
    pub fn recover(&self) -> Result<usize> {
        let records = self.log.load_all()?;
        if !records.is_empty() {
            info!(
                "{} recovering {} transaction(s)",
                self.config.node_id,
                records.len()
            );
        }

        for record in &records {
            let txn = &record.transaction;
            match record.phase {
                ParticipantPhase::Prepared => {
                    self.relock(txn, &record.resources);
                    debug!("Re-sending commit vote for {}", txn);
                    self.send_vote(txn, Decision::Commit);
                }
                ParticipantPhase::Decided => {
                    match self.apply_outcome(txn, record.decision, &record.resources) {
                        Ok(()) => self.complete(txn),
                        Err(e) => {
                            // Wait for the coordinator's re-broadcast to retry.
                            error!("Could not re-apply {} for {}: {}", record.decision, txn, e);
                            self.relock(txn, &record.resources);
                        }
                    }
                }
            }
        }
        Ok(records.len())
    }

    // Takes back the locks of a recovered transaction and marks it prepared.
    fn relock(&self, txn: &TransactionId, resources: &[ResourceId]) {
        let mut inflight = self.inflight.lock();
        if let LockResult::Conflict { resource, holder } = self.locks.try_lock_all(txn, resources) {
            warn!("Recovered {} overlaps {} on {}", txn, holder, resource);
        }
        inflight.insert(txn.clone(), LocalState::Prepared(resources.to_vec()));
    }

    fn on_vote_request(&self, txn: TransactionId, resources: Vec<ResourceId>, payload: Vec<u8>) {
        if self.answer_known_request(&txn) {
            return;
        }

        if let Some(missing) = resources.iter().find(|r| !self.sources.contains(r)) {
            info!("{}: {} is not available here, voting abort", txn, missing);
            self.send_vote(&txn, Decision::Abort);
            return;
        }

        let mut inflight = self.inflight.lock();
        if inflight.contains_key(&txn) {
            debug!("Vote request for {} is already being handled", txn);
            return;
        }
        if let LockResult::Conflict { resource, holder } = self.locks.try_lock_all(&txn, &resources)
        {
            drop(inflight);
            info!(
                "{}: {} is locked by {}, voting abort",
                txn, resource, holder
            );
            self.send_vote(&txn, Decision::Abort);
            return;
        }
        inflight.insert(txn.clone(), LocalState::Deciding(resources.clone()));
        drop(inflight);

        let Some(participant) = self.this.upgrade() else {
            self.cast_abort(&txn, &resources);
            return;
        };
        let spawned = thread::Builder::new()
            .name(format!("decide-{}", txn))
            .spawn({
                let txn = txn.clone();
                let resources = resources.clone();
                move || participant.decide(txn, resources, payload)
            });
        if let Err(e) = spawned {
            error!("Could not start decider for {}: {}", txn, e);
            self.cast_abort(&txn, &resources);
        }
    }

    // Handles a repeated request. Returns false if `txn` is new to this node.
    fn answer_known_request(&self, txn: &TransactionId) -> bool {
        let known = self.inflight.lock().get(txn).cloned();
        match known {
            Some(LocalState::Prepared(_)) => {
                debug!("Duplicate vote request for {}, re-sending commit", txn);
                self.send_vote(txn, Decision::Commit);
                true
            }
            Some(_) => {
                debug!("Vote request for {} is already being handled", txn);
                true
            }
            None => false,
        }
    }

    fn decide(&self, txn: TransactionId, resources: Vec<ResourceId>, payload: Vec<u8>) {
        let vote = self.decider.decide(&txn, &payload, &resources);
        if !vote.is_commit() {
            info!("{}: decider voted abort", txn);
            self.cast_abort(&txn, &resources);
            return;
        }

        let deciding = matches!(self.inflight.lock().get(&txn), Some(LocalState::Deciding(_)));
        if !deciding {
            self.inflight.lock().remove(&txn);
            debug!("{} was resolved before the vote was cast, discarding it", txn);
            return;
        }

        // Checked again after the write: the outcome may arrive meanwhile.
        let record = ParticipantRecord {
            transaction: txn.clone(),
            decision: Decision::Commit,
            resources: resources.clone(),
            phase: ParticipantPhase::Prepared,
        };
        let persisted = self.log.persist(&record);

        let mut inflight = self.inflight.lock();
        if !matches!(inflight.get(&txn), Some(LocalState::Deciding(_))) {
            inflight.remove(&txn);
            drop(inflight);
            debug!("{} was resolved before the vote was cast, discarding it", txn);
            if persisted.is_ok() {
                self.forget(&txn);
            }
            return;
        }

        match persisted {
            Ok(()) => {
                inflight.insert(txn.clone(), LocalState::Prepared(resources));
                drop(inflight);
                info!("{}: prepared, voting commit", txn);
                self.send_vote(&txn, Decision::Commit);
            }
            Err(e) => {
                self.locks.release(&txn, &resources);
                inflight.remove(&txn);
                drop(inflight);
                error!("Could not log prepare for {}, voting abort: {}", txn, e);
                self.send_vote(&txn, Decision::Abort);
            }
        }
    }

    // Unlocks and votes abort, unless the outcome already arrived.
    fn cast_abort(&self, txn: &TransactionId, resources: &[ResourceId]) {
        let mut inflight = self.inflight.lock();
        match inflight.remove(txn) {
            Some(LocalState::Deciding(_)) => {
                self.locks.release(txn, resources);
                drop(inflight);
                self.send_vote(txn, Decision::Abort);
            }
            _ => debug!("{} was resolved before the vote was cast, discarding it", txn),
        }
    }

    fn on_outcome(&self, txn: TransactionId, decision: Decision, resources: Vec<ResourceId>) {
        let mut inflight = self.inflight.lock();
        match inflight.get(&txn).cloned() {
            Some(LocalState::Prepared(held)) => {
                inflight.insert(txn.clone(), LocalState::Applying);
                drop(inflight);

                let applied = self.apply_outcome(&txn, decision, &held);
                let mut inflight = self.inflight.lock();
                match applied {
                    Ok(()) => {
                        inflight.remove(&txn);
                        drop(inflight);
                        self.complete(&txn);
                    }
                    Err(e) => {
                        inflight.insert(txn.clone(), LocalState::Prepared(held));
                        drop(inflight);
                        error!("Could not apply {} for {}: {}", decision, txn, e);
                    }
                }
            }
            Some(LocalState::Applying) => {
                debug!("{} for {} is already being applied", decision, txn);
            }
            Some(LocalState::Deciding(held)) => {
                self.locks.release(&txn, &held);
                inflight.insert(txn.clone(), LocalState::Resolved);
                drop(inflight);
                // Decided without our vote, so this can only be an abort.
                if decision.is_commit() {
                    warn!("{} committed without a vote from this node", txn);
                }
                self.send_ack(&txn);
            }
            Some(LocalState::Resolved) => {
                drop(inflight);
                self.send_ack(&txn);
            }
            None => {
                // Voted abort, or already finished and acknowledged.
                let released = self.locks.release_all(&txn);
                drop(inflight);
                debug!(
                    "{} for settled {} ({} of {} resource lock(s) released)",
                    decision,
                    txn,
                    released,
                    resources.len()
                );
                self.send_ack(&txn);
            }
        }
    }

    // Logs the outcome, then finalizes (commit only) and unlocks.
    fn apply_outcome(
        &self,
        txn: &TransactionId,
        decision: Decision,
        resources: &[ResourceId],
    ) -> Result<()> {
        let record = ParticipantRecord {
            transaction: txn.clone(),
            decision,
            resources: resources.to_vec(),
            phase: ParticipantPhase::Decided,
        };
        self.log.persist(&record)?;
        if decision.is_commit() {
            for resource in resources {
                self.sources.finalize(resource)?;
            }
        }
        let released = self.locks.release(txn, resources);
        info!("{}: applied {}, released {} lock(s)", txn, decision, released);
        Ok(())
    }

    fn complete(&self, txn: &TransactionId) {
        self.send_ack(txn);
        self.forget(txn);
    }

    fn forget(&self, txn: &TransactionId) {
        if let Err(e) = self.log.remove(txn) {
            warn!("Could not remove log record for {}: {}", txn, e);
        }
    }

    fn send_vote(&self, txn: &TransactionId, vote: Decision) {
        self.send(&Message::Vote {
            transaction: txn.clone(),
            vote,
        });
    }

    fn send_ack(&self, txn: &TransactionId) {
        self.send(&Message::Ack {
            transaction: txn.clone(),
        });
    }

    fn send(&self, message: &Message) {
        let coordinator = &self.config.coordinator_id;
        if let Err(e) = send_message(self.transport.as_ref(), coordinator, message) {
            warn!(
                "Failed to send {} for {} to {}: {}",
                message.kind(),
                message.transaction(),
                coordinator,
                e
            );
        }
    }
}

impl MessageHandler for Participant {
    fn deliver(&self, sender: &NodeId, body: &[u8]) -> bool {
        let message = match Message::decode(body) {
            Ok(message) => message,
            Err(e) => {
                warn!("Undecodable message from {}: {}", sender, e);
                return false;
            }
        };
        debug!(
            "{} received {} for {} from {}",
            self.config.node_id,
            message.kind(),
            message.transaction(),
            sender
        );

        match message {
            Message::VoteRequest {
                transaction,
                resources,
                payload,
            } => {
                self.on_vote_request(transaction, resources, payload);
                true
            }
            Message::Outcome {
                transaction,
                decision,
                resources,
            } => {
                self.on_outcome(transaction, decision, resources);
                true
            }
            other => {
                warn!("Participant does not handle {} messages", other.kind());
                false
            }
        }
    }
}
