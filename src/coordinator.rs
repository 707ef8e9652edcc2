use log::{debug, error, info, warn};
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::config::CoordinatorConfig;
use crate::errors::{MontageError, Result};
use crate::protocol::Message;
use crate::recovery_log::{CoordinatorRecord, RecoveryLog};
use crate::registry::{TransactionEntry, TransactionPhase, TransactionRegistry};
use crate::storage::ArtifactSink;
use crate::transport::{MessageHandler, Transport, send_message};
use crate::types::{Decision, NodeId, TransactionId, parse_sources};

/// Drives transactions through two-phase commit as the coordinator.
///
/// Every transaction runs on the thread that called
/// [`start_commit`](Self::start_commit) (or a thread spawned for it), while
/// votes and acknowledgments arrive through the [`MessageHandler`]
/// implementation on whatever thread the transport delivers on. The two meet
/// in the [`TransactionRegistry`], so a transaction waiting for votes never
/// holds up another one.
///
/// The coordinator's state for each in-flight transaction is mirrored in its
/// recovery log: once before any vote request goes out (with `Abort` as the
/// presumed outcome) and once when the decision is made. A restarted
/// coordinator picks up from those records with [`recover`](Self::recover).
pub struct Coordinator {
    config: CoordinatorConfig,
    transport: Arc<dyn Transport>,
    log: Arc<dyn RecoveryLog<CoordinatorRecord>>,
    sink: Arc<dyn ArtifactSink>,
    registry: TransactionRegistry,
    this: Weak<Coordinator>,
}

impl Coordinator {
    /// Creates a coordinator.
    ///
    /// # Arguments
    ///
    /// * `config` - Node id and protocol timeouts.
    /// * `transport` - Where vote requests and outcomes are sent.
    /// * `log` - Recovery log for coordinator records.
    /// * `sink` - Receives the artifact of every committed transaction.
    pub fn new(
        config: CoordinatorConfig,
        transport: Arc<dyn Transport>,
        log: Arc<dyn RecoveryLog<CoordinatorRecord>>,
        sink: Arc<dyn ArtifactSink>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            transport,
            log,
            sink,
            registry: TransactionRegistry::new(),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Transactions currently in flight.
    pub fn registry(&self) -> &TransactionRegistry {
        &self.registry
    }

    /// Runs one transaction to completion on the calling thread.
    ///
    /// `sources` lists the resources the artifact is built from as
    /// `node:resource` entries. Returns the decision once every participant
    /// has acknowledged it; this blocks for as long as any participant stays
    /// unreachable.
    ///
    /// # Errors
    ///
    /// A malformed or empty source list is rejected before any message is
    /// sent, as is an id the artifact sink could never write and an id that
    /// is already in flight. Failing to persist the initial record is also an
    /// error: without it the transaction could not be recovered, so it is
    /// never started.
    pub fn start_commit<S: AsRef<str>>(
        &self,
        id: impl Into<TransactionId>,
        payload: Vec<u8>,
        sources: &[S],
    ) -> Result<Decision> {
        let id = id.into();
        let entry = self
            .admit(&id, sources)
            .inspect_err(|e| warn!("Rejected transaction {}: {}", id, e))?;
        let participants = entry.participants().clone();
        info!(
            "Starting transaction {} with {} participant(s)",
            id,
            participants.len()
        );

        let mut record = CoordinatorRecord {
            transaction: id.clone(),
            decision: Decision::Abort,
            participants,
            ack_set: BTreeSet::new(),
            payload,
        };
        if let Err(e) = self.log.persist(&record) {
            self.registry.evict(&id);
            return Err(e);
        }

        entry.set_phase(TransactionPhase::AwaitingVotes);
        let deadline = Instant::now() + self.config.vote_timeout;
        for (node, resources) in entry.participants() {
            let request = Message::VoteRequest {
                transaction: id.clone(),
                resources: resources.clone(),
                payload: record.payload.clone(),
            };
            self.send(node, &request);
        }

        let mut decision = entry.wait_for_votes(deadline);
        record.decision = decision;
        if let Err(e) = self.log.persist(&record) {
            if decision.is_commit() {
                // The presumed abort is already on disk, so abort stays safe.
                error!("Could not log commit for {}, aborting: {}", id, e);
                decision = Decision::Abort;
                record.decision = decision;
            } else {
                warn!("Could not re-log abort for {}: {}", id, e);
            }
        }
        let decision = entry.decide(decision);
        info!(
            "Transaction {} decided {} ({} commit, {} abort vote(s))",
            id,
            decision,
            entry.vote_count(),
            entry.abort_count()
        );

        self.finish(&entry, &record);
        Ok(decision)
    }

    // Checks run before anything is logged or sent. Registration is last so
    // a rejected request never occupies the id.
    fn admit<S: AsRef<str>>(&self, id: &TransactionId, sources: &[S]) -> Result<Arc<TransactionEntry>> {
        let participants = parse_sources(id.as_str(), sources)?;
        self.sink.validate(id)?;
        self.registry.register(id.clone(), participants)
    }

    /// Runs [`start_commit`](Self::start_commit) on a new thread.
    pub fn spawn_commit(
        self: &Arc<Self>,
        id: impl Into<TransactionId>,
        payload: Vec<u8>,
        sources: Vec<String>,
    ) -> Result<JoinHandle<Result<Decision>>> {
        let id = id.into();
        let coordinator = Arc::clone(self);
        thread::Builder::new()
            .name(format!("txn-{}", id))
            .spawn(move || coordinator.start_commit(id, payload, &sources))
            .map_err(MontageError::from)
    }

    /// Resumes every transaction left in the recovery log.
    ///
    /// Each one is re-applied and driven to completion on its own thread;
    /// this returns once all of them have completed. Records written before
    /// a decision was made carry the presumed `Abort` and are aborted.
    pub fn recover(&self) -> Result<Vec<(TransactionId, Decision)>> {
        let records = self.log.load_all()?;
        if records.is_empty() {
            return Ok(Vec::new());
        }
        info!("Recovering {} transaction(s)", records.len());

        // Register everything first so acks that arrive early are counted.
        let resumed: Vec<(Arc<TransactionEntry>, CoordinatorRecord)> = records
            .into_iter()
            .map(|record| {
                let entry = self.registry.restore(
                    record.transaction.clone(),
                    record.participants.clone(),
                    record.decision,
                    &record.ack_set,
                );
                (entry, record)
            })
            .collect();

        let mut handles = Vec::with_capacity(resumed.len());
        for (entry, record) in resumed {
            let Some(coordinator) = self.this.upgrade() else {
                break;
            };
            let handle = thread::Builder::new()
                .name(format!("recover-{}", record.transaction))
                .spawn(move || {
                    info!(
                        "Resuming {} with decision {}",
                        record.transaction, record.decision
                    );
                    coordinator.finish(&entry, &record);
                    (record.transaction, record.decision)
                })?;
            handles.push(handle);
        }

        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .map_err(|_| MontageError::Other("recovery thread panicked".to_string()))
            })
            .collect()
    }

    // Everything after the decision is durable: write, broadcast until every
    // participant acknowledges, then forget the transaction.
    fn finish(&self, entry: &TransactionEntry, record: &CoordinatorRecord) {
        let id = entry.id();
        if record.decision.is_commit() {
            while let Err(e) = self.sink.write(id, &record.payload) {
                error!("Writing artifact for {} failed, retrying: {}", id, e);
                thread::sleep(self.config.ack_retry_interval);
            }
            info!("Wrote artifact {}", id);
        }

        entry.set_phase(TransactionPhase::AwaitingAcks);
        self.broadcast(entry, record.decision);
        while !entry.wait_for_acks(self.config.ack_retry_interval) {
            debug!(
                "{} has {}/{} acks, re-broadcasting {}",
                id,
                entry.ack_count(),
                entry.participant_count(),
                record.decision
            );
            self.broadcast(entry, record.decision);
        }

        entry.set_phase(TransactionPhase::Complete);
        if let Err(e) = self.log.remove(id) {
            warn!("Could not remove log record for {}: {}", id, e);
        }
        self.registry.evict(id);
        info!("Transaction {} complete ({})", id, record.decision);
    }

    fn broadcast(&self, entry: &TransactionEntry, decision: Decision) {
        for (node, resources) in entry.participants() {
            let outcome = Message::Outcome {
                transaction: entry.id().clone(),
                decision,
                resources: resources.clone(),
            };
            self.send(node, &outcome);
        }
    }

    fn send(&self, target: &NodeId, message: &Message) {
        if let Err(e) = send_message(self.transport.as_ref(), target, message) {
            warn!(
                "Failed to send {} for {} to {}: {}",
                message.kind(),
                message.transaction(),
                target,
                e
            );
        }
    }
}

impl MessageHandler for Coordinator {
    fn deliver(&self, sender: &NodeId, body: &[u8]) -> bool {
        let message = match Message::decode(body) {
            Ok(message) => message,
            Err(e) => {
                warn!("Undecodable message from {}: {}", sender, e);
                return false;
            }
        };
        debug!(
            "{} from {} for {}",
            message.kind(),
            sender,
            message.transaction()
        );

        match message {
            Message::Vote { transaction, vote } => {
                match self.registry.get(&transaction) {
                    Some(entry) => {
                        if !entry.record_vote(sender, vote) {
                            debug!("Ignored {} vote from {} for {}", vote, sender, transaction);
                        }
                    }
                    None => debug!("Vote for unknown transaction {}", transaction),
                }
                true
            }
            Message::Ack { transaction } => {
                match self.registry.get(&transaction) {
                    Some(entry) => {
                        entry.record_ack(sender);
                    }
                    None => debug!("Ack for unknown transaction {}", transaction),
                }
                true
            }
            Message::Submit {
                transaction,
                payload,
                sources,
            } => {
                let Some(coordinator) = self.this.upgrade() else {
                    return false;
                };
                match coordinator.spawn_commit(transaction.clone(), payload, sources) {
                    Ok(_) => true,
                    Err(e) => {
                        error!("Could not start {}: {}", transaction, e);
                        false
                    }
                }
            }
            other => {
                warn!("Coordinator does not handle {} messages", other.kind());
                false
            }
        }
    }
}
