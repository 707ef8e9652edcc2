//! Drives a single participant message by message, with a recorder standing in
//! for the coordinator.

use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use montage::prelude::*;
use montage::protocol::Message;

use crate::common::*;

struct Harness {
    participant: Arc<Participant>,
    log: MemoryLog<ParticipantRecord>,
    sources: Arc<MemorySourceStore>,
    decider: Arc<CountingDecider>,
    coordinator: Arc<LocalEndpoint>,
    inbox: Receiver<(NodeId, Message)>,
}

impl Harness {
    fn new(vote: Decision) -> Self {
        let log = MemoryLog::new();
        Self::with_log(vote, log.clone(), Arc::new(log))
    }

    /// Builds the participant over `store`; `log` is what the test inspects.
    fn with_log(
        vote: Decision,
        log: MemoryLog<ParticipantRecord>,
        store: Arc<dyn RecoveryLog<ParticipantRecord>>,
    ) -> Self {
        let network = LocalNetwork::new();
        let (recorder, inbox) = Recorder::new();
        network.attach(COORDINATOR, recorder);

        let sources = Arc::new(MemorySourceStore::with(&["a.png", "b.png"]));
        let decider = CountingDecider::new(vote);
        let participant = Participant::new(
            ParticipantConfig::new("alice"),
            network.endpoint("alice"),
            store,
            sources.clone(),
            decider.clone(),
        );
        network.attach("alice", participant.clone());
        Self {
            participant,
            log,
            sources,
            decider,
            coordinator: network.endpoint(COORDINATOR),
            inbox,
        }
    }

    fn send(&self, message: Message) {
        send_message(&*self.coordinator, &NodeId::from("alice"), &message).unwrap();
    }

    fn request(&self, txn: &str, resources: &[&str]) {
        self.send(Message::VoteRequest {
            transaction: TransactionId::from(txn),
            resources: resources.iter().map(|r| ResourceId::from(*r)).collect(),
            payload: b"collage".to_vec(),
        });
    }

    fn outcome(&self, txn: &str, decision: Decision, resources: &[&str]) {
        self.send(Message::Outcome {
            transaction: TransactionId::from(txn),
            decision,
            resources: resources.iter().map(|r| ResourceId::from(*r)).collect(),
        });
    }

    fn next(&self) -> Message {
        let (from, message) = self.inbox.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(from.as_str(), "alice");
        message
    }

    fn expect_vote(&self, txn: &str, expected: Decision) {
        assert_eq!(
            self.next(),
            Message::Vote {
                transaction: TransactionId::from(txn),
                vote: expected,
            }
        );
    }

    fn expect_ack(&self, txn: &str) {
        assert_eq!(
            self.next(),
            Message::Ack {
                transaction: TransactionId::from(txn),
            }
        );
    }
}

/// A log whose writes for one transaction and phase stall until opened,
/// like a disk that is slow to sync.
struct StallingLog {
    inner: MemoryLog<ParticipantRecord>,
    transaction: TransactionId,
    phase: ParticipantPhase,
    gate: Receiver<()>,
    opener: Sender<()>,
    stalled: AtomicUsize,
}

impl StallingLog {
    fn new(inner: MemoryLog<ParticipantRecord>, txn: &str, phase: ParticipantPhase) -> Arc<Self> {
        let (opener, gate) = unbounded();
        Arc::new(Self {
            inner,
            transaction: TransactionId::from(txn),
            phase,
            gate,
            opener,
            stalled: AtomicUsize::new(0),
        })
    }

    fn open(&self) {
        let _ = self.opener.send(());
    }

    fn stalled(&self) -> usize {
        self.stalled.load(Ordering::SeqCst)
    }
}

impl RecoveryLog<ParticipantRecord> for StallingLog {
    fn persist(&self, record: &ParticipantRecord) -> Result<()> {
        if record.transaction == self.transaction && record.phase == self.phase {
            self.stalled.fetch_add(1, Ordering::SeqCst);
            let _ = self.gate.recv_timeout(Duration::from_secs(30));
            self.stalled.fetch_sub(1, Ordering::SeqCst);
        }
        self.inner.persist(record)
    }

    fn load(&self, transaction: &TransactionId) -> Result<Option<ParticipantRecord>> {
        self.inner.load(transaction)
    }

    fn load_all(&self) -> Result<Vec<ParticipantRecord>> {
        self.inner.load_all()
    }

    fn remove(&self, transaction: &TransactionId) -> Result<()> {
        self.inner.remove(transaction)
    }
}

#[test]
fn test_commit_vote_is_logged_before_it_is_sent() {
    let h = Harness::new(Decision::Commit);
    h.request("t1", &["a.png"]);
    h.expect_vote("t1", Decision::Commit);

    let record = h.log.load(&TransactionId::from("t1")).unwrap().unwrap();
    assert_eq!(record.phase, ParticipantPhase::Prepared);
    assert_eq!(record.resources, vec![ResourceId::from("a.png")]);
    assert_eq!(
        h.participant.locks().holder(&ResourceId::from("a.png")),
        Some(TransactionId::from("t1"))
    );
}

#[test]
fn test_duplicate_vote_request_resends_vote() {
    let h = Harness::new(Decision::Commit);
    h.request("t1", &["a.png"]);
    h.expect_vote("t1", Decision::Commit);
    h.request("t1", &["a.png"]);
    h.expect_vote("t1", Decision::Commit);

    assert_eq!(h.decider.calls(), 1);
    assert_eq!(h.log.persist_count(), 1);
}

#[test]
fn test_abort_vote_releases_at_once() {
    let h = Harness::new(Decision::Abort);
    h.request("t1", &["a.png", "b.png"]);
    h.expect_vote("t1", Decision::Abort);

    assert!(h.participant.locks().is_empty());
    assert!(h.log.is_empty());

    // The outcome still gets acknowledged.
    h.outcome("t1", Decision::Abort, &["a.png", "b.png"]);
    h.expect_ack("t1");
}

#[test]
fn test_conflicting_request_is_refused_without_asking() {
    let h = Harness::new(Decision::Commit);
    h.request("t1", &["a.png"]);
    h.expect_vote("t1", Decision::Commit);

    h.request("t2", &["b.png", "a.png"]);
    h.expect_vote("t2", Decision::Abort);
    assert_eq!(h.decider.calls(), 1);
    // All or nothing: b.png was not left locked by the refused request.
    assert_eq!(h.participant.locks().holder(&ResourceId::from("b.png")), None);
}

#[test]
fn test_commit_outcome_finalizes_once() {
    let h = Harness::new(Decision::Commit);
    h.request("t1", &["a.png", "b.png"]);
    h.expect_vote("t1", Decision::Commit);

    h.outcome("t1", Decision::Commit, &["a.png", "b.png"]);
    h.expect_ack("t1");
    assert_eq!(h.sources.finalized(), vec!["a.png", "b.png"]);
    assert!(h.participant.locks().is_empty());
    assert!(wait_for_condition(|| h.log.is_empty(), 2000));

    // A re-broadcast after the ack is acknowledged again and changes nothing.
    h.outcome("t1", Decision::Commit, &["a.png", "b.png"]);
    h.expect_ack("t1");
    assert_eq!(h.sources.finalized().len(), 2);
}

#[test]
fn test_outcome_for_unknown_transaction_is_acknowledged() {
    let h = Harness::new(Decision::Commit);
    h.outcome("ghost", Decision::Commit, &["a.png"]);
    h.expect_ack("ghost");
    assert!(h.sources.has("a.png"));
    assert!(h.sources.finalized().is_empty());
}

#[test]
fn test_participant_rejects_unexpected_messages() {
    let h = Harness::new(Decision::Commit);
    let coordinator = NodeId::from(COORDINATOR);
    assert!(!h.participant.deliver(&coordinator, b"not a message"));

    let ack = Message::Ack {
        transaction: TransactionId::from("t1"),
    };
    assert!(!h.participant.deliver(&coordinator, &ack.encode().unwrap()));
    assert!(h.inbox.try_recv().is_err());
}

#[test]
fn test_slow_prepare_write_does_not_hold_up_other_requests() {
    let log = MemoryLog::new();
    let store = StallingLog::new(log.clone(), "slow", ParticipantPhase::Prepared);
    let h = Harness::with_log(Decision::Commit, log, store.clone());

    h.request("slow", &["a.png"]);
    assert!(wait_for_condition(|| store.stalled() == 1, 2000));

    // Another transaction is locked, decided and logged meanwhile.
    h.request("t2", &["b.png"]);
    h.expect_vote("t2", Decision::Commit);
    assert!(h.inbox.try_recv().is_err());

    store.open();
    h.expect_vote("slow", Decision::Commit);
    assert_eq!(h.log.len(), 2);
}

#[test]
fn test_slow_outcome_write_does_not_hold_up_other_requests() {
    let log = MemoryLog::new();
    let store = StallingLog::new(log.clone(), "t1", ParticipantPhase::Decided);
    let h = Harness::with_log(Decision::Commit, log, store.clone());
    h.request("t1", &["a.png"]);
    h.expect_vote("t1", Decision::Commit);

    // Deliver the outcome on its own thread, as a multi-threaded transport would.
    let outcome = Message::Outcome {
        transaction: TransactionId::from("t1"),
        decision: Decision::Commit,
        resources: vec![ResourceId::from("a.png")],
    };
    let participant = Arc::clone(&h.participant);
    let applying = thread::spawn(move || {
        participant.deliver(&NodeId::from(COORDINATOR), &outcome.encode().unwrap())
    });
    assert!(wait_for_condition(|| store.stalled() == 1, 2000));

    h.request("t2", &["b.png"]);
    h.expect_vote("t2", Decision::Commit);
    // A re-broadcast while the outcome is being applied changes nothing.
    h.outcome("t1", Decision::Commit, &["a.png"]);
    thread::sleep(Duration::from_millis(50));
    assert!(h.sources.finalized().is_empty());
    assert!(h.inbox.try_recv().is_err());

    store.open();
    assert!(applying.join().unwrap());
    h.expect_ack("t1");
    assert_eq!(h.sources.finalized(), vec!["a.png"]);
    assert_eq!(
        h.participant.locks().holder(&ResourceId::from("b.png")),
        Some(TransactionId::from("t2"))
    );
}
