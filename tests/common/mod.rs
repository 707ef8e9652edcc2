//! Common utilities for montage integration tests.
#![allow(dead_code)]

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use crossbeam_channel::{Receiver, Sender, unbounded};
use montage::prelude::*;
use montage::protocol::Message;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const COORDINATOR: &str = "coordinator";

// --- Collaborators ---

/// An `ArtifactSink` that keeps artifacts in memory and can be told to fail.
#[derive(Debug, Default)]
pub struct MemoryArtifactSink {
    written: Mutex<HashMap<String, Vec<u8>>>,
    writes: AtomicUsize,
    failures_left: AtomicUsize,
}

impl MemoryArtifactSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` writes fail.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn get(&self, id: &str) -> Option<Vec<u8>> {
        self.written.lock().get(id).cloned()
    }

    /// Successful writes so far, repeats included.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl ArtifactSink for MemoryArtifactSink {
    fn write(&self, id: &TransactionId, payload: &[u8]) -> Result<()> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MontageError::Storage(format!("disk full writing {}", id)));
        }
        self.written
            .lock()
            .insert(id.to_string(), payload.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A `SourceStore` over a set of names; finalizing removes a name.
#[derive(Debug, Default)]
pub struct MemorySourceStore {
    available: Mutex<HashSet<String>>,
    finalized: Mutex<Vec<String>>,
}

impl MemorySourceStore {
    pub fn with(names: &[&str]) -> Self {
        let store = Self::default();
        for name in names {
            store.add(name);
        }
        store
    }

    pub fn add(&self, name: &str) {
        self.available.lock().insert(name.to_string());
    }

    pub fn has(&self, name: &str) -> bool {
        self.available.lock().contains(name)
    }

    /// Sources consumed by committed transactions, in order.
    pub fn finalized(&self) -> Vec<String> {
        self.finalized.lock().clone()
    }
}

impl SourceStore for MemorySourceStore {
    fn contains(&self, resource: &ResourceId) -> bool {
        self.available.lock().contains(resource.as_str())
    }

    fn finalize(&self, resource: &ResourceId) -> Result<()> {
        if self.available.lock().remove(resource.as_str()) {
            self.finalized.lock().push(resource.to_string());
        }
        Ok(())
    }
}

/// Votes a fixed way and counts how often it was asked.
#[derive(Debug)]
pub struct CountingDecider {
    vote: Decision,
    calls: AtomicUsize,
}

impl CountingDecider {
    pub fn new(vote: Decision) -> Arc<Self> {
        Arc::new(Self {
            vote,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl VoteDecider for CountingDecider {
    fn decide(&self, _: &TransactionId, _: &[u8], _: &[ResourceId]) -> Decision {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.vote
    }
}

/// Blocks every request until the test releases it, like a user who has not
/// answered yet.
pub struct HeldDecider {
    vote: Decision,
    release: Receiver<()>,
    releaser: Sender<()>,
    waiting: AtomicUsize,
}

impl HeldDecider {
    pub fn new(vote: Decision) -> Arc<Self> {
        let (releaser, release) = unbounded();
        Arc::new(Self {
            vote,
            release,
            releaser,
            waiting: AtomicUsize::new(0),
        })
    }

    /// Lets one pending (or future) request through.
    pub fn release_one(&self) {
        let _ = self.releaser.send(());
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

impl VoteDecider for HeldDecider {
    fn decide(&self, _: &TransactionId, _: &[u8], _: &[ResourceId]) -> Decision {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let released = self.release.recv_timeout(Duration::from_secs(30));
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        match released {
            Ok(()) => self.vote,
            Err(_) => Decision::Abort,
        }
    }
}

/// Stands in for a node and collects every message sent to it.
pub struct Recorder {
    sender: Sender<(NodeId, Message)>,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, Receiver<(NodeId, Message)>) {
        let (sender, receiver) = unbounded();
        (Arc::new(Self { sender }), receiver)
    }
}

impl MessageHandler for Recorder {
    fn deliver(&self, sender: &NodeId, body: &[u8]) -> bool {
        match Message::decode(body) {
            Ok(message) => self.sender.send((sender.clone(), message)).is_ok(),
            Err(_) => false,
        }
    }
}

// --- Cluster ---

/// Protocol timeouts short enough for tests.
pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig::default()
        .with_timeouts(Duration::from_millis(300), Duration::from_millis(50))
}

/// One participant node and the state that survives its restarts.
pub struct Node {
    pub participant: Arc<Participant>,
    pub log: MemoryLog<ParticipantRecord>,
    pub sources: Arc<MemorySourceStore>,
}

impl Node {
    pub fn locks(&self) -> &ResourceLockTable {
        self.participant.locks()
    }
}

/// A coordinator and its participants on an in-process network.
pub struct Cluster {
    pub network: LocalNetwork,
    pub config: CoordinatorConfig,
    pub coordinator: Arc<Coordinator>,
    pub coordinator_log: MemoryLog<CoordinatorRecord>,
    pub sink: Arc<MemoryArtifactSink>,
    nodes: HashMap<String, Node>,
}

impl Cluster {
    pub fn new(config: CoordinatorConfig) -> Self {
        let network = LocalNetwork::new();
        let coordinator_log = MemoryLog::new();
        let sink = Arc::new(MemoryArtifactSink::new());
        let coordinator = Coordinator::new(
            config.clone(),
            network.endpoint(COORDINATOR),
            Arc::new(coordinator_log.clone()),
            sink.clone(),
        );
        network.attach(COORDINATOR, coordinator.clone());
        Self {
            network,
            config,
            coordinator,
            coordinator_log,
            sink,
            nodes: HashMap::new(),
        }
    }

    /// Adds an attached participant named `name` owning `sources`.
    pub fn add_participant(
        &mut self,
        name: &str,
        sources: &[&str],
        decider: Arc<dyn VoteDecider>,
    ) -> &Node {
        let log = MemoryLog::new();
        let sources = Arc::new(MemorySourceStore::with(sources));
        let participant = self.build_participant(name, &log, &sources, decider);
        self.network.attach(name, participant.clone());
        self.nodes.insert(
            name.to_string(),
            Node {
                participant,
                log,
                sources,
            },
        );
        &self.nodes[name]
    }

    pub fn node(&self, name: &str) -> &Node {
        &self.nodes[name]
    }

    /// Simulates a crash: everything sent to `name` is lost from now on.
    pub fn crash(&self, name: &str) {
        self.network.detach(&NodeId::from(name));
    }

    /// Restarts `name` from its log and sources, recovers, then reattaches.
    /// Returns how many records were recovered.
    pub fn restart_participant(&mut self, name: &str, decider: Arc<dyn VoteDecider>) -> usize {
        self.crash(name);
        let (log, sources) = {
            let node = &self.nodes[name];
            (node.log.clone(), Arc::clone(&node.sources))
        };
        let participant = self.build_participant(name, &log, &sources, decider);
        let recovered = participant.recover().unwrap();
        self.network.attach(name, participant.clone());
        if let Some(node) = self.nodes.get_mut(name) {
            node.participant = participant;
        }
        recovered
    }

    /// Replaces the coordinator with a fresh one over the same log and sink.
    /// The caller runs `recover`.
    pub fn restart_coordinator(&mut self) -> Arc<Coordinator> {
        self.crash(COORDINATOR);
        let coordinator = Coordinator::new(
            self.config.clone(),
            self.network.endpoint(COORDINATOR),
            Arc::new(self.coordinator_log.clone()),
            self.sink.clone(),
        );
        self.network.attach(COORDINATOR, coordinator.clone());
        self.coordinator = coordinator.clone();
        coordinator
    }

    fn build_participant(
        &self,
        name: &str,
        log: &MemoryLog<ParticipantRecord>,
        sources: &Arc<MemorySourceStore>,
        decider: Arc<dyn VoteDecider>,
    ) -> Arc<Participant> {
        Participant::new(
            ParticipantConfig::new(name),
            self.network.endpoint(name),
            Arc::new(log.clone()),
            sources.clone(),
            decider,
        )
    }
}

/// The mural scenario: alice owns `a.png`, bob owns `b.png`.
pub fn mural_cluster(alice: Arc<dyn VoteDecider>, bob: Arc<dyn VoteDecider>) -> Cluster {
    let mut cluster = Cluster::new(fast_config());
    cluster.add_participant("alice", &["a.png"], alice);
    cluster.add_participant("bob", &["b.png"], bob);
    cluster
}

pub const MURAL_SOURCES: [&str; 2] = ["alice:a.png", "bob:b.png"];

/// Helper function to wait for a condition with timeout
pub fn wait_for_condition<F>(condition: F, timeout_ms: u64) -> bool
where
    F: Fn() -> bool,
{
    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    false
}
