use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use crossbeam_channel::{Sender, unbounded};
use log::debug;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use crate::errors::Result;
use crate::transport::{Envelope, MessageHandler, Transport};
use crate::types::NodeId;

struct Mailbox {
    sender: Sender<Envelope>,
    // Cleared when the node detaches so queued messages die with it.
    alive: Arc<AtomicBool>,
}

#[derive(Default)]
struct Shared {
    mailboxes: RwLock<HashMap<NodeId, Mailbox>>,
    muted: RwLock<HashSet<NodeId>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// An in-process network of named nodes.
///
/// Every attached node gets a mailbox and a dispatcher thread that hands
/// messages to its [`MessageHandler`] one at a time. Messages to a node that
/// is not attached are silently lost, which is how a crashed process looks to
/// its peers. Re-attaching a node models a restart: the new handler replaces
/// the old one and anything still queued for the old one is discarded.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    shared: Arc<Shared>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a transport that sends as `id`.
    pub fn endpoint(&self, id: impl Into<NodeId>) -> Arc<LocalEndpoint> {
        Arc::new(LocalEndpoint {
            id: id.into(),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Starts delivering messages addressed to `id` to `handler`.
    pub fn attach(&self, id: impl Into<NodeId>, handler: Arc<dyn MessageHandler>) {
        let id = id.into();
        let (sender, receiver) = unbounded::<Envelope>();
        let alive = Arc::new(AtomicBool::new(true));

        let dispatcher_alive = Arc::clone(&alive);
        let shared = Arc::clone(&self.shared);
        let name = id.clone();
        thread::spawn(move || {
            for envelope in receiver.iter() {
                if !dispatcher_alive.load(Ordering::SeqCst) {
                    break;
                }
                handler.deliver(&envelope.from, &envelope.body);
                shared.delivered.fetch_add(1, Ordering::Relaxed);
            }
            debug!("Mailbox for {} closed", name);
        });

        let previous = self
            .shared
            .mailboxes
            .write()
            .insert(id, Mailbox { sender, alive });
        if let Some(previous) = previous {
            previous.alive.store(false, Ordering::SeqCst);
        }
    }

    /// Disconnects `id`; pending and future messages to it are lost.
    pub fn detach(&self, id: &NodeId) {
        if let Some(mailbox) = self.shared.mailboxes.write().remove(id) {
            mailbox.alive.store(false, Ordering::SeqCst);
        }
    }

    /// While set, everything `id` sends is dropped.
    pub fn set_drop_outgoing(&self, id: &NodeId, drop: bool) {
        let mut muted = self.shared.muted.write();
        if drop {
            muted.insert(id.clone());
        } else {
            muted.remove(id);
        }
    }

    pub fn is_attached(&self, id: &NodeId) -> bool {
        self.shared.mailboxes.read().contains_key(id)
    }

    /// Messages handed to a handler so far.
    pub fn delivered_count(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    /// Messages lost to detached nodes or muted senders so far.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

/// Sending side of a [`LocalNetwork`] node.
pub struct LocalEndpoint {
    id: NodeId,
    shared: Arc<Shared>,
}

impl Transport for LocalEndpoint {
    fn local_id(&self) -> &NodeId {
        &self.id
    }

    fn send(&self, target: &NodeId, body: Vec<u8>) -> Result<()> {
        if self.shared.muted.read().contains(&self.id) {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let mailboxes = self.shared.mailboxes.read();
        let delivered = mailboxes.get(target).is_some_and(|mailbox| {
            mailbox
                .sender
                .send(Envelope {
                    from: self.id.clone(),
                    body,
                })
                .is_ok()
        });
        if !delivered {
            debug!("{} -> {}: destination unreachable, message lost", self.id, target);
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
