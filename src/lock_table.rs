use ahash::AHashMap as HashMap;
use log::debug;
use parking_lot::Mutex;

use crate::types::{ResourceId, TransactionId};

/// Result of trying to reserve a set of resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockResult {
    /// Every requested resource is now held by the requesting transaction.
    Granted,
    /// Nothing was locked; `resource` is already held by `holder`.
    Conflict {
        resource: ResourceId,
        holder: TransactionId,
    },
}

impl LockResult {
    pub fn is_granted(&self) -> bool {
        matches!(self, LockResult::Granted)
    }
}

/// Participant-local table of reserved resources.
///
/// Each held resource remembers the transaction that owns it, so a retried
/// prepare of the same transaction is not mistaken for a competing one, and a
/// release for one transaction can never free another transaction's lock.
/// Every operation runs under a single mutex, which makes the
/// check-then-lock of [`ResourceLockTable::try_lock_all`] atomic with respect
/// to concurrent vote requests.
#[derive(Debug, Default)]
pub struct ResourceLockTable {
    held: Mutex<HashMap<ResourceId, TransactionId>>,
}

impl ResourceLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves all of `resources` for `transaction`, or none of them.
    ///
    /// Resources already owned by `transaction` count as granted. On conflict
    /// the table is left unchanged and the first conflicting holder is
    /// reported.
    pub fn try_lock_all(&self, transaction: &TransactionId, resources: &[ResourceId]) -> LockResult {
        let mut held = self.held.lock();

        for resource in resources {
            if let Some(holder) = held.get(resource) {
                if holder != transaction {
                    debug!(
                        "Lock conflict on {} for {}: held by {}",
                        resource, transaction, holder
                    );
                    return LockResult::Conflict {
                        resource: resource.clone(),
                        holder: holder.clone(),
                    };
                }
            }
        }

        for resource in resources {
            held.insert(resource.clone(), transaction.clone());
        }
        debug!("Locked {} resources for {}", resources.len(), transaction);
        LockResult::Granted
    }

    /// Releases the subset of `resources` owned by `transaction`.
    ///
    /// Returns how many locks were actually released; releasing twice is a no-op.
    pub fn release(&self, transaction: &TransactionId, resources: &[ResourceId]) -> usize {
        let mut held = self.held.lock();
        let mut released = 0;
        for resource in resources {
            if held.get(resource) == Some(transaction) {
                held.remove(resource);
                released += 1;
            }
        }
        released
    }

    /// Releases every lock owned by `transaction`.
    pub fn release_all(&self, transaction: &TransactionId) -> usize {
        let mut held = self.held.lock();
        let before = held.len();
        held.retain(|_, holder| holder != transaction);
        before - held.len()
    }

    pub fn holder(&self, resource: &ResourceId) -> Option<TransactionId> {
        self.held.lock().get(resource).cloned()
    }

    /// Resources currently owned by `transaction`, in no particular order.
    pub fn held_by(&self, transaction: &TransactionId) -> Vec<ResourceId> {
        self.held
            .lock()
            .iter()
            .filter(|(_, holder)| *holder == transaction)
            .map(|(resource, _)| resource.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.lock().is_empty()
    }
}
