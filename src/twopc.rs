use crate::types::{Decision, ResourceId, TransactionId};

/// Decides how a participant votes on a proposed artifact.
///
/// The participant engine calls [`VoteDecider::decide`] once per vote request,
/// after the requested resources are known to exist locally and have been
/// reserved for the transaction. The call may block for as long as it likes
/// (for instance while waiting for a person to answer); the participant does
/// not vote until it returns, and the coordinator's vote deadline covers a
/// decider that never answers.
///
/// Implementations must be `Send` and `Sync`. Any
/// `Fn(&TransactionId, &[u8], &[ResourceId]) -> bool` closure is a decider.
///
/// # Examples
///
/// ```no_run
/// use montage::prelude::*;
///
/// // Approve only artifacts that are not empty.
/// let decider = |_txn: &TransactionId, payload: &[u8], _resources: &[ResourceId]| {
///     !payload.is_empty()
/// };
/// assert_eq!(
///     decider.decide(&TransactionId::from("t"), b"", &[]),
///     Decision::Abort
/// );
/// ```
pub trait VoteDecider: Send + Sync {
    /// Returns this participant's vote on `payload` for `resources`.
    fn decide(&self, transaction: &TransactionId, payload: &[u8], resources: &[ResourceId])
    -> Decision;
}

impl<F> VoteDecider for F
where
    F: Fn(&TransactionId, &[u8], &[ResourceId]) -> bool + Send + Sync,
{
    fn decide(
        &self,
        transaction: &TransactionId,
        payload: &[u8],
        resources: &[ResourceId],
    ) -> Decision {
        Decision::from(self(transaction, payload, resources))
    }
}

/// Approves every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysCommit;

impl VoteDecider for AlwaysCommit {
    fn decide(&self, _: &TransactionId, _: &[u8], _: &[ResourceId]) -> Decision {
        Decision::Commit
    }
}

/// Rejects every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAbort;

impl VoteDecider for AlwaysAbort {
    fn decide(&self, _: &TransactionId, _: &[u8], _: &[ResourceId]) -> Decision {
        Decision::Abort
    }
}
