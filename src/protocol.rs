use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::types::{Decision, ResourceId, TransactionId};

/// A protocol message exchanged between the coordinator and participants.
///
/// Messages carry no sender field; the transport reports who sent them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Phase 1: asks a participant to reserve `resources` and vote on `payload`.
    VoteRequest {
        transaction: TransactionId,
        resources: Vec<ResourceId>,
        payload: Vec<u8>,
    },
    /// A participant's answer to a vote request.
    Vote {
        transaction: TransactionId,
        vote: Decision,
    },
    /// Phase 2: the coordinator's final decision, scoped to the receiver's resources.
    Outcome {
        transaction: TransactionId,
        decision: Decision,
        resources: Vec<ResourceId>,
    },
    /// A participant has applied the outcome and released its locks.
    Ack { transaction: TransactionId },
    /// Asks the coordinator to start a new transaction.
    Submit {
        transaction: TransactionId,
        payload: Vec<u8>,
        sources: Vec<String>,
    },
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn transaction(&self) -> &TransactionId {
        match self {
            Message::VoteRequest { transaction, .. }
            | Message::Vote { transaction, .. }
            | Message::Outcome { transaction, .. }
            | Message::Ack { transaction }
            | Message::Submit { transaction, .. } => transaction,
        }
    }

    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::VoteRequest { .. } => "vote-request",
            Message::Vote { .. } => "vote",
            Message::Outcome { .. } => "outcome",
            Message::Ack { .. } => "ack",
            Message::Submit { .. } => "submit",
        }
    }
}
