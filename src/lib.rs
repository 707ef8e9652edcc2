//! Crash-safe two-phase commit of composite artifacts.
//!
//! A [`Coordinator`] asks every [`Participant`] that owns one of an
//! artifact's sources to reserve them and vote; the artifact is written only
//! if every vote is commit. Both roles keep a [`RecoveryLog`] so that a
//! restart in the middle of the protocol resumes where it left off instead of
//! leaving sources locked or the outcome unknown.

pub mod config;
pub mod coordinator;
pub mod errors;
pub mod lock_table;
pub mod participant;
pub mod protocol;
pub mod recovery_log;
pub mod registry;
pub mod storage;
pub mod transport;
pub mod twopc;
pub mod types;

pub use config::{CoordinatorConfig, NodeConfig, ParticipantConfig};
pub use coordinator::Coordinator;
pub use errors::{MontageError, Result};
pub use lock_table::{LockResult, ResourceLockTable};
pub use participant::Participant;
pub use protocol::Message;
pub use recovery_log::{
    CoordinatorRecord, FileLog, LogRecord, MemoryLog, ParticipantPhase, ParticipantRecord,
    RecoveryLog,
};
pub use registry::{TransactionEntry, TransactionPhase, TransactionRegistry};
pub use storage::{ArtifactSink, DirectoryArtifactSink, DirectorySourceStore, SourceStore};
pub use transport::{LocalNetwork, MessageHandler, Transport};
pub use twopc::{AlwaysAbort, AlwaysCommit, VoteDecider};
pub use types::{Decision, NodeId, ParticipantResources, ResourceId, TransactionId};

pub mod prelude {
    pub use crate::config::*;
    pub use crate::coordinator::*;
    pub use crate::errors::*;
    pub use crate::lock_table::*;
    pub use crate::participant::*;
    pub use crate::recovery_log::*;
    pub use crate::storage::*;
    pub use crate::transport::*;
    pub use crate::twopc::*;
    pub use crate::types::*;
}
