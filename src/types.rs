use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::{MontageError, Result};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifies one commit transaction. The artifact name doubles as the id,
    /// so a transaction id is never reused for a different artifact.
    TransactionId
);

string_id!(
    /// Name under which a node is addressable on the transport.
    NodeId
);

string_id!(
    /// A participant-local source that a transaction must reserve.
    ResourceId
);

/// Outcome of a transaction, and also the shape of a participant's vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    Commit,
    Abort,
}

impl Decision {
    pub fn is_commit(self) -> bool {
        matches!(self, Decision::Commit)
    }
}

impl From<bool> for Decision {
    fn from(commit: bool) -> Self {
        if commit {
            Decision::Commit
        } else {
            Decision::Abort
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Commit => f.write_str("COMMIT"),
            Decision::Abort => f.write_str("ABORT"),
        }
    }
}

/// Resources each participant must supply, keyed by participant.
pub type ParticipantResources = BTreeMap<NodeId, Vec<ResourceId>>;

/// Resolves a flat `node:resource` list into a per-node resource list.
///
/// Each entry is split at its first `:`; both halves must be non-empty. The
/// order of resources within a node follows the order of the input list.
///
/// # Errors
///
/// Returns [`MontageError::MalformedSource`] for the first entry that cannot be
/// split, and [`MontageError::EmptyTransaction`] when `sources` is empty.
///
/// # Examples
///
/// ```
/// use montage::types::{parse_sources, NodeId, ResourceId};
///
/// let map = parse_sources("mural.jpg", &["alice:a.png", "bob:b.png", "alice:c.png"]).unwrap();
/// assert_eq!(
///     map[&NodeId::from("alice")],
///     vec![ResourceId::from("a.png"), ResourceId::from("c.png")]
/// );
/// ```
pub fn parse_sources<S: AsRef<str>>(
    transaction: &str,
    sources: &[S],
) -> Result<ParticipantResources> {
    if sources.is_empty() {
        return Err(MontageError::EmptyTransaction(transaction.to_string()));
    }

    let mut map = ParticipantResources::new();
    for entry in sources {
        let entry = entry.as_ref();
        let (node, resource) = entry
            .split_once(':')
            .ok_or_else(|| MontageError::MalformedSource(entry.to_string()))?;
        if node.is_empty() || resource.is_empty() {
            return Err(MontageError::MalformedSource(entry.to_string()));
        }
        map.entry(NodeId::from(node))
            .or_default()
            .push(ResourceId::from(resource));
    }
    Ok(map)
}
