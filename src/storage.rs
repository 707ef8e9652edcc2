use log::debug;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use crate::errors::{MontageError, Result};
use crate::types::{ResourceId, TransactionId};

/// Destination of a committed artifact.
///
/// The coordinator calls [`ArtifactSink::write`] only after the commit
/// decision is durable, and calls it again when it recovers that decision, so
/// implementations must tolerate being asked to write the same artifact twice.
///
/// Implementations must be `Send` and `Sync` to be shared by concurrent
/// transactions.
///
/// # Examples
///
/// A sink that only records what it was asked to write:
///
/// ```no_run
/// use montage::prelude::*;
/// use parking_lot::Mutex;
/// use std::collections::HashMap;
///
/// #[derive(Default)]
/// struct RecordingSink {
///     written: Mutex<HashMap<String, Vec<u8>>>,
/// }
///
/// impl ArtifactSink for RecordingSink {
///     fn write(&self, id: &TransactionId, payload: &[u8]) -> Result<()> {
///         self.written.lock().insert(id.to_string(), payload.to_vec());
///         Ok(())
///     }
/// }
/// ```
pub trait ArtifactSink: Send + Sync {
    /// Checks whether an artifact named `id` can be written at all.
    ///
    /// The coordinator calls this before a transaction starts. A name this
    /// returns an error for is refused without contacting any participant.
    fn validate(&self, _id: &TransactionId) -> Result<()> {
        Ok(())
    }

    /// Creates or overwrites the artifact named by `id` with `payload`.
    fn write(&self, id: &TransactionId, payload: &[u8]) -> Result<()>;
}

/// Accepts only ids that name a single file, as [`DirectoryArtifactSink`] requires.
pub fn validate_artifact_name(id: &TransactionId) -> Result<()> {
    plain_file_name(id.as_str())
        .map(|_| ())
        .ok_or_else(|| MontageError::InvalidArtifactName(id.to_string()))
}

/// A participant's view of its local sources.
///
/// Implementations must be `Send` and `Sync`.
pub trait SourceStore: Send + Sync {
    /// Whether `resource` exists locally and can be offered to a transaction.
    fn contains(&self, resource: &ResourceId) -> bool;

    /// Consumes `resource` after its transaction committed.
    ///
    /// Finalizing an already-finalized resource succeeds without effect.
    fn finalize(&self, resource: &ResourceId) -> Result<()>;
}

/// Writes each artifact as a file named after its transaction id.
pub struct DirectoryArtifactSink {
    dir: PathBuf,
}

impl DirectoryArtifactSink {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_of(&self, id: &TransactionId) -> Option<PathBuf> {
        plain_file_name(id.as_str()).map(|name| self.dir.join(name))
    }
}

impl ArtifactSink for DirectoryArtifactSink {
    fn validate(&self, id: &TransactionId) -> Result<()> {
        validate_artifact_name(id)
    }

    fn write(&self, id: &TransactionId, payload: &[u8]) -> Result<()> {
        let target = self
            .path_of(id)
            .ok_or_else(|| MontageError::InvalidArtifactName(id.to_string()))?;
        let temp = target.with_file_name(format!(".{}.partial", id));
        {
            let mut file = File::create(&temp)?;
            file.write_all(payload)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &target)?;
        debug!("Wrote artifact {} ({} bytes)", target.display(), payload.len());
        Ok(())
    }
}

/// Serves sources from files in a directory; finalizing deletes the file.
pub struct DirectorySourceStore {
    dir: PathBuf,
}

impl DirectorySourceStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_of(&self, resource: &ResourceId) -> Option<PathBuf> {
        plain_file_name(resource.as_str()).map(|name| self.dir.join(name))
    }
}

impl SourceStore for DirectorySourceStore {
    fn contains(&self, resource: &ResourceId) -> bool {
        self.path_of(resource).is_some_and(|path| path.is_file())
    }

    fn finalize(&self, resource: &ResourceId) -> Result<()> {
        let Some(path) = self.path_of(resource) else {
            return Ok(());
        };
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Finalized source {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// Only a single normal path component may address a file inside the directory.
fn plain_file_name(name: &str) -> Option<&str> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Some(name),
        _ => None,
    }
}
