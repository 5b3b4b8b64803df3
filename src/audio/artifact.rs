//! # Turn Artifacts
//!
//! Temporary files a turn creates in the staging directory: the uploaded input
//! audio and the synthesized reply audio. Every file is represented by a
//! [`TempArtifact`] guard whose `Drop` removes it, so an early return with `?`
//! anywhere in the pipeline still cleans up.
//!
//! ## Naming:
//! `<session-id>-<turn-seq>-<label>.<ext>`, e.g.
//! `1b4e28ba-2fa1-11d2-883f-0016d3cca427-0003-input.webm`. Concurrent sessions
//! and consecutive turns of one session therefore never share a path.

use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// The directory where turn artifacts are staged.
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    /// Use `dir` for artifacts, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Reserve a path for one artifact of a turn. Nothing is written yet; the
    /// returned guard removes whatever ends up at the path.
    pub fn artifact(&self, session_id: Uuid, turn_seq: u64, label: &str, ext: &str) -> TempArtifact {
        let file_name = format!("{}-{:04}-{}.{}", session_id, turn_seq, label, ext);
        TempArtifact {
            path: self.dir.join(file_name),
        }
    }
}

/// Owned temporary file, removed when dropped.
#[derive(Debug)]
pub struct TempArtifact {
    path: PathBuf,
}

impl TempArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `bytes` to the artifact, replacing any previous content.
    pub async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        tokio::fs::write(&self.path, bytes).await
    }

    pub async fn read(&self) -> io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed turn artifact"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove turn artifact"),
        }
    }
}
