//! Per-execution workspace directories
//!
//! Every execution gets its own directory under the configured root, named
//! after its execution id. The [`Workspace`] handle owns the directory: it is
//! removed by [`Workspace::release`] or, failing that, when the handle is
//! dropped, so panics and cancelled futures still clean up.

use crate::error::{Result, SandboxError};
use crate::execution::ExecutionId;
use crate::types::Submission;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::io::AsyncReadExt;

/// File name the toolchain is invoked on
pub const SOURCE_FILE: &str = "main.go";

/// Prefix of every workspace directory
pub const WORKSPACE_PREFIX: &str = "goplay-";

/// Allocates and sweeps workspaces under one root directory
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh directory for `id` and write the submission's source into it
    pub async fn acquire(&self, id: ExecutionId, submission: &Submission) -> Result<Workspace> {
        let dir = self.root.join(format!("{}{}", WORKSPACE_PREFIX, id));

        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            SandboxError::Internal(format!(
                "failed to create workspace root {}: {}",
                self.root.display(),
                e
            ))
        })?;

        // create_dir, not create_dir_all: an existing directory means a collision
        tokio::fs::create_dir(&dir).await.map_err(|e| {
            SandboxError::Internal(format!(
                "failed to create workspace {}: {}",
                dir.display(),
                e
            ))
        })?;

        // From here on the handle owns the directory and removes it on any error
        let workspace = Workspace {
            id,
            dir,
            released: false,
        };

        restrict_permissions(&workspace.dir).await.map_err(|e| {
            SandboxError::Internal(format!(
                "failed to restrict workspace permissions {}: {}",
                workspace.dir.display(),
                e
            ))
        })?;

        tokio::fs::write(workspace.source_path(), submission.source())
            .await
            .map_err(|e| {
                SandboxError::Internal(format!(
                    "failed to write source into {}: {}",
                    workspace.dir.display(),
                    e
                ))
            })?;

        tracing::debug!(
            execution_id = %id,
            path = %workspace.dir.display(),
            "Workspace acquired"
        );
        Ok(workspace)
    }

    /// Workspace directories currently present under the root
    pub fn live_workspaces(&self) -> io::Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry?;
            let is_workspace = entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(WORKSPACE_PREFIX))
                .unwrap_or(false);
            if is_workspace && entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }

    /// Remove workspaces older than `min_age`, left behind by a crashed process.
    ///
    /// Returns the number of directories removed.
    pub fn sweep_stale(&self, min_age: Duration) -> io::Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;

        for dir in self.live_workspaces()? {
            let modified = fs::metadata(&dir).and_then(|m| m.modified());
            let age = match modified {
                Ok(modified) => now.duration_since(modified).unwrap_or(Duration::ZERO),
                Err(_) => continue,
            };
            if age < min_age {
                continue;
            }
            match fs::remove_dir_all(&dir) {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(path = %dir.display(), error = %e, "Failed to remove stale workspace")
                }
            }
        }

        if removed > 0 {
            tracing::info!(removed, root = %self.root.display(), "Removed stale workspaces");
        }
        Ok(removed)
    }
}

/// Exclusive handle to one execution's directory
#[derive(Debug)]
pub struct Workspace {
    id: ExecutionId,
    dir: PathBuf,
    released: bool,
}

impl Workspace {
    pub fn id(&self) -> ExecutionId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn source_path(&self) -> PathBuf {
        self.dir.join(SOURCE_FILE)
    }

    /// Read a build artifact, refusing anything larger than `max_bytes`
    pub async fn read_artifact(&self, name: &str, max_bytes: u64) -> io::Result<Vec<u8>> {
        let path = self.dir.join(name);
        let file = tokio::fs::File::open(&path).await?;
        let len = file.metadata().await?.len();
        if len > max_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("artifact {} is {} bytes, limit is {}", name, len, max_bytes),
            ));
        }

        // the file may still grow if a stray process holds it open
        let mut data = Vec::with_capacity(len as usize);
        file.take(max_bytes + 1).read_to_end(&mut data).await?;
        if data.len() as u64 > max_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("artifact {} exceeds {} bytes", name, max_bytes),
            ));
        }
        Ok(data)
    }

    /// Remove the directory. Failures are reported, never retried.
    pub async fn release(mut self) -> io::Result<()> {
        self.released = true;
        let result = match tokio::fs::remove_dir_all(&self.dir).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        };
        tracing::debug!(execution_id = %self.id, ok = result.is_ok(), "Workspace released");
        result
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                tracing::debug!(execution_id = %self.id, "Workspace removed on drop");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    execution_id = %self.id,
                    path = %self.dir.display(),
                    error = %e,
                    "Failed to remove workspace"
                );
            }
        }
    }
}

#[cfg(unix)]
async fn restrict_permissions(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(dir, fs::Permissions::from_mode(0o700)).await
}

#[cfg(not(unix))]
async fn restrict_permissions(_dir: &Path) -> io::Result<()> {
    Ok(())
}
