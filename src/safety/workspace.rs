/// Run-scoped workspaces
///
/// Each execution gets a fresh uuid-named directory holding a minimal crate
/// (manifest, lockfile, one source file). The directory is removed on every
/// exit path: explicitly through `cleanup`, and again on drop.
use crate::config::types::{CrateType, Edition, PlayboxError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Package name of every generated crate
pub const CRATE_NAME: &str = "playground";

pub struct Workspace {
    run_id: String,
    run_dir: PathBuf,
}

impl Workspace {
    fn new(base_dir: &Path) -> Result<Self> {
        let run_id = Uuid::new_v4().to_string();
        let run_dir = base_dir.join(&run_id);

        fs::create_dir(&run_dir).map_err(|e| {
            PlayboxError::Workspace(format!(
                "Failed to create workspace directory {}: {}",
                run_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            run_id,
            run_dir,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Lay out a single-file crate around `source`
    pub fn write_crate(&self, source: &str, edition: Edition, crate_type: CrateType) -> Result<PathBuf> {
        write_file(&self.run_dir.join("Cargo.toml"), &manifest(edition))?;
        write_file(&self.run_dir.join("Cargo.lock"), LOCKFILE)?;

        let source_path = self.run_dir.join(crate_type.source_path());
        if let Some(parent) = source_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                PlayboxError::Workspace(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        write_file(&source_path, source)?;

        Ok(source_path)
    }

    /// Cleanup workspace (idempotent)
    pub fn cleanup(&self) -> Result<()> {
        match fs::remove_dir_all(&self.run_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PlayboxError::Workspace(format!(
                "Failed to remove run directory {}: {}",
                self.run_dir.display(),
                e
            ))),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            log::warn!("{}", e);
        }
    }
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).map_err(|e| {
        PlayboxError::Workspace(format!("Failed to write {}: {}", path.display(), e))
    })
}

fn manifest(edition: Edition) -> String {
    format!(
        "[package]\nname = \"{CRATE_NAME}\"\nversion = \"0.0.0\"\nedition = \"{}\"\n\n[dependencies]\n",
        edition.as_str()
    )
}

// The workspace is mounted read-only, so cargo must find a lockfile it has
// no reason to rewrite.
const LOCKFILE: &str = "# This file is automatically @generated by Cargo.\n\
# It is not intended for manual editing.\n\
version = 3\n\
\n\
[[package]]\n\
name = \"playground\"\n\
version = \"0.0.0\"\n";

/// Hands out workspaces under one base directory
pub struct WorkspaceManager {
    base_dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir).map_err(|e| {
            PlayboxError::Workspace(format!(
                "Failed to create workspace base directory {}: {}",
                base_dir.display(),
                e
            ))
        })?;

        Ok(Self { base_dir })
    }

    pub fn create_workspace(&self) -> Result<Workspace> {
        Workspace::new(&self.base_dir)
    }

    /// Remove workspaces left behind by a crashed process
    pub fn cleanup_stale(&self, max_age: std::time::Duration) -> Result<usize> {
        let now = std::time::SystemTime::now();
        let mut cleaned = 0;

        for entry in fs::read_dir(&self.base_dir)? {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    log::warn!("Failed to read directory entry: {}", e);
                    continue;
                }
            };
            if !path.is_dir() {
                continue;
            }

            let age = fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());

            if age.is_some_and(|age| age > max_age) {
                log::info!("Cleaning up stale workspace: {}", path.display());
                match fs::remove_dir_all(&path) {
                    Ok(()) => cleaned += 1,
                    Err(e) => log::warn!("Failed to remove stale workspace {}: {}", path.display(), e),
                }
            }
        }

        Ok(cleaned)
    }
}
