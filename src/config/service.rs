/// Service configuration loaded from a JSON file
use crate::config::types::{PlayboxError, Result};
use crate::core::runtime::DEFAULT_CGROUP_ROOT;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Full service configuration file structure. Every field has a default so a
/// partial file (or `{}`) is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Container runtime CLI (`docker`, `podman`)
    pub runtime_binary: String,
    /// Parent directory for per-run workspaces
    pub workspace_root: PathBuf,
    /// Maximum concurrent sandboxes
    pub max_concurrent: usize,
    /// How long a request may wait for a free slot
    pub max_queue_wait_ms: u64,
    /// Maximum source size accepted
    pub max_source_bytes: usize,
    /// Grace period between runtime kill and force-kill of the client process
    pub kill_grace_ms: u64,
    /// Supervisor poll interval
    pub poll_interval_ms: u64,
    /// How often container CPU usage is sampled against the CPU limit
    pub cpu_sample_interval_ms: u64,
    /// Root of the cgroup hierarchy the runtime places containers under
    pub cgroup_root: PathBuf,
    /// How long to wait for output readers after the process exits
    pub output_collection_timeout_ms: u64,
    /// Workspaces older than this are swept at startup
    pub stale_workspace_max_age_secs: u64,
    /// Image overrides keyed by toolchain id
    pub images: HashMap<String, String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            runtime_binary: "docker".to_string(),
            workspace_root: default_workspace_root(),
            max_concurrent: 4,
            max_queue_wait_ms: 10_000,
            max_source_bytes: 100 * 1024,
            kill_grace_ms: 2_000,
            poll_interval_ms: 10,
            cpu_sample_interval_ms: 100,
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            output_collection_timeout_ms: 2_000,
            stale_workspace_max_age_secs: 3_600,
            images: HashMap::new(),
        }
    }
}

/// Per-user default so concurrent operators never share a workspace root
fn default_workspace_root() -> PathBuf {
    let uid = nix::unistd::geteuid().as_raw();
    std::env::temp_dir().join(format!("playbox-uid-{uid}"))
}

impl ServiceConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PlayboxError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: ServiceConfig = serde_json::from_str(&content)
            .map_err(|e| PlayboxError::Config(format!("Failed to parse config JSON: {}", e)))?;

        log::debug!("Loaded service config from {}", path.display());
        Ok(config)
    }

    pub fn max_queue_wait(&self) -> Duration {
        Duration::from_millis(self.max_queue_wait_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cpu_sample_interval(&self) -> Duration {
        Duration::from_millis(self.cpu_sample_interval_ms)
    }

    pub fn output_collection_timeout(&self) -> Duration {
        Duration::from_millis(self.output_collection_timeout_ms)
    }

    pub fn stale_workspace_max_age(&self) -> Duration {
        Duration::from_secs(self.stale_workspace_max_age_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.runtime_binary, "docker");
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.max_source_bytes, 102_400);
        assert_eq!(config.max_queue_wait(), Duration::from_secs(10));
        assert_eq!(config.cpu_sample_interval(), Duration::from_millis(100));
        assert_eq!(config.stale_workspace_max_age(), Duration::from_secs(3600));
        assert_eq!(config.cgroup_root, PathBuf::from("/sys/fs/cgroup"));
        assert!(config
            .workspace_root
            .to_string_lossy()
            .contains("playbox-uid-"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"max_concurrent": 2, "images": {{"nightly": "registry.local/rust-nightly:2024-06-01"}}}}"#
        )
        .unwrap();

        let config = ServiceConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.kill_grace_ms, 2_000);
        assert_eq!(
            config.images.get("nightly").map(String::as_str),
            Some("registry.local/rust-nightly:2024-06-01")
        );
    }

    #[test]
    fn test_unreadable_and_malformed_files() {
        let err = ServiceConfig::load_from_file("/nonexistent/playbox.json").unwrap_err();
        assert!(matches!(err, PlayboxError::Config(_)));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = ServiceConfig::load_from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("parse"));
    }
}
