/// Container runtime seam.
///
/// The sandbox drives containers only through [`ContainerRuntime`]. The
/// production implementation shells out to a Docker-compatible CLI; tests
/// substitute a local process runtime.
use crate::config::types::{PlayboxError, Result};
use crate::registry::NetworkPolicy;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Mount point of the run workspace inside the container
pub const WORKSPACE_MOUNT: &str = "/playground";

/// Runtime failure codes of `docker run` (daemon error, command not
/// executable, command not found)
pub const DOCKER_RESERVED_EXIT_CODES: [i32; 3] = [125, 126, 127];

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// `StartedAt` of a container whose process never ran
const ZERO_TIMESTAMP_PREFIX: &str = "0001-01-01";

/// Everything a runtime needs to start one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub container_name: String,
    pub image: String,
    pub command: Vec<String>,
    /// Host directory bind-mounted read-only at [`WORKSPACE_MOUNT`]
    pub workspace_dir: PathBuf,
    pub environment: Vec<(String, String)>,
    pub memory_bytes: u64,
    pub cpu_seconds: u64,
    pub pids_limit: u32,
    pub network: NetworkPolicy,
}

/// Post-mortem facts the runtime knows and the exit status does not
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerReport {
    pub oom_killed: bool,
    /// The container's main process was started
    pub started: bool,
    /// Error the runtime recorded while creating or starting the container
    pub error: Option<String>,
}

pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;

    /// Start the container. The returned child is the client process whose
    /// stdout/stderr carry the container's streams.
    fn spawn(&self, spec: &LaunchSpec) -> Result<Child>;

    fn kill(&self, container_name: &str) -> Result<()>;

    fn inspect(&self, container_name: &str) -> Result<ContainerReport>;

    /// Total CPU time consumed by every process in the container so far.
    /// `None` while the runtime cannot tell (not created yet, no accounting).
    fn cpu_usage(&self, container_name: &str) -> Result<Option<Duration>>;

    /// Remove the container. Removing an unknown container is not an error.
    fn remove(&self, container_name: &str) -> Result<()>;

    fn image_available(&self, image: &str) -> Result<bool>;

    /// Runtime version string, used by dependency checks
    fn version(&self) -> Result<String>;

    /// Exit codes that mean the runtime failed, not the workload
    fn reserved_exit_codes(&self) -> &[i32] {
        &DOCKER_RESERVED_EXIT_CODES
    }
}

/// Docker-compatible CLI runtime (`docker`, `podman`)
#[derive(Debug)]
pub struct DockerCli {
    binary: String,
    cgroup_root: PathBuf,
    /// Container name to full id, filled on first CPU sample
    ids: Mutex<HashMap<String, String>>,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            ids: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_cgroup_root(mut self, cgroup_root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = cgroup_root.into();
        self
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Arguments for `<binary> run`
    pub fn run_args(spec: &LaunchSpec) -> Vec<String> {
        let network = match spec.network {
            NetworkPolicy::Deny => "none",
            NetworkPolicy::Allow => "bridge",
        };

        let mut args: Vec<String> = vec![
            "run".into(),
            "--name".into(),
            spec.container_name.clone(),
            "--network".into(),
            network.into(),
            "--memory".into(),
            spec.memory_bytes.to_string(),
            "--memory-swap".into(),
            spec.memory_bytes.to_string(),
            // The supervisor enforces the container-wide CPU budget from the
            // cgroup; this per-process rlimit only backs it up
            "--ulimit".into(),
            format!("cpu={}:{}", spec.cpu_seconds * 2, spec.cpu_seconds * 2 + 1),
            "--pids-limit".into(),
            spec.pids_limit.to_string(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--read-only".into(),
            "--tmpfs".into(),
            "/tmp:rw,exec,nosuid,size=512m".into(),
            "--mount".into(),
            format!(
                "type=bind,source={},target={},readonly",
                spec.workspace_dir.display(),
                WORKSPACE_MOUNT
            ),
            "--workdir".into(),
            WORKSPACE_MOUNT.into(),
            "--env".into(),
            "CARGO_TARGET_DIR=/tmp/target".into(),
        ];

        for (key, value) in &spec.environment {
            args.push("--env".into());
            args.push(format!("{key}={value}"));
        }

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }

    fn container_id(&self, container_name: &str) -> Result<Option<String>> {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(id) = ids.get(container_name) {
            return Ok(Some(id.clone()));
        }

        let output = self.output(&["inspect", "--format", "{{.Id}}", container_name])?;
        if !output.status.success() {
            return Ok(None);
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            return Ok(None);
        }
        ids.insert(container_name.to_string(), id.clone());
        Ok(Some(id))
    }

    fn output(&self, args: &[&str]) -> Result<Output> {
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                PlayboxError::Runtime(format!("failed to invoke {} {}: {}", self.binary, args.join(" "), e))
            })
    }
}

/// Parse `OOMKilled|StartedAt|Error` as printed by `inspect`
fn parse_state(line: &str) -> ContainerReport {
    let mut fields = line.trim().splitn(3, '|');
    let oom_killed = fields.next().map(str::trim) == Some("true");
    let started = fields
        .next()
        .map(str::trim)
        .is_some_and(|at| !at.is_empty() && !at.starts_with(ZERO_TIMESTAMP_PREFIX));
    let error = fields
        .next()
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string);

    ContainerReport {
        oom_killed,
        started,
        error,
    }
}

/// CPU usage of container `id` under the systemd or cgroupfs driver layout,
/// cgroup v2 first, then v1 `cpuacct`
fn cgroup_cpu_usage(cgroup_root: &Path, id: &str) -> Option<Duration> {
    let scope = format!("docker-{id}.scope");
    let v2 = [
        cgroup_root.join("system.slice").join(&scope),
        cgroup_root.join("docker").join(id),
    ];
    for dir in &v2 {
        if let Ok(content) = fs::read_to_string(dir.join("cpu.stat")) {
            return parse_cpu_stat(&content).map(Duration::from_micros);
        }
    }

    let v1 = [
        cgroup_root.join("cpu,cpuacct").join("system.slice").join(&scope),
        cgroup_root.join("cpu,cpuacct").join("docker").join(id),
    ];
    for dir in &v1 {
        if let Ok(content) = fs::read_to_string(dir.join("cpuacct.usage")) {
            return content.trim().parse::<u64>().ok().map(Duration::from_nanos);
        }
    }

    None
}

/// `usage_usec` from a cgroup v2 `cpu.stat`
fn parse_cpu_stat(content: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["usage_usec", value] => value.parse::<u64>().ok(),
            _ => None,
        }
    })
}

fn is_missing_container(output: &Output) -> bool {
    String::from_utf8_lossy(&output.stderr)
        .to_lowercase()
        .contains("no such container")
}

impl ContainerRuntime for DockerCli {
    fn name(&self) -> &str {
        &self.binary
    }

    fn spawn(&self, spec: &LaunchSpec) -> Result<Child> {
        log::debug!("Starting container {} from {}", spec.container_name, spec.image);

        Command::new(&self.binary)
            .args(Self::run_args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PlayboxError::Runtime(format!("failed to spawn {}: {}", self.binary, e)))
    }

    fn kill(&self, container_name: &str) -> Result<()> {
        let output = self.output(&["kill", "--signal", "KILL", container_name])?;
        if output.status.success() || is_missing_container(&output) {
            return Ok(());
        }
        Err(PlayboxError::Runtime(format!(
            "kill {} failed: {}",
            container_name,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }

    fn inspect(&self, container_name: &str) -> Result<ContainerReport> {
        let output = self.output(&[
            "inspect",
            "--format",
            "{{.State.OOMKilled}}|{{.State.StartedAt}}|{{.State.Error}}",
            container_name,
        ])?;
        if !output.status.success() {
            return Err(PlayboxError::Runtime(format!(
                "inspect {} failed: {}",
                container_name,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(parse_state(&String::from_utf8_lossy(&output.stdout)))
    }

    fn cpu_usage(&self, container_name: &str) -> Result<Option<Duration>> {
        let Some(id) = self.container_id(container_name)? else {
            return Ok(None);
        };
        Ok(cgroup_cpu_usage(&self.cgroup_root, &id))
    }

    fn remove(&self, container_name: &str) -> Result<()> {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(container_name);

        let output = self.output(&["rm", "--force", "--volumes", container_name])?;
        if output.status.success() || is_missing_container(&output) {
            return Ok(());
        }
        Err(PlayboxError::Runtime(format!(
            "rm {} failed: {}",
            container_name,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }

    fn image_available(&self, image: &str) -> Result<bool> {
        let output = self.output(&["image", "inspect", "--format", "{{.Id}}", image])?;
        Ok(output.status.success())
    }

    fn version(&self) -> Result<String> {
        let output = self.output(&["version", "--format", "{{.Server.Version}}"])?;
        if !output.status.success() {
            return Err(PlayboxError::Runtime(format!(
                "{} is installed but the daemon is unreachable: {}",
                self.binary,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
