//! Shared fixtures: a container runtime backed by plain local processes.
#![allow(dead_code)]

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use playbox::config::service::ServiceConfig;
use playbox::config::types::{Action, PlayboxError, ResourceProfile, Result};
use playbox::core::runtime::{ContainerReport, ContainerRuntime, LaunchSpec};
use playbox::registry::{
    CommandTemplate, ExecutionEnvironmentDescriptor, NetworkPolicy, Toolchain, ToolchainRegistry,
};
use playbox::DispatchEngine;
use playbox::observability::metrics::MetricsRegistry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Runs the launch command directly in the workspace, each "container" in
/// its own process group so kill/remove take down everything it started.
#[derive(Default)]
pub struct LocalRuntime {
    pids: Mutex<HashMap<String, i32>>,
    live: Mutex<HashSet<String>>,
    removed: Mutex<Vec<String>>,
    specs: Mutex<Vec<LaunchSpec>>,
    spawns: AtomicUsize,
    max_live: AtomicUsize,
    report_oom: AtomicBool,
    runtime_error: Mutex<Option<String>>,
}

impl LocalRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_report_oom(&self, oom: bool) {
        self.report_oom.store(oom, Ordering::SeqCst);
    }

    /// Make `inspect` report an error recorded by the runtime
    pub fn set_runtime_error(&self, error: &str) {
        *self.runtime_error.lock().unwrap() = Some(error.to_string());
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub fn specs(&self) -> Vec<LaunchSpec> {
        self.specs.lock().unwrap().clone()
    }

    pub fn pid_of(&self, name: &str) -> Option<i32> {
        self.pids.lock().unwrap().get(name).copied()
    }

    /// Block until `n` processes have been spawned
    pub fn wait_for_spawns(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.spawn_count() >= n {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn kill_group(&self, name: &str) {
        if let Some(pid) = self.pid_of(name) {
            let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }
}

impl ContainerRuntime for LocalRuntime {
    fn name(&self) -> &str {
        "local"
    }

    fn spawn(&self, spec: &LaunchSpec) -> Result<Child> {
        self.specs.lock().unwrap().push(spec.clone());

        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| PlayboxError::Runtime("empty command".to_string()))?;

        let child = Command::new(program)
            .args(args)
            .current_dir(&spec.workspace_dir)
            .envs(spec.environment.iter().map(|(k, v)| (k, v)))
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| PlayboxError::Runtime(format!("spawn {program}: {e}")))?;

        self.spawns.fetch_add(1, Ordering::SeqCst);
        self.pids
            .lock()
            .unwrap()
            .insert(spec.container_name.clone(), child.id() as i32);

        let mut live = self.live.lock().unwrap();
        live.insert(spec.container_name.clone());
        self.max_live.fetch_max(live.len(), Ordering::SeqCst);

        Ok(child)
    }

    fn kill(&self, container_name: &str) -> Result<()> {
        self.kill_group(container_name);
        Ok(())
    }

    fn inspect(&self, container_name: &str) -> Result<ContainerReport> {
        Ok(ContainerReport {
            oom_killed: self.report_oom.load(Ordering::SeqCst),
            started: self.pid_of(container_name).is_some(),
            error: self.runtime_error.lock().unwrap().clone(),
        })
    }

    fn cpu_usage(&self, container_name: &str) -> Result<Option<Duration>> {
        Ok(self.pid_of(container_name).map(group_cpu_time))
    }

    fn remove(&self, container_name: &str) -> Result<()> {
        self.kill_group(container_name);
        self.live.lock().unwrap().remove(container_name);
        self.removed.lock().unwrap().push(container_name.to_string());
        Ok(())
    }

    fn image_available(&self, _image: &str) -> Result<bool> {
        Ok(true)
    }

    fn version(&self) -> Result<String> {
        Ok("local".to_string())
    }
}

pub fn profile(wall: Duration) -> ResourceProfile {
    ResourceProfile {
        max_cpu_seconds: 10,
        max_memory_bytes: 512 * 1024 * 1024,
        max_wall_clock: wall,
        max_output_bytes: 64 * 1024,
        max_processes: 64,
    }
}

/// Descriptor whose only action runs `argv` verbatim
pub fn descriptor(
    toolchain: Toolchain,
    action: Action,
    argv: &[&str],
    profile: ResourceProfile,
) -> ExecutionEnvironmentDescriptor {
    ExecutionEnvironmentDescriptor {
        toolchain,
        name: format!("test {toolchain}"),
        version: "test".to_string(),
        image: format!("local/{toolchain}"),
        commands: BTreeMap::from([(action, CommandTemplate::new(argv.iter().copied()))]),
        profile,
        network: NetworkPolicy::Deny,
    }
}

pub fn registry(descriptors: Vec<ExecutionEnvironmentDescriptor>) -> Arc<ToolchainRegistry> {
    Arc::new(ToolchainRegistry::from_descriptors(descriptors))
}

pub fn config(workspace_root: &Path, max_concurrent: usize, max_queue_wait_ms: u64) -> ServiceConfig {
    ServiceConfig {
        workspace_root: workspace_root.to_path_buf(),
        max_concurrent,
        max_queue_wait_ms,
        kill_grace_ms: 500,
        poll_interval_ms: 5,
        cpu_sample_interval_ms: 20,
        output_collection_timeout_ms: 1_000,
        ..ServiceConfig::default()
    }
}

pub fn engine(
    runtime: &Arc<LocalRuntime>,
    registry: Arc<ToolchainRegistry>,
    config: &ServiceConfig,
) -> DispatchEngine {
    DispatchEngine::new(registry, Arc::clone(runtime) as Arc<dyn ContainerRuntime>, config)
        .unwrap()
        .with_metrics(Arc::new(MetricsRegistry::new()))
}

/// CPU time of every live process in process group `pgid`, plus what their
/// reaped children used
fn group_cpu_time(pgid: i32) -> Duration {
    // SAFETY: sysconf has no preconditions
    let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) }.max(1) as u64;
    let mut ticks = 0u64;

    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Duration::ZERO;
    };
    for entry in entries.flatten() {
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        // Fields after the parenthesised command name, starting at `state`
        let Some((_, rest)) = stat.rsplit_once(')') else {
            continue;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() < 15 || fields[2].parse::<i32>().ok() != Some(pgid) {
            continue;
        }
        // utime, stime, cutime, cstime
        ticks += fields[11..15]
            .iter()
            .filter_map(|f| f.parse::<u64>().ok())
            .sum::<u64>();
    }

    Duration::from_millis(ticks * 1000 / ticks_per_sec)
}

/// True once no process with `pid` exists
pub fn process_gone(pid: i32) -> bool {
    matches!(
        nix::sys::signal::kill(Pid::from_raw(pid), None),
        Err(nix::errno::Errno::ESRCH)
    )
}
