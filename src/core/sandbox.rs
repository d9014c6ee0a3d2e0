/// Execution sandbox
///
/// One call, one disposable environment. The lifecycle is a typestate chain
/// so an environment cannot be supervised before it is launched, and a
/// launched environment always owns the guard that removes its container:
///
/// `Environment<Staged>` → `launch()` → `Environment<Running>` → `supervise()` → evidence
use crate::config::types::{ExecutionOutcome, ResourceProfile, Result, Submission};
use crate::core::cancel::CancellationToken;
use crate::core::output::{OutputCollector, OutputIntegrity, OutputLimits, OutputObserver};
use crate::core::runtime::{ContainerReport, ContainerRuntime, LaunchSpec};
use crate::registry::ExecutionEnvironmentDescriptor;
use crate::safety::guard::ContainerGuard;
use crate::safety::workspace::{Workspace, WorkspaceManager};
use crate::verdict::classifier::{OutcomeClassifier, RunEvidence, SupervisorAction};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child, ExitStatus};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    /// Wait between runtime kill and force-killing the client process
    pub kill_grace: Duration,
    pub poll_interval: Duration,
    /// How often the container's CPU usage is sampled
    pub cpu_sample_interval: Duration,
    pub output_collection_timeout: Duration,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
            cpu_sample_interval: Duration::from_millis(100),
            output_collection_timeout: Duration::from_secs(2),
        }
    }
}

pub struct ExecutionSandbox {
    runtime: Arc<dyn ContainerRuntime>,
    workspaces: WorkspaceManager,
    settings: SandboxSettings,
}

impl ExecutionSandbox {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        workspace_root: PathBuf,
        settings: SandboxSettings,
    ) -> Result<Self> {
        Ok(Self {
            runtime,
            workspaces: WorkspaceManager::new(workspace_root)?,
            settings,
        })
    }

    /// Remove workspaces a previous process left behind
    pub fn sweep_stale_workspaces(&self, max_age: Duration) -> Result<usize> {
        self.workspaces.cleanup_stale(max_age)
    }

    /// Run `submission` in a fresh environment capped at `limits`. Never
    /// fails: infrastructure errors come back as `SandboxFault`.
    pub fn execute(
        &self,
        descriptor: &ExecutionEnvironmentDescriptor,
        submission: &Submission,
        limits: &ResourceProfile,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        self.execute_observed(descriptor, submission, limits, cancel, None)
    }

    /// Like [`execute`](Self::execute), streaming output chunks to `observer`
    pub fn execute_observed(
        &self,
        descriptor: &ExecutionEnvironmentDescriptor,
        submission: &Submission,
        limits: &ResourceProfile,
        cancel: &CancellationToken,
        observer: Option<OutputObserver>,
    ) -> ExecutionOutcome {
        let evidence = match self.run(descriptor, submission, limits, cancel, observer) {
            Ok(evidence) => evidence,
            Err(e) => RunEvidence {
                fault: Some(e.to_string()),
                ..RunEvidence::default()
            },
        };
        OutcomeClassifier::classify(evidence, self.runtime.reserved_exit_codes())
    }

    fn run(
        &self,
        descriptor: &ExecutionEnvironmentDescriptor,
        submission: &Submission,
        limits: &ResourceProfile,
        cancel: &CancellationToken,
        observer: Option<OutputObserver>,
    ) -> Result<RunEvidence> {
        let staged = Environment::stage(&self.workspaces, descriptor, submission, limits)?;

        if cancel.is_cancelled() {
            return Ok(RunEvidence {
                supervisor_action: Some(SupervisorAction::Cancelled),
                ..RunEvidence::default()
            });
        }

        let running = staged.launch(Arc::clone(&self.runtime), limits, &self.settings, observer)?;
        Ok(running.supervise(limits, cancel, &self.settings))
    }
}

pub struct Staged {
    workspace: Workspace,
    spec: LaunchSpec,
}

pub struct Running {
    workspace: Workspace,
    runtime: Arc<dyn ContainerRuntime>,
    child: Child,
    guard: ContainerGuard,
    collector: OutputCollector,
    started: Instant,
}

pub struct Environment<S> {
    state: S,
}

impl Environment<Staged> {
    /// Create the workspace and the launch spec; nothing is started yet
    pub fn stage(
        workspaces: &WorkspaceManager,
        descriptor: &ExecutionEnvironmentDescriptor,
        submission: &Submission,
        limits: &ResourceProfile,
    ) -> Result<Self> {
        let flags = submission.flags();
        let command = descriptor.command_for(submission.action())?.render(flags);

        let workspace = workspaces.create_workspace()?;
        workspace.write_crate(submission.source(), flags.edition, flags.crate_type)?;

        let backtrace = if flags.backtrace { "1" } else { "0" };
        let spec = LaunchSpec {
            container_name: format!("playbox-{}", workspace.run_id()),
            image: descriptor.image.clone(),
            command,
            workspace_dir: workspace.run_dir().to_path_buf(),
            environment: vec![("RUST_BACKTRACE".to_string(), backtrace.to_string())],
            memory_bytes: limits.max_memory_bytes,
            cpu_seconds: limits.max_cpu_seconds,
            pids_limit: limits.max_processes,
            network: descriptor.network,
        };

        Ok(Self {
            state: Staged { workspace, spec },
        })
    }

    pub fn launch_spec(&self) -> &LaunchSpec {
        &self.state.spec
    }

    /// Start the container and its output readers
    pub fn launch(
        self,
        runtime: Arc<dyn ContainerRuntime>,
        limits: &ResourceProfile,
        settings: &SandboxSettings,
        observer: Option<OutputObserver>,
    ) -> Result<Environment<Running>> {
        let Staged { workspace, spec } = self.state;

        // Guard first: a spawn that fails half way may still leave a container
        let guard = ContainerGuard::new(Arc::clone(&runtime), spec.container_name.clone());
        let mut child = runtime.spawn(&spec)?;

        log::info!(
            "Launched {} ({}) via {}: {}",
            spec.container_name,
            spec.image,
            runtime.name(),
            spec.command.join(" ")
        );

        let collector = OutputCollector::start(
            OutputLimits {
                combined_limit: limits.max_output_bytes,
                collection_timeout: settings.output_collection_timeout,
            },
            child.stdout.take(),
            child.stderr.take(),
            observer,
        );

        Ok(Environment {
            state: Running {
                workspace,
                runtime,
                child,
                guard,
                collector,
                started: Instant::now(),
            },
        })
    }
}

impl Environment<Running> {
    /// Poll until the process exits or a limit, cancellation, or error stops
    /// it. Consumes the environment; the container and workspace are gone
    /// when this returns.
    pub fn supervise(
        self,
        limits: &ResourceProfile,
        cancel: &CancellationToken,
        settings: &SandboxSettings,
    ) -> RunEvidence {
        let Running {
            workspace,
            runtime,
            mut child,
            guard,
            collector,
            started,
        } = self.state;

        let mut status: Option<ExitStatus> = None;
        let mut action: Option<SupervisorAction> = None;
        let mut fault: Option<String> = None;
        let cpu_budget = Duration::from_secs(limits.max_cpu_seconds);
        let mut next_cpu_sample = started;

        loop {
            match child.try_wait() {
                Ok(Some(exit)) => {
                    status = Some(exit);
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    fault = Some(format!("failed to poll {}: {}", guard.name(), e));
                    break;
                }
            }

            if cancel.is_cancelled() {
                action = Some(SupervisorAction::Cancelled);
                break;
            }
            if started.elapsed() >= limits.max_wall_clock {
                action = Some(SupervisorAction::WallClockExpired);
                break;
            }
            if collector.overflowed() {
                action = Some(SupervisorAction::OutputLimitExceeded);
                break;
            }
            if Instant::now() >= next_cpu_sample {
                next_cpu_sample = Instant::now() + settings.cpu_sample_interval;
                if cpu_budget_spent(runtime.as_ref(), guard.name(), cpu_budget) {
                    action = Some(SupervisorAction::CpuLimitExceeded);
                    break;
                }
            }

            thread::sleep(settings.poll_interval);
        }

        if status.is_none() {
            log::info!(
                "Terminating {} after {:?} ({:?})",
                guard.name(),
                started.elapsed(),
                action
            );
            status = terminate(runtime.as_ref(), guard.name(), &mut child, settings.kill_grace);
        }

        let output = collector.finish();

        let report = if action.is_none() && fault.is_none() {
            match runtime.inspect(guard.name()) {
                Ok(report) => report,
                Err(e) => {
                    log::warn!("Could not inspect {}: {}", guard.name(), e);
                    ContainerReport::default()
                }
            }
        } else {
            ContainerReport::default()
        };
        if let Some(error) = &report.error {
            log::warn!("Runtime recorded an error for {}: {}", guard.name(), error);
        }

        log::debug!(
            "{} finished in {:?} with {:?}",
            guard.name(),
            started.elapsed(),
            status
        );

        drop(guard);
        if let Err(e) = workspace.cleanup() {
            log::warn!("{}", e);
        }

        RunEvidence {
            exit_code: status.and_then(|s| s.code()),
            signal: status.and_then(|s| s.signal()),
            supervisor_action: action,
            oom_killed: report.oom_killed,
            container_started: report.started,
            runtime_error: report.error,
            output_truncated: output.integrity == OutputIntegrity::TruncatedByLimit,
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            fault,
        }
    }
}

/// True once every process in the container together used up `budget`
fn cpu_budget_spent(runtime: &dyn ContainerRuntime, container_name: &str, budget: Duration) -> bool {
    match runtime.cpu_usage(container_name) {
        Ok(Some(used)) if used >= budget => {
            log::info!("{} used {:?} of CPU (limit {:?})", container_name, used, budget);
            true
        }
        Ok(_) => false,
        Err(e) => {
            log::debug!("CPU sample of {} failed: {}", container_name, e);
            false
        }
    }
}

/// Runtime kill, bounded grace, then force-kill of the client process
fn terminate(
    runtime: &dyn ContainerRuntime,
    container_name: &str,
    child: &mut Child,
    grace: Duration,
) -> Option<ExitStatus> {
    if let Err(e) = runtime.kill(container_name) {
        log::warn!("Runtime kill of {} failed: {}", container_name, e);
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => thread::sleep(Duration::from_millis(10)),
            Err(_) => break,
        }
    }

    log::warn!(
        "{} did not stop within {:?}, force-killing the client",
        container_name,
        grace
    );
    let _ = child.kill();
    child.wait().ok()
}
