/// Dispatch engine
///
/// Validates a submission, resolves its toolchain, waits for a concurrency
/// slot, and runs it in the sandbox under the effective limits. Client errors
/// are returned before any slot or sandbox is touched; everything after
/// admission resolves to an `ExecutionOutcome`.
use crate::config::service::ServiceConfig;
use crate::config::types::{ClientError, ExecutionOutcome, LimitKind, LimitOverrides, Result, Submission};
use crate::config::validator::{validate_overrides, validate_submission};
use crate::core::cancel::CancellationToken;
use crate::core::output::OutputObserver;
use crate::core::runtime::ContainerRuntime;
use crate::core::sandbox::{ExecutionSandbox, SandboxSettings};
use crate::dispatch::slots::{Admission, SlotPool};
use crate::observability::audit::AuditContext;
use crate::observability::metrics::{get_metrics, MetricsRegistry};
use crate::registry::{ExecutionEnvironmentDescriptor, ToolchainRegistry};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-request knobs
#[derive(Clone, Default)]
pub struct DispatchOptions {
    /// Tighten-only limit overrides
    pub overrides: LimitOverrides,
    pub cancel: CancellationToken,
    pub observer: Option<OutputObserver>,
}

#[derive(Debug, Clone)]
struct DispatchPolicy {
    max_queue_wait: Duration,
    max_source_bytes: usize,
}

pub struct DispatchEngine {
    registry: Arc<ToolchainRegistry>,
    sandbox: ExecutionSandbox,
    slots: Arc<SlotPool>,
    policy: DispatchPolicy,
    metrics: Arc<MetricsRegistry>,
}

impl DispatchEngine {
    pub fn new(
        registry: Arc<ToolchainRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        config: &ServiceConfig,
    ) -> Result<Self> {
        let sandbox = ExecutionSandbox::new(
            runtime,
            config.workspace_root.clone(),
            SandboxSettings {
                kill_grace: config.kill_grace(),
                poll_interval: config.poll_interval(),
                cpu_sample_interval: config.cpu_sample_interval(),
                output_collection_timeout: config.output_collection_timeout(),
            },
        )?;

        match sandbox.sweep_stale_workspaces(config.stale_workspace_max_age()) {
            Ok(0) => {}
            Ok(n) => log::info!("Removed {} stale workspaces", n),
            Err(e) => log::warn!("Stale workspace sweep failed: {}", e),
        }

        log::info!(
            "Dispatch engine ready: {} slots, {} toolchains, workspaces under {}",
            config.max_concurrent,
            registry.list().len(),
            config.workspace_root.display()
        );

        Ok(Self {
            registry,
            sandbox,
            slots: SlotPool::new(config.max_concurrent),
            policy: DispatchPolicy {
                max_queue_wait: config.max_queue_wait(),
                max_source_bytes: config.max_source_bytes,
            },
            metrics: get_metrics(),
        })
    }

    /// Record into `metrics` instead of the global registry
    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn registry(&self) -> &ToolchainRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available()
    }

    pub fn dispatch(&self, submission: &Submission) -> std::result::Result<ExecutionOutcome, ClientError> {
        self.dispatch_with(submission, DispatchOptions::default())
    }

    pub fn dispatch_with(
        &self,
        submission: &Submission,
        options: DispatchOptions,
    ) -> std::result::Result<ExecutionOutcome, ClientError> {
        let audit = AuditContext::new(submission);
        let received = Instant::now();

        let descriptor = match self.admit(submission, &options.overrides) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                log::debug!("Rejected request {}: {}", audit.request_id(), e);
                self.metrics.record_client_error();
                audit.rejected(&e).emit();
                return Err(e);
            }
        };
        let limits = descriptor.profile.tightened(&options.overrides);

        let admission = {
            let _queued = self.metrics.queued_requests.track();
            self.slots.acquire(self.policy.max_queue_wait, &options.cancel)
        };
        let queue_wait = received.elapsed();
        self.metrics.queue_wait.observe(queue_wait);

        let outcome = match admission {
            Admission::Granted(slot) => {
                audit.admitted(queue_wait.as_millis() as u64).emit();
                let active = self.metrics.active_sandboxes.track();

                let started = Instant::now();
                let outcome = self.sandbox.execute_observed(
                    descriptor,
                    submission,
                    &limits,
                    &options.cancel,
                    options.observer.clone(),
                );
                self.metrics.execution_duration.observe(started.elapsed());

                drop(active);
                drop(slot);
                outcome
            }
            Admission::TimedOut => {
                log::warn!(
                    "Request {} waited {:?} without a free slot (all {} in use)",
                    audit.request_id(),
                    self.policy.max_queue_wait,
                    self.slots.capacity()
                );
                ExecutionOutcome::ResourceLimitExceeded {
                    kind: LimitKind::Capacity,
                }
            }
            Admission::Cancelled => ExecutionOutcome::Cancelled,
        };

        if let ExecutionOutcome::SandboxFault { message } = &outcome {
            log::error!(
                "Sandbox fault for request {} ({} {}): {}",
                audit.request_id(),
                submission.toolchain(),
                submission.action(),
                message
            );
        }

        self.metrics.record_outcome(&outcome);
        audit
            .completed(&outcome, received.elapsed().as_millis() as u64)
            .emit();
        Ok(outcome)
    }

    /// Everything that can be rejected without spending a slot
    fn admit(
        &self,
        submission: &Submission,
        overrides: &LimitOverrides,
    ) -> std::result::Result<&ExecutionEnvironmentDescriptor, ClientError> {
        let descriptor = self.registry.resolve(submission.toolchain())?;
        descriptor.command_for(submission.action())?;
        validate_submission(submission, self.policy.max_source_bytes)?;
        validate_overrides(overrides)?;
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{Action, PlayboxError};
    use crate::core::runtime::{ContainerReport, LaunchSpec};
    use std::process::Child;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails every launch; counts how often it was asked
    #[derive(Default)]
    struct UnreachableRuntime {
        spawns: AtomicUsize,
    }

    impl ContainerRuntime for UnreachableRuntime {
        fn name(&self) -> &str {
            "unreachable"
        }

        fn spawn(&self, _spec: &LaunchSpec) -> Result<Child> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            Err(PlayboxError::Runtime("daemon unreachable".to_string()))
        }

        fn kill(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        fn inspect(&self, _name: &str) -> Result<ContainerReport> {
            Ok(ContainerReport::default())
        }

        fn cpu_usage(&self, _name: &str) -> Result<Option<Duration>> {
            Ok(None)
        }

        fn remove(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        fn image_available(&self, _image: &str) -> Result<bool> {
            Ok(false)
        }

        fn version(&self) -> Result<String> {
            Err(PlayboxError::Runtime("daemon unreachable".to_string()))
        }
    }

    /// Panics inside the sandbox, after a slot was granted
    struct PanickingRuntime;

    impl ContainerRuntime for PanickingRuntime {
        fn name(&self) -> &str {
            "panicking"
        }

        fn spawn(&self, _spec: &LaunchSpec) -> Result<Child> {
            panic!("runtime bug");
        }

        fn kill(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        fn inspect(&self, _name: &str) -> Result<ContainerReport> {
            Ok(ContainerReport::default())
        }

        fn cpu_usage(&self, _name: &str) -> Result<Option<Duration>> {
            Ok(None)
        }

        fn remove(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        fn image_available(&self, _image: &str) -> Result<bool> {
            Ok(true)
        }

        fn version(&self) -> Result<String> {
            Ok("0".to_string())
        }
    }

    fn engine(runtime: Arc<UnreachableRuntime>, dir: &std::path::Path) -> DispatchEngine {
        let config = ServiceConfig {
            workspace_root: dir.to_path_buf(),
            max_concurrent: 2,
            ..ServiceConfig::default()
        };
        DispatchEngine::new(Arc::new(ToolchainRegistry::new()), runtime, &config)
            .unwrap()
            .with_metrics(Arc::new(MetricsRegistry::new()))
    }

    #[test]
    fn test_client_errors_never_reach_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(UnreachableRuntime::default());
        let engine = engine(Arc::clone(&runtime), dir.path());

        let cases = [
            Submission::new("does-not-exist", Action::Run, "fn main() {}"),
            Submission::new("formatter", Action::Run, "fn main() {}"),
            Submission::new("stable", Action::Run, ""),
        ];
        for submission in &cases {
            assert!(engine.dispatch(submission).is_err());
        }

        let zero = DispatchOptions {
            overrides: LimitOverrides {
                max_duration: Some(Duration::ZERO),
                max_memory_bytes: None,
            },
            ..DispatchOptions::default()
        };
        let result = engine.dispatch_with(&Submission::new("stable", Action::Run, "fn main() {}"), zero);
        assert!(matches!(result, Err(ClientError::InvalidOverride(_))));

        assert_eq!(runtime.spawns.load(Ordering::SeqCst), 0);
        assert_eq!(engine.available_slots(), engine.capacity());
        assert_eq!(engine.metrics().client_errors.get(), 4);
        assert_eq!(engine.metrics().dispatches_total.get(), 0);
    }

    #[test]
    fn test_runtime_failure_is_sandbox_fault() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(UnreachableRuntime::default());
        let engine = engine(Arc::clone(&runtime), dir.path());

        let outcome = engine
            .dispatch(&Submission::new("stable", Action::Run, "fn main() {}"))
            .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::SandboxFault { .. }));
        assert_eq!(runtime.spawns.load(Ordering::SeqCst), 1);
        assert_eq!(engine.available_slots(), 2);
        assert_eq!(engine.metrics().outcome_sandbox_fault.get(), 1);
        assert_eq!(engine.metrics().active_sandboxes.get(), 0);
        // Workspace removed on the failed launch
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_cancelled_before_admission() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(UnreachableRuntime::default());
        let engine = engine(Arc::clone(&runtime), dir.path());

        let options = DispatchOptions::default();
        options.cancel.cancel();
        let outcome = engine
            .dispatch_with(&Submission::new("stable", Action::Run, "fn main() {}"), options)
            .unwrap();
        assert_eq!(outcome, ExecutionOutcome::Cancelled);
        assert_eq!(runtime.spawns.load(Ordering::SeqCst), 0);
        assert_eq!(engine.available_slots(), 2);
    }

    #[test]
    fn test_panic_in_sandbox_releases_gauges_and_slot() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig {
            workspace_root: dir.path().to_path_buf(),
            max_concurrent: 1,
            ..ServiceConfig::default()
        };
        let engine = DispatchEngine::new(
            Arc::new(ToolchainRegistry::new()),
            Arc::new(PanickingRuntime),
            &config,
        )
        .unwrap()
        .with_metrics(Arc::new(MetricsRegistry::new()));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            engine.dispatch(&Submission::new("stable", Action::Run, "fn main() {}"))
        }));

        assert!(result.is_err());
        assert_eq!(engine.metrics().active_sandboxes.get(), 0);
        assert_eq!(engine.metrics().queued_requests.get(), 0);
        assert_eq!(engine.available_slots(), 1);
    }

    #[test]
    fn test_startup_sweeps_stale_workspaces() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("0b7c1e52-leftover")).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let config = ServiceConfig {
            workspace_root: dir.path().to_path_buf(),
            stale_workspace_max_age_secs: 0,
            ..ServiceConfig::default()
        };
        let _engine = DispatchEngine::new(
            Arc::new(ToolchainRegistry::new()),
            Arc::new(UnreachableRuntime::default()),
            &config,
        )
        .unwrap();

        assert!(!dir.path().join("0b7c1e52-leftover").exists());
    }
}
