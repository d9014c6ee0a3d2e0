/// Core types and structures for the playbox system
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Action requested for a submission
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Run,
    Compile,
    Format,
    Lint,
    Verify,
}

impl Action {
    pub const ALL: [Action; 5] = [
        Action::Run,
        Action::Compile,
        Action::Format,
        Action::Lint,
        Action::Verify,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Run => "run",
            Action::Compile => "compile",
            Action::Format => "format",
            Action::Lint => "lint",
            Action::Verify => "verify",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ClientError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Action::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| ClientError::UnknownAction(s.to_string()))
    }
}

/// Language edition the submission is written against
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum Edition {
    #[serde(rename = "2015")]
    E2015,
    #[serde(rename = "2018")]
    E2018,
    #[default]
    #[serde(rename = "2021")]
    E2021,
}

impl Edition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Edition::E2015 => "2015",
            Edition::E2018 => "2018",
            Edition::E2021 => "2021",
        }
    }
}

impl FromStr for Edition {
    type Err = ClientError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "2015" => Ok(Edition::E2015),
            "2018" => Ok(Edition::E2018),
            "2021" => Ok(Edition::E2021),
            other => Err(ClientError::MalformedSubmission(format!(
                "unknown edition: {other}"
            ))),
        }
    }
}

/// Build profile
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Debug,
    Release,
}

impl FromStr for Mode {
    type Err = ClientError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Mode::Debug),
            "release" => Ok(Mode::Release),
            other => Err(ClientError::MalformedSubmission(format!(
                "unknown mode: {other}"
            ))),
        }
    }
}

/// Crate type of the submitted source
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CrateType {
    #[default]
    Bin,
    Lib,
}

impl CrateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrateType::Bin => "bin",
            CrateType::Lib => "lib",
        }
    }

    /// Path of the source file relative to the crate root
    pub fn source_path(&self) -> &'static str {
        match self {
            CrateType::Bin => "src/main.rs",
            CrateType::Lib => "src/lib.rs",
        }
    }
}

impl FromStr for CrateType {
    type Err = ClientError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "bin" => Ok(CrateType::Bin),
            "lib" => Ok(CrateType::Lib),
            other => Err(ClientError::MalformedSubmission(format!(
                "unknown crate type: {other}"
            ))),
        }
    }
}

/// Artifact produced by the compile action
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CompileTarget {
    #[default]
    Build,
    Asm,
    LlvmIr,
    Mir,
}

impl CompileTarget {
    /// Value for rustc's `--emit` flag, `None` for a plain build
    pub fn emit_kind(&self) -> Option<&'static str> {
        match self {
            CompileTarget::Build => None,
            CompileTarget::Asm => Some("asm"),
            CompileTarget::LlvmIr => Some("llvm-ir"),
            CompileTarget::Mir => Some("mir"),
        }
    }
}

impl FromStr for CompileTarget {
    type Err = ClientError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "build" => Ok(CompileTarget::Build),
            "asm" => Ok(CompileTarget::Asm),
            "llvm-ir" => Ok(CompileTarget::LlvmIr),
            "mir" => Ok(CompileTarget::Mir),
            other => Err(ClientError::MalformedSubmission(format!(
                "unknown compile target: {other}"
            ))),
        }
    }
}

/// Optional knobs carried by a submission
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SubmissionFlags {
    pub edition: Edition,
    pub mode: Mode,
    pub crate_type: CrateType,
    /// Run the test harness instead of `main`
    pub tests: bool,
    /// Export `RUST_BACKTRACE=1` inside the environment
    pub backtrace: bool,
    pub target: CompileTarget,
}

/// Immutable unit of work sent by a caller.
///
/// The toolchain is kept as the caller's raw identifier; it is resolved
/// against the registry at dispatch time so unknown identifiers surface as a
/// client error rather than a construction failure.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Submission {
    toolchain: String,
    action: Action,
    source: String,
    #[serde(default)]
    flags: SubmissionFlags,
}

impl Submission {
    pub fn new(toolchain: impl Into<String>, action: Action, source: impl Into<String>) -> Self {
        Self {
            toolchain: toolchain.into(),
            action,
            source: source.into(),
            flags: SubmissionFlags::default(),
        }
    }

    pub fn with_flags(mut self, flags: SubmissionFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn toolchain(&self) -> &str {
        &self.toolchain
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn flags(&self) -> &SubmissionFlags {
        &self.flags
    }

    /// SHA-256 over the canonical JSON form, used to correlate audit events
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Resource ceilings of one execution environment
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceProfile {
    pub max_cpu_seconds: u64,
    pub max_memory_bytes: u64,
    pub max_wall_clock: Duration,
    /// Combined stdout + stderr bytes
    pub max_output_bytes: usize,
    pub max_processes: u32,
}

impl ResourceProfile {
    /// Apply caller overrides. Overrides can only tighten a limit; a looser
    /// value is clamped back to the profile's ceiling.
    pub fn tightened(&self, overrides: &LimitOverrides) -> ResourceProfile {
        let mut limits = self.clone();

        if let Some(duration) = overrides.max_duration {
            if duration > self.max_wall_clock {
                log::debug!(
                    "Ignoring looser wall-clock override {:?} (ceiling {:?})",
                    duration,
                    self.max_wall_clock
                );
            }
            limits.max_wall_clock = duration.min(self.max_wall_clock);
        }

        if let Some(memory) = overrides.max_memory_bytes {
            if memory > self.max_memory_bytes {
                log::debug!(
                    "Ignoring looser memory override {} (ceiling {})",
                    memory,
                    self.max_memory_bytes
                );
            }
            limits.max_memory_bytes = memory.min(self.max_memory_bytes);
        }

        limits
    }
}

/// Caller-requested limit tightening
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LimitOverrides {
    pub max_duration: Option<Duration>,
    pub max_memory_bytes: Option<u64>,
}

/// Which resource ceiling was crossed
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LimitKind {
    Cpu,
    Memory,
    Output,
    /// Concurrency pool stayed saturated past the queue-wait limit
    Capacity,
}

impl LimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::Cpu => "cpu",
            LimitKind::Memory => "memory",
            LimitKind::Output => "output",
            LimitKind::Capacity => "capacity",
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one execution attempt
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success {
        stdout: String,
        stderr: String,
        exit_code: i32,
    },
    /// The toolchain ran and reported failure (the user's code)
    ToolFailure {
        stdout: String,
        stderr: String,
        exit_code: i32,
    },
    TimedOut,
    ResourceLimitExceeded {
        kind: LimitKind,
    },
    /// Infrastructure failure; the message is operator-facing only
    SandboxFault {
        message: String,
    },
    Cancelled,
}

/// Client-visible resolution of a request
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Succeeded,
    Failed,
}

/// Output shown to the client for an outcome
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenderedOutput {
    pub stdout: String,
    pub stderr: String,
}

pub const SANDBOX_FAULT_MESSAGE: &str = "Sorry, something went wrong on our side while running your code. \
This is not a problem with your program; please try again in a moment.";

impl ExecutionOutcome {
    /// Stable short code used in JSON output, metrics and audit events
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionOutcome::Success { .. } => "success",
            ExecutionOutcome::ToolFailure { .. } => "tool_failure",
            ExecutionOutcome::TimedOut => "timed_out",
            ExecutionOutcome::ResourceLimitExceeded { .. } => "resource_limit_exceeded",
            ExecutionOutcome::SandboxFault { .. } => "sandbox_fault",
            ExecutionOutcome::Cancelled => "cancelled",
        }
    }

    /// Only `Success` resolves as succeeded; every other variant is a failure
    pub fn status(&self) -> ClientStatus {
        match self {
            ExecutionOutcome::Success { .. } => ClientStatus::Succeeded,
            _ => ClientStatus::Failed,
        }
    }

    /// Client rendering. Tool output is passed through verbatim; other
    /// variants carry a synthetic message and never leak fault diagnostics.
    pub fn render(&self) -> RenderedOutput {
        match self {
            ExecutionOutcome::Success { stdout, stderr, .. }
            | ExecutionOutcome::ToolFailure { stdout, stderr, .. } => RenderedOutput {
                stdout: stdout.clone(),
                stderr: stderr.clone(),
            },
            ExecutionOutcome::TimedOut => synthetic("Execution exceeded the time limit and was stopped."),
            ExecutionOutcome::ResourceLimitExceeded { kind } => synthetic(match kind {
                LimitKind::Cpu => "Execution exceeded the CPU time limit and was stopped.",
                LimitKind::Memory => "Execution exceeded the memory limit and was stopped.",
                LimitKind::Output => "Execution produced more output than allowed and was stopped.",
                LimitKind::Capacity => "The service is busy right now; please try again shortly.",
            }),
            ExecutionOutcome::SandboxFault { .. } => synthetic(SANDBOX_FAULT_MESSAGE),
            ExecutionOutcome::Cancelled => synthetic("Execution was cancelled."),
        }
    }
}

fn synthetic(message: &str) -> RenderedOutput {
    RenderedOutput {
        stdout: String::new(),
        stderr: message.to_string(),
    }
}

/// Errors caused by the caller's request. Never retried, never reach a sandbox.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("unknown toolchain: {0}")]
    UnknownToolchain(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("toolchain '{toolchain}' does not support the '{action}' action")]
    UnsupportedAction { toolchain: String, action: Action },

    #[error("malformed submission: {0}")]
    MalformedSubmission(String),

    #[error("invalid limit override: {0}")]
    InvalidOverride(String),
}

/// Custom error types for playbox infrastructure
#[derive(Error, Debug)]
pub enum PlayboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Result type alias for playbox operations
pub type Result<T> = std::result::Result<T, PlayboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> ResourceProfile {
        ResourceProfile {
            max_cpu_seconds: 10,
            max_memory_bytes: 512 * 1024 * 1024,
            max_wall_clock: Duration::from_secs(15),
            max_output_bytes: 1024,
            max_processes: 64,
        }
    }

    #[test]
    fn test_overrides_only_tighten() {
        let limits = profile().tightened(&LimitOverrides {
            max_duration: Some(Duration::from_secs(5)),
            max_memory_bytes: Some(64 * 1024 * 1024),
        });
        assert_eq!(limits.max_wall_clock, Duration::from_secs(5));
        assert_eq!(limits.max_memory_bytes, 64 * 1024 * 1024);

        let limits = profile().tightened(&LimitOverrides {
            max_duration: Some(Duration::from_secs(600)),
            max_memory_bytes: Some(u64::MAX),
        });
        assert_eq!(limits, profile());
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!("verify".parse::<Action>().unwrap(), Action::Verify);
        assert_eq!(
            "explode".parse::<Action>(),
            Err(ClientError::UnknownAction("explode".to_string()))
        );
    }

    #[test]
    fn test_status_mapping() {
        let ok = ExecutionOutcome::Success {
            stdout: "hi\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
        };
        assert_eq!(ok.status(), ClientStatus::Succeeded);
        assert_eq!(ok.render().stdout, "hi\n");

        let failed = ExecutionOutcome::ToolFailure {
            stdout: String::new(),
            stderr: "error[E0308]: mismatched types".to_string(),
            exit_code: 101,
        };
        assert_eq!(failed.status(), ClientStatus::Failed);
        assert!(failed.render().stderr.contains("E0308"));

        assert_eq!(ExecutionOutcome::TimedOut.status(), ClientStatus::Failed);
        assert_eq!(ExecutionOutcome::Cancelled.status(), ClientStatus::Failed);
    }

    #[test]
    fn test_fault_rendering_hides_diagnostics() {
        let fault = ExecutionOutcome::SandboxFault {
            message: "docker: Error response from daemon: No such image".to_string(),
        };
        let rendered = fault.render();
        assert_eq!(rendered.stderr, SANDBOX_FAULT_MESSAGE);
        assert!(!rendered.stderr.contains("daemon"));
        assert!(rendered.stdout.is_empty());
    }

    #[test]
    fn test_outcome_serialization_is_tagged() {
        let json = serde_json::to_value(ExecutionOutcome::ResourceLimitExceeded {
            kind: LimitKind::Memory,
        })
        .unwrap();
        assert_eq!(json["outcome"], "resource_limit_exceeded");
        assert_eq!(json["kind"], "memory");
    }

    #[test]
    fn test_fingerprint_is_stable_and_sensitive() {
        let a = Submission::new("stable", Action::Run, "fn main() {}");
        let b = Submission::new("stable", Action::Run, "fn main() {}");
        let c = Submission::new("stable", Action::Run, "fn main() { }");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_flags_default_from_json() {
        let submission: Submission = serde_json::from_str(
            r#"{"toolchain":"nightly","action":"compile","source":"fn main(){}","flags":{"target":"llvm-ir"}}"#,
        )
        .unwrap();
        assert_eq!(submission.flags().target, CompileTarget::LlvmIr);
        assert_eq!(submission.flags().edition, Edition::E2021);
        assert_eq!(submission.flags().crate_type, CrateType::Bin);
    }
}
