/// Outcome classification
///
/// Pure function over the evidence one supervised run leaves behind. The
/// sandbox gathers evidence; it never decides the outcome itself.
use crate::config::types::{ExecutionOutcome, LimitKind};

/// Signal raised by the kernel when `RLIMIT_CPU`'s soft limit is crossed
pub const SIGXCPU: i32 = libc::SIGXCPU;

/// Why the supervisor terminated the environment, if it did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    WallClockExpired,
    CpuLimitExceeded,
    OutputLimitExceeded,
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct RunEvidence {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub supervisor_action: Option<SupervisorAction>,
    pub oom_killed: bool,
    /// The runtime reports the container's main process as started
    pub container_started: bool,
    /// Error the runtime recorded against the container
    pub runtime_error: Option<String>,
    pub output_truncated: bool,
    pub stdout: String,
    pub stderr: String,
    /// Infrastructure error hit while launching or supervising
    pub fault: Option<String>,
}

pub struct OutcomeClassifier;

impl OutcomeClassifier {
    /// `reserved_exit_codes` are the runtime's own failure codes. They mean a
    /// fault only when the container never started or the runtime recorded
    /// an error; otherwise the workload exited with them itself.
    pub fn classify(evidence: RunEvidence, reserved_exit_codes: &[i32]) -> ExecutionOutcome {
        if let Some(message) = evidence.fault {
            return ExecutionOutcome::SandboxFault { message };
        }

        // Supervisor kills surface as arbitrary signals or 137s, so they win
        match evidence.supervisor_action {
            Some(SupervisorAction::Cancelled) => return ExecutionOutcome::Cancelled,
            Some(SupervisorAction::WallClockExpired) => return ExecutionOutcome::TimedOut,
            Some(SupervisorAction::CpuLimitExceeded) => return limit_exceeded(LimitKind::Cpu),
            Some(SupervisorAction::OutputLimitExceeded) => {
                return limit_exceeded(LimitKind::Output)
            }
            None => {}
        }

        if evidence.output_truncated {
            return limit_exceeded(LimitKind::Output);
        }

        if evidence.oom_killed {
            return limit_exceeded(LimitKind::Memory);
        }

        if evidence.signal == Some(SIGXCPU) {
            return limit_exceeded(LimitKind::Cpu);
        }

        let runtime_failed = !evidence.container_started || evidence.runtime_error.is_some();

        match (evidence.exit_code, evidence.signal) {
            (Some(code), _) if runtime_failed && reserved_exit_codes.contains(&code) => {
                ExecutionOutcome::SandboxFault {
                    message: format!(
                        "container runtime exited with reserved status {code}: {}",
                        evidence
                            .runtime_error
                            .as_deref()
                            .unwrap_or_else(|| evidence.stderr.trim())
                    ),
                }
            }
            (Some(0), _) => ExecutionOutcome::Success {
                stdout: evidence.stdout,
                stderr: evidence.stderr,
                exit_code: 0,
            },
            (Some(code), _) => ExecutionOutcome::ToolFailure {
                stdout: evidence.stdout,
                stderr: evidence.stderr,
                exit_code: code,
            },
            (None, Some(signal)) => ExecutionOutcome::SandboxFault {
                message: format!("runtime client terminated by signal {signal}"),
            },
            (None, None) => ExecutionOutcome::SandboxFault {
                message: "process ended without an exit status".to_string(),
            },
        }
    }
}

fn limit_exceeded(kind: LimitKind) -> ExecutionOutcome {
    ExecutionOutcome::ResourceLimitExceeded { kind }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESERVED: [i32; 3] = [125, 126, 127];

    fn exited(code: i32) -> RunEvidence {
        RunEvidence {
            exit_code: Some(code),
            container_started: true,
            stdout: "out".to_string(),
            stderr: "err".to_string(),
            ..RunEvidence::default()
        }
    }

    #[test]
    fn test_zero_exit_is_success() {
        let outcome = OutcomeClassifier::classify(exited(0), &RESERVED);
        assert_eq!(
            outcome,
            ExecutionOutcome::Success {
                stdout: "out".to_string(),
                stderr: "err".to_string(),
                exit_code: 0
            }
        );
    }

    #[test]
    fn test_nonzero_exit_is_tool_failure() {
        let outcome = OutcomeClassifier::classify(exited(101), &RESERVED);
        assert!(matches!(
            outcome,
            ExecutionOutcome::ToolFailure { exit_code: 101, .. }
        ));
    }

    #[test]
    fn test_reserved_codes_are_faults_when_runtime_failed() {
        for code in RESERVED {
            let mut evidence = exited(code);
            evidence.container_started = false;
            let outcome = OutcomeClassifier::classify(evidence, &RESERVED);
            assert!(matches!(outcome, ExecutionOutcome::SandboxFault { .. }), "{code}");
        }

        let mut evidence = exited(125);
        evidence.runtime_error = Some("OCI runtime create failed".to_string());
        match OutcomeClassifier::classify(evidence, &RESERVED) {
            ExecutionOutcome::SandboxFault { message } => {
                assert!(message.contains("OCI runtime create failed"))
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[test]
    fn test_reserved_codes_from_started_workload_are_tool_failures() {
        let mut evidence = exited(127);
        evidence.stderr = "sh: foo: not found".to_string();
        assert_eq!(
            OutcomeClassifier::classify(evidence, &RESERVED),
            ExecutionOutcome::ToolFailure {
                stdout: "out".to_string(),
                stderr: "sh: foo: not found".to_string(),
                exit_code: 127,
            }
        );
        // Without reservations a non-started run is still the tool's status
        let mut evidence = exited(127);
        evidence.container_started = false;
        assert!(matches!(
            OutcomeClassifier::classify(evidence, &[]),
            ExecutionOutcome::ToolFailure { .. }
        ));
    }

    #[test]
    fn test_supervisor_action_wins_over_exit_status() {
        let mut evidence = exited(137);
        evidence.supervisor_action = Some(SupervisorAction::WallClockExpired);
        evidence.oom_killed = true;
        assert_eq!(
            OutcomeClassifier::classify(evidence, &RESERVED),
            ExecutionOutcome::TimedOut
        );

        let mut evidence = exited(0);
        evidence.supervisor_action = Some(SupervisorAction::Cancelled);
        assert_eq!(
            OutcomeClassifier::classify(evidence, &RESERVED),
            ExecutionOutcome::Cancelled
        );
    }

    #[test]
    fn test_limit_kinds() {
        let mut evidence = exited(137);
        evidence.oom_killed = true;
        assert_eq!(
            OutcomeClassifier::classify(evidence, &RESERVED),
            limit_exceeded(LimitKind::Memory)
        );

        let mut evidence = exited(101);
        evidence.supervisor_action = Some(SupervisorAction::CpuLimitExceeded);
        assert_eq!(
            OutcomeClassifier::classify(evidence, &RESERVED),
            limit_exceeded(LimitKind::Cpu)
        );

        // A program may exit with 152 on its own
        assert!(matches!(
            OutcomeClassifier::classify(exited(128 + SIGXCPU), &RESERVED),
            ExecutionOutcome::ToolFailure { exit_code: 152, .. }
        ));

        let evidence = RunEvidence {
            signal: Some(SIGXCPU),
            ..RunEvidence::default()
        };
        assert_eq!(
            OutcomeClassifier::classify(evidence, &RESERVED),
            limit_exceeded(LimitKind::Cpu)
        );

        let mut evidence = exited(0);
        evidence.output_truncated = true;
        assert_eq!(
            OutcomeClassifier::classify(evidence, &RESERVED),
            limit_exceeded(LimitKind::Output)
        );
    }

    #[test]
    fn test_fault_wins() {
        let mut evidence = exited(0);
        evidence.fault = Some("image not found".to_string());
        assert_eq!(
            OutcomeClassifier::classify(evidence, &RESERVED),
            ExecutionOutcome::SandboxFault {
                message: "image not found".to_string()
            }
        );
    }

    #[test]
    fn test_bare_signal_is_fault() {
        let evidence = RunEvidence {
            signal: Some(libc::SIGSEGV),
            ..RunEvidence::default()
        };
        assert!(matches!(
            OutcomeClassifier::classify(evidence, &RESERVED),
            ExecutionOutcome::SandboxFault { .. }
        ));
    }
}
