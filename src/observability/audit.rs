/// Structured audit events
///
/// One event per dispatch decision, serialized as a JSON line and emitted
/// through `log` under the `playbox::audit` target so operators can route it
/// separately from diagnostics.
use crate::config::types::{ClientError, ExecutionOutcome, Submission};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const AUDIT_TARGET: &str = "playbox::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    Rejected,
    Admitted,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub toolchain: String,
    pub action: String,
    /// SHA-256 of the submission; the source itself is never logged
    pub fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub details: String,
}

/// Correlates every event of one request
#[derive(Debug, Clone)]
pub struct AuditContext {
    request_id: String,
    toolchain: String,
    action: String,
    fingerprint: String,
}

impl AuditContext {
    pub fn new(submission: &Submission) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            toolchain: submission.toolchain().to_string(),
            action: submission.action().to_string(),
            fingerprint: submission.fingerprint(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    fn event(&self, event_type: AuditEventType, details: String) -> AuditEvent {
        AuditEvent {
            event_type,
            timestamp: Utc::now(),
            request_id: self.request_id.clone(),
            toolchain: self.toolchain.clone(),
            action: self.action.clone(),
            fingerprint: self.fingerprint.clone(),
            outcome: None,
            duration_ms: None,
            details,
        }
    }

    pub fn rejected(&self, error: &ClientError) -> AuditEvent {
        self.event(AuditEventType::Rejected, error.to_string())
    }

    pub fn admitted(&self, queue_wait_ms: u64) -> AuditEvent {
        let mut event = self.event(
            AuditEventType::Admitted,
            format!("slot acquired after {queue_wait_ms}ms"),
        );
        event.duration_ms = Some(queue_wait_ms);
        event
    }

    pub fn completed(&self, outcome: &ExecutionOutcome, duration_ms: u64) -> AuditEvent {
        let details = match outcome {
            ExecutionOutcome::Success { exit_code, .. }
            | ExecutionOutcome::ToolFailure { exit_code, .. } => format!("exit code {exit_code}"),
            ExecutionOutcome::ResourceLimitExceeded { kind } => format!("{kind} limit"),
            ExecutionOutcome::SandboxFault { message } => message.clone(),
            ExecutionOutcome::TimedOut | ExecutionOutcome::Cancelled => String::new(),
        };
        let mut event = self.event(AuditEventType::Completed, details);
        event.outcome = Some(outcome.code().to_string());
        event.duration_ms = Some(duration_ms);
        event
    }
}

impl AuditEvent {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!("{{\"event_type\":\"serialization_error\",\"details\":\"{e}\"}}")
        })
    }

    pub fn emit(&self) {
        log::info!(target: AUDIT_TARGET, "{}", self.to_json());
    }
}
