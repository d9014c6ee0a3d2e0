use crate::config::types::{ClientError, ClientStatus, ExecutionOutcome, Submission};
use crate::dispatch::{DispatchEngine, DispatchOptions};
use crate::lifecycle::tracker::{LifecycleTracker, RequestKind, RequestPayload};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Client protocol events: `Request<Kind>`, `<Kind>Succeeded`, `<Kind>Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Request {
        kind: RequestKind,
    },
    Succeeded {
        kind: RequestKind,
        stdout: String,
        stderr: String,
    },
    Failed {
        kind: RequestKind,
        stdout: String,
        stderr: String,
    },
}

impl ClientEvent {
    pub fn from_outcome(kind: RequestKind, outcome: &ExecutionOutcome) -> Self {
        Self::completion(kind, RequestPayload::from_outcome(outcome))
    }

    fn completion(kind: RequestKind, payload: RequestPayload) -> Self {
        let RequestPayload {
            status,
            stdout,
            stderr,
        } = payload;
        match status {
            ClientStatus::Succeeded => ClientEvent::Succeeded {
                kind,
                stdout,
                stderr,
            },
            ClientStatus::Failed => ClientEvent::Failed {
                kind,
                stdout,
                stderr,
            },
        }
    }

    pub fn kind(&self) -> &RequestKind {
        match self {
            ClientEvent::Request { kind }
            | ClientEvent::Succeeded { kind, .. }
            | ClientEvent::Failed { kind, .. } => kind,
        }
    }
}

/// Request lifecycle state of one client session.
///
/// Owns one tracker per request kind, created on first use. Sessions are
/// plain values; create one per client and drop it when the client leaves.
#[derive(Debug, Default)]
pub struct Session {
    trackers: Mutex<HashMap<RequestKind, Arc<LifecycleTracker>>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracker(&self, kind: &RequestKind) -> Arc<LifecycleTracker> {
        let mut trackers = self.trackers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            trackers
                .entry(kind.clone())
                .or_insert_with(|| Arc::new(LifecycleTracker::new(kind.clone()))),
        )
    }

    /// Drive the matching tracker from a protocol event
    pub fn apply(&self, event: &ClientEvent) {
        let tracker = self.tracker(event.kind());
        match event {
            ClientEvent::Request { .. } => tracker.issue(),
            ClientEvent::Succeeded { stdout, stderr, .. } => tracker.complete_with(RequestPayload {
                status: ClientStatus::Succeeded,
                stdout: stdout.clone(),
                stderr: stderr.clone(),
            }),
            ClientEvent::Failed { stdout, stderr, .. } => tracker.complete_with(RequestPayload {
                status: ClientStatus::Failed,
                stdout: stdout.clone(),
                stderr: stderr.clone(),
            }),
        }
    }

    /// Re-initialize every tracker. Handles obtained earlier stay valid.
    pub fn reset(&self) {
        let trackers = self.trackers.lock().unwrap_or_else(PoisonError::into_inner);
        for tracker in trackers.values() {
            tracker.reset();
        }
    }

    /// Issue, dispatch, and complete one request. Exactly one completion is
    /// applied to the tracker whatever happens, including client errors,
    /// cancellation, and a panic unwinding out of the engine.
    pub fn run(
        &self,
        engine: &DispatchEngine,
        submission: &Submission,
        options: DispatchOptions,
    ) -> Result<ExecutionOutcome, ClientError> {
        let kind = RequestKind::from(submission.toolchain());
        self.apply(&ClientEvent::Request { kind: kind.clone() });

        let mut pending = PendingCompletion {
            session: self,
            kind: Some(kind),
        };

        let result = engine.dispatch_with(submission, options);
        let completion = match &result {
            Ok(outcome) => RequestPayload::from_outcome(outcome),
            Err(e) => RequestPayload {
                status: ClientStatus::Failed,
                stdout: String::new(),
                stderr: e.to_string(),
            },
        };
        pending.complete(completion);
        result
    }
}

/// Completes the request as failed if dropped before `complete` ran
struct PendingCompletion<'a> {
    session: &'a Session,
    kind: Option<RequestKind>,
}

impl PendingCompletion<'_> {
    fn complete(&mut self, payload: RequestPayload) {
        if let Some(kind) = self.kind.take() {
            self.session.apply(&ClientEvent::completion(kind, payload));
        }
    }
}

impl Drop for PendingCompletion<'_> {
    fn drop(&mut self) {
        self.complete(RequestPayload {
            status: ClientStatus::Failed,
            stdout: String::new(),
            stderr: "The request was interrupted.".to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::tracker::TrackerState;

    #[test]
    fn test_kinds_are_independent() {
        let session = Session::new();
        session.apply(&ClientEvent::Request {
            kind: "stable".into(),
        });

        assert_eq!(session.tracker(&"stable".into()).state(), TrackerState::InFlight);
        assert_eq!(session.tracker(&"nightly".into()).state(), TrackerState::Idle);
    }

    #[test]
    fn test_apply_completion_events() {
        let session = Session::new();
        let kind = RequestKind::from("linter");
        session.apply(&ClientEvent::Request { kind: kind.clone() });
        session.apply(&ClientEvent::Failed {
            kind: kind.clone(),
            stdout: String::new(),
            stderr: "warning: unused variable".to_string(),
        });

        let snapshot = session.tracker(&kind).snapshot();
        assert_eq!(snapshot.state(), TrackerState::IdleWithResult);
        let payload = snapshot.last_result.unwrap();
        assert_eq!(payload.status, ClientStatus::Failed);
        assert_eq!(payload.stderr, "warning: unused variable");
    }

    #[test]
    fn test_reset_keeps_handles_valid() {
        let session = Session::new();
        let kind = RequestKind::from("stable");
        let tracker = session.tracker(&kind);
        session.apply(&ClientEvent::Request { kind: kind.clone() });
        session.apply(&ClientEvent::Request { kind: kind.clone() });

        session.reset();
        assert_eq!(tracker.in_progress(), 0);
        assert_eq!(tracker.state(), TrackerState::Idle);
        assert!(Arc::ptr_eq(&tracker, &session.tracker(&kind)));
    }

    #[test]
    fn test_event_from_outcome() {
        let event = ClientEvent::from_outcome(
            "stable".into(),
            &ExecutionOutcome::Success {
                stdout: "hi".to_string(),
                stderr: String::new(),
                exit_code: 0,
            },
        );
        assert!(matches!(event, ClientEvent::Succeeded { ref stdout, .. } if stdout == "hi"));

        let event = ClientEvent::from_outcome("stable".into(), &ExecutionOutcome::TimedOut);
        assert!(matches!(event, ClientEvent::Failed { .. }));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "failed");
        assert_eq!(json["kind"], "stable");
    }

    #[test]
    fn test_pending_completion_on_drop() {
        let session = Session::new();
        let kind = RequestKind::from("beta");
        session.apply(&ClientEvent::Request { kind: kind.clone() });
        drop(PendingCompletion {
            session: &session,
            kind: Some(kind.clone()),
        });

        let snapshot = session.tracker(&kind).snapshot();
        assert_eq!(snapshot.in_progress, 0);
        assert_eq!(snapshot.last_result.unwrap().status, ClientStatus::Failed);
    }
}
