use crate::config::types::{ClientStatus, ExecutionOutcome};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Request kind a tracker is keyed by (one per toolchain in practice)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKind(String);

impl RequestKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Most recent client-visible result of a kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub status: ClientStatus,
    pub stdout: String,
    pub stderr: String,
}

impl RequestPayload {
    pub fn from_outcome(outcome: &ExecutionOutcome) -> Self {
        let rendered = outcome.render();
        Self {
            status: outcome.status(),
            stdout: rendered.stdout,
            stderr: rendered.stderr,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerState {
    Idle,
    InFlight,
    IdleWithResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerSnapshot {
    pub kind: RequestKind,
    pub in_progress: usize,
    pub last_result: Option<RequestPayload>,
}

impl TrackerSnapshot {
    pub fn state(&self) -> TrackerState {
        match (self.in_progress, &self.last_result) {
            (0, None) => TrackerState::Idle,
            (0, Some(_)) => TrackerState::IdleWithResult,
            _ => TrackerState::InFlight,
        }
    }
}

#[derive(Debug, Default)]
struct TrackerInner {
    in_progress: usize,
    last_result: Option<RequestPayload>,
}

/// In-progress counter and latest result for one request kind.
///
/// Counter and payload change under one lock, so every snapshot (and every
/// notification) is a consistent pair. The counter never goes below zero.
#[derive(Debug)]
pub struct LifecycleTracker {
    kind: RequestKind,
    inner: Mutex<TrackerInner>,
    observers: Mutex<Vec<Sender<TrackerSnapshot>>>,
}

impl LifecycleTracker {
    pub fn new(kind: RequestKind) -> Self {
        Self {
            kind,
            inner: Mutex::new(TrackerInner::default()),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    /// A request of this kind was sent; the previous result stays visible
    pub fn issue(&self) {
        self.transition(|inner| inner.in_progress += 1);
    }

    /// A request finished with `outcome`
    pub fn complete(&self, outcome: &ExecutionOutcome) {
        self.complete_with(RequestPayload::from_outcome(outcome));
    }

    pub fn complete_with(&self, payload: RequestPayload) {
        self.transition(|inner| {
            if inner.in_progress == 0 {
                log::debug!("Completion for {} with nothing in flight", self.kind);
            }
            inner.in_progress = inner.in_progress.saturating_sub(1);
            inner.last_result = Some(payload);
        });
    }

    /// Back to the initial state, as on session start
    pub fn reset(&self) {
        self.transition(|inner| *inner = TrackerInner::default());
    }

    pub fn in_progress(&self) -> usize {
        self.lock().in_progress
    }

    pub fn state(&self) -> TrackerState {
        self.snapshot().state()
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let inner = self.lock();
        self.snapshot_of(&inner)
    }

    /// Receive a snapshot after every subsequent transition
    pub fn subscribe(&self) -> Receiver<TrackerSnapshot> {
        let (tx, rx) = unbounded();
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn transition(&self, apply: impl FnOnce(&mut TrackerInner)) {
        let snapshot = {
            let mut inner = self.lock();
            apply(&mut inner);
            self.snapshot_of(&inner)
        };
        self.notify(snapshot);
    }

    fn notify(&self, snapshot: TrackerSnapshot) {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        observers.retain(|tx| tx.send(snapshot.clone()).is_ok());
    }

    fn snapshot_of(&self, inner: &TrackerInner) -> TrackerSnapshot {
        TrackerSnapshot {
            kind: self.kind.clone(),
            in_progress: inner.in_progress,
            last_result: inner.last_result.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::LimitKind;
    use std::sync::Arc;
    use std::thread;

    fn success(stdout: &str) -> ExecutionOutcome {
        ExecutionOutcome::Success {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    #[test]
    fn test_state_transitions() {
        let tracker = LifecycleTracker::new("stable".into());
        assert_eq!(tracker.state(), TrackerState::Idle);

        tracker.issue();
        assert_eq!(tracker.state(), TrackerState::InFlight);

        tracker.complete(&success("42\n"));
        assert_eq!(tracker.state(), TrackerState::IdleWithResult);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.in_progress, 0);
        let payload = snapshot.last_result.unwrap();
        assert_eq!(payload.stdout, "42\n");
        assert_eq!(payload.status, ClientStatus::Succeeded);
    }

    #[test]
    fn test_issue_keeps_previous_result() {
        let tracker = LifecycleTracker::new("stable".into());
        tracker.issue();
        tracker.complete(&success("first"));
        tracker.issue();

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.state(), TrackerState::InFlight);
        assert_eq!(snapshot.last_result.unwrap().stdout, "first");
    }

    #[test]
    fn test_most_recent_result_wins() {
        let tracker = LifecycleTracker::new("stable".into());
        tracker.issue();
        tracker.issue();
        tracker.complete(&success("first"));
        tracker.complete(&ExecutionOutcome::ResourceLimitExceeded {
            kind: LimitKind::Memory,
        });

        let payload = tracker.snapshot().last_result.unwrap();
        assert_eq!(payload.status, ClientStatus::Failed);
        assert!(payload.stdout.is_empty());
        assert!(payload.stderr.contains("memory"));
    }

    #[test]
    fn test_complete_clamps_at_zero() {
        let tracker = LifecycleTracker::new("nightly".into());
        tracker.complete(&ExecutionOutcome::TimedOut);
        tracker.complete(&ExecutionOutcome::TimedOut);
        assert_eq!(tracker.in_progress(), 0);
        assert_eq!(tracker.state(), TrackerState::IdleWithResult);

        tracker.issue();
        assert_eq!(tracker.in_progress(), 1);
    }

    #[test]
    fn test_reset() {
        let tracker = LifecycleTracker::new("beta".into());
        tracker.issue();
        tracker.issue();
        tracker.reset();
        assert_eq!(tracker.snapshot().state(), TrackerState::Idle);
        assert_eq!(tracker.in_progress(), 0);
    }

    #[test]
    fn test_concurrent_issue_complete_balances() {
        let tracker = Arc::new(LifecycleTracker::new("stable".into()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    for _ in 0..100 {
                        tracker.issue();
                        tracker.complete(&ExecutionOutcome::Cancelled);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.in_progress(), 0);
    }

    #[test]
    fn test_subscribers_see_every_transition() {
        let tracker = LifecycleTracker::new("verifier".into());
        let rx = tracker.subscribe();

        tracker.issue();
        tracker.complete(&success(""));

        let states: Vec<_> = rx.try_iter().map(|s| s.state()).collect();
        assert_eq!(states, vec![TrackerState::InFlight, TrackerState::IdleWithResult]);

        drop(rx);
        tracker.issue();
        assert!(tracker.observers.lock().unwrap().is_empty());
    }
}
