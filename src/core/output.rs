/// Bounded output collection
///
/// One reader thread per stream. Both readers charge a shared byte counter so
/// the combined stdout+stderr limit is enforced while the process is still
/// running; the supervisor polls [`OutputCollector::overflowed`] and
/// terminates the environment as soon as it flips.
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::io::Read;
use std::process::{ChildStderr, ChildStdout};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Receives output chunks as they are read, before any limit bookkeeping
/// discards them.
pub type OutputObserver = Arc<dyn Fn(StreamKind, &[u8]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputIntegrity {
    Complete,
    TruncatedByLimit,
    ReadError,
    /// A reader did not reach EOF within the collection timeout
    CollectionTimedOut,
}

#[derive(Debug, Clone)]
pub struct OutputLimits {
    /// Combined stdout+stderr limit (bytes)
    pub combined_limit: usize,
    /// How long to wait for readers once the process is gone
    pub collection_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CollectedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub integrity: OutputIntegrity,
}

impl CollectedOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

type StreamResult = (Vec<u8>, OutputIntegrity);

pub struct OutputCollector {
    limits: OutputLimits,
    overflowed: Arc<AtomicBool>,
    stdout_rx: Option<Receiver<StreamResult>>,
    stderr_rx: Option<Receiver<StreamResult>>,
}

impl OutputCollector {
    /// Start reader threads for whichever streams are present
    pub fn start(
        limits: OutputLimits,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
        observer: Option<OutputObserver>,
    ) -> Self {
        let total = Arc::new(AtomicUsize::new(0));
        let overflowed = Arc::new(AtomicBool::new(false));

        let stdout_rx = stdout.map(|stream| {
            spawn_reader(
                stream,
                StreamKind::Stdout,
                StreamBudget::new(&limits, &total, &overflowed),
                observer.clone(),
            )
        });
        let stderr_rx = stderr.map(|stream| {
            spawn_reader(
                stream,
                StreamKind::Stderr,
                StreamBudget::new(&limits, &total, &overflowed),
                observer.clone(),
            )
        });

        Self {
            limits,
            overflowed,
            stdout_rx,
            stderr_rx,
        }
    }

    /// True once the combined limit has been crossed
    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::SeqCst)
    }

    /// Wait for both readers. Readers still blocked after the collection
    /// timeout are abandoned; their threads exit when the pipe finally closes.
    pub fn finish(self) -> CollectedOutput {
        let deadline = Instant::now() + self.limits.collection_timeout;

        let (stdout, stdout_integrity) = receive(self.stdout_rx, deadline);
        let (stderr, stderr_integrity) = receive(self.stderr_rx, deadline);

        let integrity = if self.overflowed.load(Ordering::SeqCst) {
            OutputIntegrity::TruncatedByLimit
        } else {
            worst(stdout_integrity, stderr_integrity)
        };

        CollectedOutput {
            stdout,
            stderr,
            integrity,
        }
    }
}

fn receive(rx: Option<Receiver<StreamResult>>, deadline: Instant) -> StreamResult {
    let Some(rx) = rx else {
        return (Vec::new(), OutputIntegrity::Complete);
    };

    let remaining = deadline.saturating_duration_since(Instant::now());
    match rx.recv_timeout(remaining) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            log::warn!("Output reader did not finish within the collection timeout");
            (Vec::new(), OutputIntegrity::CollectionTimedOut)
        }
        Err(RecvTimeoutError::Disconnected) => (Vec::new(), OutputIntegrity::ReadError),
    }
}

fn worst(a: OutputIntegrity, b: OutputIntegrity) -> OutputIntegrity {
    fn rank(integrity: OutputIntegrity) -> u8 {
        match integrity {
            OutputIntegrity::Complete => 0,
            OutputIntegrity::ReadError => 1,
            OutputIntegrity::CollectionTimedOut => 2,
            OutputIntegrity::TruncatedByLimit => 3,
        }
    }
    if rank(a) >= rank(b) {
        a
    } else {
        b
    }
}

/// Share of the combined limit visible to one reader
struct StreamBudget {
    limit: usize,
    total: Arc<AtomicUsize>,
    overflowed: Arc<AtomicBool>,
}

impl StreamBudget {
    fn new(limits: &OutputLimits, total: &Arc<AtomicUsize>, overflowed: &Arc<AtomicBool>) -> Self {
        Self {
            limit: limits.combined_limit,
            total: Arc::clone(total),
            overflowed: Arc::clone(overflowed),
        }
    }

    /// Charge `n` bytes; returns how many of them fit under the limit
    fn charge(&self, n: usize) -> usize {
        let before = self.total.fetch_add(n, Ordering::SeqCst);
        if before + n > self.limit {
            self.overflowed.store(true, Ordering::SeqCst);
            self.limit.saturating_sub(before)
        } else {
            n
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    stream: R,
    kind: StreamKind,
    budget: StreamBudget,
    observer: Option<OutputObserver>,
) -> Receiver<StreamResult> {
    let (tx, rx) = bounded(1);
    thread::spawn(move || collect_stream(stream, kind, budget, observer, tx));
    rx
}

fn collect_stream<R: Read>(
    mut stream: R,
    kind: StreamKind,
    budget: StreamBudget,
    observer: Option<OutputObserver>,
    tx: Sender<StreamResult>,
) {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; CHUNK_SIZE];
    let mut integrity = OutputIntegrity::Complete;

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                if let Some(observer) = &observer {
                    observer(kind, &chunk[..n]);
                }
                let kept = budget.charge(n);
                buffer.extend_from_slice(&chunk[..kept]);
                if kept < n {
                    integrity = OutputIntegrity::TruncatedByLimit;
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("{:?} reader failed: {}", kind, e);
                integrity = OutputIntegrity::ReadError;
                break;
            }
        }
    }

    let _ = tx.send((buffer, integrity));
}
