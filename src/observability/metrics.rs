// Dispatch metrics
//
// Counters, gauges, and histograms for:
// - Dispatch outcomes (success, tool failure, timeout, limits, faults, cancels)
// - Client errors rejected before any sandbox work
// - Contention (active sandboxes, queued requests, queue wait)
// - Execution latency

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::types::{ExecutionOutcome, LimitKind};

/// Counter metric (monotonically increasing)
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge metric (can go up or down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Increment now, decrement when the guard drops (including on unwind)
    pub fn track(&self) -> GaugeGuard<'_> {
        self.inc();
        GaugeGuard { gauge: self }
    }
}

pub struct GaugeGuard<'a> {
    gauge: &'a Gauge,
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

/// Histogram bucket for latency tracking
#[derive(Debug)]
pub struct HistogramBucket {
    pub le: f64, // upper bound in seconds
    pub count: AtomicU64,
}

/// Histogram metric for latency/duration tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<HistogramBucket>,
    sum: AtomicU64, // microseconds
    count: AtomicU64,
}

impl Histogram {
    /// Create histogram with standard latency buckets (in seconds)
    pub fn new_latency() -> Self {
        let bounds = [
            0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
        ];

        Self {
            buckets: bounds
                .into_iter()
                .map(|le| HistogramBucket {
                    le,
                    count: AtomicU64::new(0),
                })
                .collect(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();

        self.sum
            .fetch_add(value.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for bucket in &self.buckets {
            if seconds <= bucket.le {
                bucket.count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get_sum_micros(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    pub fn get_bucket_count(&self, le: f64) -> u64 {
        self.buckets
            .iter()
            .find(|b| (b.le - le).abs() < 0.0001)
            .map(|b| b.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn export(&self, name: &str, help: &str, output: &mut String) {
        output.push_str(&format!("# HELP {name} {help}\n"));
        output.push_str(&format!("# TYPE {name} histogram\n"));
        for bucket in &self.buckets {
            output.push_str(&format!(
                "{name}_bucket{{le=\"{}\"}} {}\n",
                bucket.le,
                bucket.count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "{name}_bucket{{le=\"+Inf\"}} {}\n",
            self.get_count()
        ));
        output.push_str(&format!(
            "{name}_sum {}\n",
            self.get_sum_micros() as f64 / 1_000_000.0
        ));
        output.push_str(&format!("{name}_count {}\n", self.get_count()));
    }
}

#[derive(Debug)]
pub struct MetricsRegistry {
    pub dispatches_total: Counter,
    pub outcome_success: Counter,
    pub outcome_tool_failure: Counter,
    pub outcome_timed_out: Counter,
    pub outcome_cancelled: Counter,
    pub outcome_sandbox_fault: Counter,

    pub limit_cpu: Counter,
    pub limit_memory: Counter,
    pub limit_output: Counter,
    pub limit_capacity: Counter,

    pub client_errors: Counter,

    pub active_sandboxes: Gauge,
    pub queued_requests: Gauge,

    pub queue_wait: Histogram,
    pub execution_duration: Histogram,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            dispatches_total: Counter::new(),
            outcome_success: Counter::new(),
            outcome_tool_failure: Counter::new(),
            outcome_timed_out: Counter::new(),
            outcome_cancelled: Counter::new(),
            outcome_sandbox_fault: Counter::new(),

            limit_cpu: Counter::new(),
            limit_memory: Counter::new(),
            limit_output: Counter::new(),
            limit_capacity: Counter::new(),

            client_errors: Counter::new(),

            active_sandboxes: Gauge::new(),
            queued_requests: Gauge::new(),

            queue_wait: Histogram::new_latency(),
            execution_duration: Histogram::new_latency(),
        }
    }

    /// Record the outcome of one dispatch
    pub fn record_outcome(&self, outcome: &ExecutionOutcome) {
        self.dispatches_total.inc();

        match outcome {
            ExecutionOutcome::Success { .. } => self.outcome_success.inc(),
            ExecutionOutcome::ToolFailure { .. } => self.outcome_tool_failure.inc(),
            ExecutionOutcome::TimedOut => self.outcome_timed_out.inc(),
            ExecutionOutcome::Cancelled => self.outcome_cancelled.inc(),
            ExecutionOutcome::SandboxFault { .. } => self.outcome_sandbox_fault.inc(),
            ExecutionOutcome::ResourceLimitExceeded { kind } => match kind {
                LimitKind::Cpu => self.limit_cpu.inc(),
                LimitKind::Memory => self.limit_memory.inc(),
                LimitKind::Output => self.limit_output.inc(),
                LimitKind::Capacity => self.limit_capacity.inc(),
            },
        }
    }

    pub fn record_client_error(&self) {
        self.client_errors.inc();
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP playbox_dispatches_total Total number of dispatched requests\n");
        output.push_str("# TYPE playbox_dispatches_total counter\n");
        output.push_str(&format!(
            "playbox_dispatches_total {}\n",
            self.dispatches_total.get()
        ));

        output.push_str("# HELP playbox_outcomes_total Dispatches by outcome\n");
        output.push_str("# TYPE playbox_outcomes_total counter\n");
        for (label, counter) in [
            ("success", &self.outcome_success),
            ("tool_failure", &self.outcome_tool_failure),
            ("timed_out", &self.outcome_timed_out),
            ("cancelled", &self.outcome_cancelled),
            ("sandbox_fault", &self.outcome_sandbox_fault),
        ] {
            output.push_str(&format!(
                "playbox_outcomes_total{{outcome=\"{label}\"}} {}\n",
                counter.get()
            ));
        }

        output.push_str("# HELP playbox_limit_exceeded_total Resource limit violations by kind\n");
        output.push_str("# TYPE playbox_limit_exceeded_total counter\n");
        for (kind, counter) in [
            (LimitKind::Cpu, &self.limit_cpu),
            (LimitKind::Memory, &self.limit_memory),
            (LimitKind::Output, &self.limit_output),
            (LimitKind::Capacity, &self.limit_capacity),
        ] {
            output.push_str(&format!(
                "playbox_limit_exceeded_total{{kind=\"{kind}\"}} {}\n",
                counter.get()
            ));
        }

        output.push_str("# HELP playbox_client_errors_total Requests rejected before dispatch\n");
        output.push_str("# TYPE playbox_client_errors_total counter\n");
        output.push_str(&format!(
            "playbox_client_errors_total {}\n",
            self.client_errors.get()
        ));

        output.push_str("# HELP playbox_active_sandboxes Currently running sandboxes\n");
        output.push_str("# TYPE playbox_active_sandboxes gauge\n");
        output.push_str(&format!(
            "playbox_active_sandboxes {}\n",
            self.active_sandboxes.get()
        ));

        output.push_str("# HELP playbox_queued_requests Requests waiting for a slot\n");
        output.push_str("# TYPE playbox_queued_requests gauge\n");
        output.push_str(&format!(
            "playbox_queued_requests {}\n",
            self.queued_requests.get()
        ));

        self.queue_wait.export(
            "playbox_queue_wait_seconds",
            "Time spent waiting for a concurrency slot",
            &mut output,
        );
        self.execution_duration.export(
            "playbox_execution_duration_seconds",
            "Sandbox execution time",
            &mut output,
        );

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
static METRICS: once_cell::sync::Lazy<Arc<MetricsRegistry>> =
    once_cell::sync::Lazy::new(|| Arc::new(MetricsRegistry::new()));

/// Get global metrics registry
pub fn get_metrics() -> Arc<MetricsRegistry> {
    Arc::clone(&METRICS)
}
