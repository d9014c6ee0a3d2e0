// Config and request validation
// Service config is validated once at startup and fails fast with actionable errors.
// Submissions and limit overrides are validated per request before any sandbox work.

use crate::config::service::ServiceConfig;
use crate::config::types::{ClientError, LimitOverrides, PlayboxError, Result, Submission};
use std::time::Duration;

/// Smallest memory limit a container runtime accepts (6 MiB for Docker)
pub const MIN_MEMORY_OVERRIDE_BYTES: u64 = 6 * 1024 * 1024;

/// Shortest wall-clock override; anything less cannot start a container
pub const MIN_DURATION_OVERRIDE: Duration = Duration::from_millis(10);

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate service config at startup. Errors are fatal; warnings are logged.
pub fn validate_service_config(config: &ServiceConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    if config.runtime_binary.trim().is_empty() {
        result.add_error("runtime_binary cannot be empty".to_string());
    }

    if config.max_concurrent == 0 {
        result.add_error("max_concurrent must be at least 1".to_string());
    }

    if config.max_source_bytes == 0 {
        result.add_error("max_source_bytes cannot be zero".to_string());
    }

    if config.poll_interval_ms == 0 {
        result.add_error("poll_interval_ms cannot be zero".to_string());
    } else if config.poll_interval_ms > 1_000 {
        result.add_warning(format!(
            "poll_interval_ms {} is high, limit enforcement will lag",
            config.poll_interval_ms
        ));
    }

    if config.cpu_sample_interval_ms == 0 {
        result.add_error("cpu_sample_interval_ms cannot be zero".to_string());
    }

    if !config.workspace_root.is_absolute() {
        result.add_error(format!(
            "workspace_root must be an absolute path: {:?}",
            config.workspace_root
        ));
    }

    if config.max_queue_wait_ms == 0 {
        result.add_warning(
            "max_queue_wait_ms is zero, requests are rejected whenever the pool is full"
                .to_string(),
        );
    }

    for (toolchain, image) in &config.images {
        if image.trim().is_empty() {
            result.add_error(format!("image override for '{toolchain}' is empty"));
        }
    }

    for warning in &result.warnings {
        log::warn!("Config warning: {}", warning);
    }

    if !result.is_valid() {
        return Err(PlayboxError::Config(format!(
            "Config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    Ok(result)
}

/// Reject submissions that can never run, before resolving or spending a slot
pub fn validate_submission(
    submission: &Submission,
    max_source_bytes: usize,
) -> std::result::Result<(), ClientError> {
    if submission.source().trim().is_empty() {
        return Err(ClientError::MalformedSubmission(
            "source is empty".to_string(),
        ));
    }

    if submission.source().len() > max_source_bytes {
        return Err(ClientError::MalformedSubmission(format!(
            "source is {} bytes, the limit is {} bytes",
            submission.source().len(),
            max_source_bytes
        )));
    }

    if submission.source().contains('\0') {
        return Err(ClientError::MalformedSubmission(
            "source contains a NUL byte".to_string(),
        ));
    }

    Ok(())
}

/// Overrides must be at least the runtime's floor; tightening against the
/// profile happens later
pub fn validate_overrides(overrides: &LimitOverrides) -> std::result::Result<(), ClientError> {
    if let Some(duration) = overrides.max_duration {
        if duration < MIN_DURATION_OVERRIDE {
            return Err(ClientError::InvalidOverride(format!(
                "max_duration must be at least {:?}",
                MIN_DURATION_OVERRIDE
            )));
        }
    }

    if let Some(memory) = overrides.max_memory_bytes {
        if memory < MIN_MEMORY_OVERRIDE_BYTES {
            return Err(ClientError::InvalidOverride(format!(
                "max_memory_bytes must be at least {} bytes",
                MIN_MEMORY_OVERRIDE_BYTES
            )));
        }
    }

    Ok(())
}
