use crate::core::runtime::ContainerRuntime;
use std::sync::Arc;

/// Removes a container when dropped, on every exit path including panics
/// unwinding through the supervisor.
pub struct ContainerGuard {
    runtime: Arc<dyn ContainerRuntime>,
    name: String,
}

impl ContainerGuard {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, name: impl Into<String>) -> Self {
        Self {
            runtime,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.remove(&self.name) {
            log::warn!("Failed to remove container {}: {}", self.name, e);
        } else {
            log::debug!("Removed container {}", self.name);
        }
    }
}
