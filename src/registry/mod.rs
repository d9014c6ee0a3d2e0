//! Toolchain registry
//!
//! Static mapping from toolchain identifier to execution environment
//! descriptor. Populated once at startup from a fixed, versioned list and
//! read-only afterwards.

pub mod commands;
pub mod descriptor;

pub use commands::CommandTemplate;
pub use descriptor::{ExecutionEnvironmentDescriptor, NetworkPolicy, Toolchain};

use crate::config::types::{Action, ClientError, PlayboxError, ResourceProfile, Result};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;
const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;
const DEFAULT_MAX_PROCESSES: u32 = 512;

pub struct ToolchainRegistry {
    descriptors: HashMap<Toolchain, ExecutionEnvironmentDescriptor>,
}

impl ToolchainRegistry {
    /// Create registry with the default descriptor set
    pub fn new() -> Self {
        let mut registry = Self {
            descriptors: HashMap::new(),
        };

        registry.register_channel_v1(Toolchain::Stable, "Rust stable channel");
        registry.register_channel_v1(Toolchain::Beta, "Rust beta channel");
        registry.register_channel_v1(Toolchain::Nightly, "Rust nightly channel");
        registry.register_formatter_v1();
        registry.register_linter_v1();
        registry.register_verifier_v1();
        registry.register_memory_sanitizer_v1();

        registry
    }

    /// Build a registry from explicit descriptors. A later descriptor for the
    /// same toolchain replaces an earlier one.
    pub fn from_descriptors<I>(descriptors: I) -> Self
    where
        I: IntoIterator<Item = ExecutionEnvironmentDescriptor>,
    {
        let mut registry = Self {
            descriptors: HashMap::new(),
        };
        for descriptor in descriptors {
            registry.insert(descriptor);
        }
        registry
    }

    /// Replace image references from configuration, keyed by toolchain id
    pub fn with_image_overrides(mut self, images: &HashMap<String, String>) -> Result<Self> {
        for (id, image) in images {
            let toolchain: Toolchain = id.parse().map_err(|_| {
                PlayboxError::Config(format!("image override for unknown toolchain '{id}'"))
            })?;

            let descriptor = self.descriptors.get_mut(&toolchain).ok_or_else(|| {
                PlayboxError::Config(format!("toolchain '{id}' is not registered"))
            })?;

            log::info!(
                "Image override for {}: {} -> {}",
                toolchain,
                descriptor.image,
                image
            );
            descriptor.image = image.clone();
        }
        Ok(self)
    }

    /// Resolve a caller-supplied identifier. Unknown identifiers are a client
    /// error, never a panic.
    pub fn resolve(
        &self,
        identifier: &str,
    ) -> std::result::Result<&ExecutionEnvironmentDescriptor, ClientError> {
        let toolchain: Toolchain = identifier.parse()?;
        self.get(toolchain)
            .ok_or_else(|| ClientError::UnknownToolchain(identifier.to_string()))
    }

    pub fn get(&self, toolchain: Toolchain) -> Option<&ExecutionEnvironmentDescriptor> {
        self.descriptors.get(&toolchain)
    }

    pub fn has(&self, identifier: &str) -> bool {
        self.resolve(identifier).is_ok()
    }

    /// All descriptors in declaration order
    pub fn list(&self) -> Vec<&ExecutionEnvironmentDescriptor> {
        let mut list: Vec<_> = self.descriptors.values().collect();
        list.sort_by_key(|descriptor| descriptor.toolchain);
        list
    }

    fn insert(&mut self, descriptor: ExecutionEnvironmentDescriptor) {
        self.descriptors.insert(descriptor.toolchain, descriptor);
    }

    fn register_channel_v1(&mut self, toolchain: Toolchain, name: &str) {
        let commands = BTreeMap::from([
            (Action::Run, commands::channel_command(Action::Run)),
            (Action::Compile, commands::channel_command(Action::Compile)),
        ]);

        self.insert(ExecutionEnvironmentDescriptor {
            toolchain,
            name: name.to_string(),
            version: "1.0".to_string(),
            image: format!("playbox/rust-{}:1", toolchain.id()),
            commands,
            profile: profile(10, 512, 15),
            network: NetworkPolicy::Deny,
        });
    }

    fn register_formatter_v1(&mut self) {
        self.insert(ExecutionEnvironmentDescriptor {
            toolchain: Toolchain::Formatter,
            name: "rustfmt".to_string(),
            version: "1.0".to_string(),
            image: "playbox/rust-stable:1".to_string(),
            commands: BTreeMap::from([(Action::Format, commands::formatter_command())]),
            profile: profile(5, 256, 10),
            network: NetworkPolicy::Deny,
        });
    }

    fn register_linter_v1(&mut self) {
        self.insert(ExecutionEnvironmentDescriptor {
            toolchain: Toolchain::Linter,
            name: "Clippy".to_string(),
            version: "1.0".to_string(),
            image: "playbox/rust-stable:1".to_string(),
            commands: BTreeMap::from([(Action::Lint, commands::linter_command())]),
            profile: profile(20, 512, 30),
            network: NetworkPolicy::Deny,
        });
    }

    fn register_verifier_v1(&mut self) {
        self.insert(ExecutionEnvironmentDescriptor {
            toolchain: Toolchain::Verifier,
            name: "Kani model checker".to_string(),
            version: "1.0".to_string(),
            image: "playbox/kani:1".to_string(),
            commands: BTreeMap::from([(Action::Verify, commands::verifier_command())]),
            profile: profile(60, 1024, 90),
            network: NetworkPolicy::Deny,
        });
    }

    fn register_memory_sanitizer_v1(&mut self) {
        self.insert(ExecutionEnvironmentDescriptor {
            toolchain: Toolchain::MemorySanitizer,
            name: "Miri interpreter".to_string(),
            version: "1.0".to_string(),
            image: "playbox/rust-nightly:1".to_string(),
            commands: BTreeMap::from([(Action::Run, commands::memory_sanitizer_command())]),
            profile: profile(30, 1024, 45),
            network: NetworkPolicy::Deny,
        });
    }
}

impl Default for ToolchainRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn profile(cpu_seconds: u64, memory_mib: u64, wall_seconds: u64) -> ResourceProfile {
    ResourceProfile {
        max_cpu_seconds: cpu_seconds,
        max_memory_bytes: memory_mib * MIB,
        max_wall_clock: Duration::from_secs(wall_seconds),
        max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        max_processes: DEFAULT_MAX_PROCESSES,
    }
}
