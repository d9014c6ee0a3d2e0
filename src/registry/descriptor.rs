/// Execution environment descriptors
///
/// A descriptor is an immutable, versioned record: which image to start,
/// how to invoke the toolchain for each supported action, and the resource
/// profile every execution is capped at.
use crate::config::types::{Action, ClientError, ResourceProfile};
use crate::registry::commands::CommandTemplate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Closed set of toolchain identifiers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Toolchain {
    Stable,
    Beta,
    Nightly,
    Formatter,
    Linter,
    Verifier,
    MemorySanitizer,
}

impl Toolchain {
    pub const ALL: [Toolchain; 7] = [
        Toolchain::Stable,
        Toolchain::Beta,
        Toolchain::Nightly,
        Toolchain::Formatter,
        Toolchain::Linter,
        Toolchain::Verifier,
        Toolchain::MemorySanitizer,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Toolchain::Stable => "stable",
            Toolchain::Beta => "beta",
            Toolchain::Nightly => "nightly",
            Toolchain::Formatter => "formatter",
            Toolchain::Linter => "linter",
            Toolchain::Verifier => "verifier",
            Toolchain::MemorySanitizer => "memory-sanitizer",
        }
    }
}

impl fmt::Display for Toolchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Toolchain {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Toolchain::ALL
            .iter()
            .copied()
            .find(|toolchain| toolchain.id() == s)
            .ok_or_else(|| ClientError::UnknownToolchain(s.to_string()))
    }
}

/// Network access granted to an environment
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPolicy {
    #[default]
    Deny,
    Allow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionEnvironmentDescriptor {
    pub toolchain: Toolchain,
    /// Human-readable name
    pub name: String,
    /// Version of this descriptor
    pub version: String,
    /// Image reference handed to the container runtime
    pub image: String,
    pub commands: BTreeMap<Action, CommandTemplate>,
    pub profile: ResourceProfile,
    pub network: NetworkPolicy,
}

impl ExecutionEnvironmentDescriptor {
    pub fn supports(&self, action: Action) -> bool {
        self.commands.contains_key(&action)
    }

    pub fn supported_actions(&self) -> Vec<Action> {
        self.commands.keys().copied().collect()
    }

    /// Command template for `action`, or the client error naming the mismatch
    pub fn command_for(&self, action: Action) -> Result<&CommandTemplate, ClientError> {
        self.commands
            .get(&action)
            .ok_or_else(|| ClientError::UnsupportedAction {
                toolchain: self.toolchain.id().to_string(),
                action,
            })
    }
}
