//! Sandbox policy derivation
//!
//! The sandbox engine itself is an external collaborator. This module only
//! derives the capability set a run's child process is granted from the
//! agent's declared permissions and exports it through the environment.
//! Policy derivation failing or being unsupported on the current platform
//! degrades to "no sandboxing": logged by the caller, never fatal to a run.

use crate::error::Result;
use crate::types::Agent;
use serde::{Deserialize, Serialize};

/// Capability set granted to a run's child process
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxPolicy {
    pub allow_file_read: bool,
    pub allow_file_write: bool,
    pub allow_network: bool,
    /// False when derivation was skipped or failed and the run proceeds
    /// without sandboxing
    pub enforced: bool,
}

impl SandboxPolicy {
    /// Everything allowed, nothing enforced. The degraded fallback when a
    /// policy cannot be derived.
    pub fn permissive() -> Self {
        Self {
            allow_file_read: true,
            allow_file_write: true,
            allow_network: true,
            enforced: false,
        }
    }

    /// Environment variables exported to the child process. The external
    /// sandbox engine reads these; this subsystem does not enforce them.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        fn flag(value: bool) -> String {
            if value { "1" } else { "0" }.to_string()
        }
        vec![
            ("OVERSEER_SANDBOX_ENFORCED".to_string(), flag(self.enforced)),
            ("OVERSEER_SANDBOX_FILE_READ".to_string(), flag(self.allow_file_read)),
            ("OVERSEER_SANDBOX_FILE_WRITE".to_string(), flag(self.allow_file_write)),
            ("OVERSEER_SANDBOX_NETWORK".to_string(), flag(self.allow_network)),
        ]
    }
}

/// Source of sandbox policies for agents
pub trait PolicyProvider: Send + Sync {
    fn derive_policy(&self, agent: &Agent) -> Result<SandboxPolicy>;
}

/// Derives policies from the agent's permission flags on platforms where
/// the sandbox engine is available
#[derive(Debug, Default)]
pub struct PlatformPolicyProvider;

impl PlatformPolicyProvider {
    pub fn new() -> Self {
        Self
    }
}

impl PolicyProvider for PlatformPolicyProvider {
    fn derive_policy(&self, agent: &Agent) -> Result<SandboxPolicy> {
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            Ok(SandboxPolicy {
                allow_file_read: agent.allow_file_read,
                allow_file_write: agent.allow_file_write,
                allow_network: agent.allow_network,
                enforced: true,
            })
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            let _ = agent;
            Err(crate::error::Error::Sandbox(
                crate::error::SandboxError::UnsupportedPlatform(
                    std::env::consts::OS.to_string(),
                ),
            ))
        }
    }
}
