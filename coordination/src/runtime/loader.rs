//! Agent loading contract
//!
//! A loader turns an agent location into a started [`RuntimeHandle`] plus the
//! owner responsible for cleaning it up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::RuntimeHandle;

/// Whether the loader attaches the guardian to a freshly loaded runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardianPolicy {
    #[default]
    Attach,
    Skip,
}

/// Why an agent is being loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// The agent the user asked for.
    Worker,
    /// The fixed helper agent swapped in on escalation.
    EscalationTarget,
}

/// Everything a loader needs; model and guardian are shared across the
/// whole session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub agent_path: PathBuf,
    pub model: Option<String>,
    pub guardian: GuardianPolicy,
    pub role: AgentRole,
}

/// Load failures. All of them leave the caller's session untouched.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("missing credentials for {agent}: {detail}")]
    Credentials { agent: String, detail: String },

    #[error("invalid agent manifest at {path}: {message}")]
    InvalidManifest { path: PathBuf, message: String },

    #[error("failed to read agent at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("agent setup failed: {0}")]
    Setup(String),
}

/// Cleans up a runtime handle once nothing will resume it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentOwner: Send + Sync {
    /// Location the agent was loaded from, when it came from disk.
    fn agent_path(&self) -> Option<PathBuf>;

    /// Stop the runtime and release its resources. Best-effort: callers log
    /// and ignore failures.
    async fn teardown(&self) -> anyhow::Result<()>;
}

/// A started runtime and its owner.
#[derive(Clone)]
pub struct LoadedAgent {
    pub handle: Arc<dyn RuntimeHandle>,
    pub owner: Arc<dyn AgentOwner>,
}

impl LoadedAgent {
    pub fn new(handle: Arc<dyn RuntimeHandle>, owner: Arc<dyn AgentOwner>) -> Self {
        Self { handle, owner }
    }

    pub fn graph_id(&self) -> &str {
        self.handle.graph_id()
    }

    /// Display name: the agent directory name, or the graph id.
    pub fn name(&self) -> String {
        self.owner
            .agent_path()
            .as_deref()
            .and_then(agent_dir_name)
            .unwrap_or_else(|| self.graph_id().to_string())
    }
}

impl std::fmt::Debug for LoadedAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedAgent")
            .field("graph_id", &self.handle.graph_id())
            .field("agent_path", &self.owner.agent_path())
            .finish()
    }
}

/// Produces runtimes. Implementations do their blocking I/O off the calling
/// thread.
#[async_trait]
pub trait AgentLoader: Send + Sync {
    async fn load(&self, request: LoadRequest) -> Result<LoadedAgent, LoadError>;
}

pub(crate) fn agent_dir_name(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
}
