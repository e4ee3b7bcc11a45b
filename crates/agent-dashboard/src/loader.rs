//! Directory loader
//!
//! An agent is a directory holding an `agent.toml` manifest:
//!
//! ```toml
//! graph = "inbox"
//! graphs = ["inbox_monitor"]
//! requires_env = ["ANTHROPIC_API_KEY"]
//! step_delay_ms = 150
//!
//! [[entry_points]]
//! id = "default"
//! entry_node = "intake"
//!
//! [[script]]
//! step = "emit"
//! type = "node_loop_started"
//! node_id = "intake"
//!
//! [completion]
//! return_summary = "Added the missing tool."
//! ```
//!
//! The manifest is replayed by a [`ScriptedRuntime`]; the owner stops the
//! runtime and joins its threads on teardown.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coordination::runtime::{
    AgentLoader, AgentOwner, AgentRole, EntryPoint, GuardianPolicy, LoadError, LoadRequest,
    LoadedAgent, ScriptStep, ScriptedRuntime,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

pub const MANIFEST_FILE: &str = "agent.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentManifest {
    /// Primary graph id.
    pub graph: String,
    #[serde(default)]
    pub graphs: Vec<String>,
    #[serde(default)]
    pub entry_points: Vec<EntryPoint>,
    /// Environment variables that must be set, typically API keys.
    #[serde(default)]
    pub requires_env: Vec<String>,
    #[serde(default)]
    pub step_delay_ms: u64,
    #[serde(default)]
    pub script: Vec<ScriptStep>,
    /// Extra fields on the final EXECUTION_COMPLETED event.
    #[serde(default)]
    pub completion: Map<String, Value>,
}

impl AgentManifest {
    pub fn parse(path: &Path, content: &str) -> Result<Self, LoadError> {
        let manifest: AgentManifest =
            toml::from_str(content).map_err(|e| LoadError::InvalidManifest {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        if manifest.graph.trim().is_empty() {
            return Err(LoadError::InvalidManifest {
                path: path.to_path_buf(),
                message: "graph must not be empty".to_string(),
            });
        }
        Ok(manifest)
    }

    fn build_runtime(&self) -> ScriptedRuntime {
        let mut builder = ScriptedRuntime::builder(self.graph.clone())
            .script(self.script.clone())
            .step_delay(Duration::from_millis(self.step_delay_ms))
            .completion_data(self.completion.clone());
        for graph in &self.graphs {
            builder = builder.graph(graph.clone());
        }
        for entry in &self.entry_points {
            builder = builder.entry_point(entry.id.clone(), entry.entry_node.clone());
        }
        builder.build()
    }
}

/// Owns a manifest-backed runtime.
pub struct ManifestRunner {
    path: PathBuf,
    runtime: ScriptedRuntime,
    model: Option<String>,
    guardian: bool,
    torn_down: AtomicBool,
}

#[async_trait]
impl AgentOwner for ManifestRunner {
    fn agent_path(&self) -> Option<PathBuf> {
        Some(self.path.clone())
    }

    async fn teardown(&self) -> anyhow::Result<()> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.runtime.stop();
        let runtime = self.runtime.clone();
        tokio::task::spawn_blocking(move || runtime.join_workers()).await?;
        debug!(
            agent = %self.path.display(),
            model = self.model.as_deref().unwrap_or("default"),
            guardian = self.guardian,
            "runner stopped"
        );
        Ok(())
    }
}

/// Loads agents from directories containing an [`MANIFEST_FILE`].
#[derive(Debug, Clone, Default)]
pub struct DirectoryLoader;

impl DirectoryLoader {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AgentLoader for DirectoryLoader {
    async fn load(&self, request: LoadRequest) -> Result<LoadedAgent, LoadError> {
        let manifest_path = request.agent_path.join(MANIFEST_FILE);
        let read_path = manifest_path.clone();
        let content = tokio::task::spawn_blocking(move || std::fs::read_to_string(&read_path))
            .await
            .map_err(|e| LoadError::Setup(e.to_string()))?
            .map_err(|source| LoadError::Io {
                path: manifest_path.clone(),
                source,
            })?;
        let manifest = AgentManifest::parse(&manifest_path, &content)?;

        let agent_name = request
            .agent_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| manifest.graph.clone());
        let missing: Vec<&str> = manifest
            .requires_env
            .iter()
            .map(String::as_str)
            .filter(|key| std::env::var(key).map_or(true, |v| v.is_empty()))
            .collect();
        if !missing.is_empty() {
            return Err(LoadError::Credentials {
                agent: agent_name,
                detail: format!("{} not set", missing.join(", ")),
            });
        }

        let runtime = manifest.build_runtime();
        runtime.start();
        let guardian = request.guardian == GuardianPolicy::Attach && request.role == AgentRole::Worker;
        info!(
            agent = %agent_name,
            graph = %manifest.graph,
            role = ?request.role,
            model = request.model.as_deref().unwrap_or("default"),
            guardian,
            "agent loaded"
        );

        let owner = ManifestRunner {
            path: request.agent_path,
            runtime: runtime.clone(),
            model: request.model,
            guardian,
            torn_down: AtomicBool::new(false),
        };
        Ok(LoadedAgent::new(Arc::new(runtime), Arc::new(owner)))
    }
}
