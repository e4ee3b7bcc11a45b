//! Dashboard configuration.
//!
//! Precedence, lowest first: built-in defaults, TOML file, environment
//! (`AGENT_DASHBOARD_MODEL`, `AGENT_DASHBOARD_ESCALATION_TARGET`), CLI flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use coordination::runtime::GuardianPolicy;
use coordination::session::SessionConfig;
use serde::Deserialize;
use tracing::debug;

use crate::cli::Cli;

pub const ENV_MODEL: &str = "AGENT_DASHBOARD_MODEL";
pub const ENV_ESCALATION_TARGET: &str = "AGENT_DASHBOARD_ESCALATION_TARGET";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// Model override applied to every load.
    pub model: Option<String>,
    pub guardian: GuardianPolicy,
    /// Agent swapped in on escalation, whatever the worker.
    pub escalation_target: PathBuf,
    /// How long shutdown waits for the current execution to stop.
    pub cancel_timeout_secs: u64,
    /// Where bare agent names are looked up.
    pub agents_dir: PathBuf,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            model: None,
            guardian: GuardianPolicy::Attach,
            escalation_target: PathBuf::from("agents/hive_coder"),
            cancel_timeout_secs: 5,
            agents_dir: PathBuf::from("agents"),
        }
    }
}

impl DashboardConfig {
    /// Load the config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: DashboardConfig =
            toml::from_str(&content).context("Failed to parse dashboard config TOML")?;
        Ok(config)
    }

    /// Defaults or `path`, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(model) = lookup(ENV_MODEL).filter(|m| !m.is_empty()) {
            debug!(model = %model, "model from environment");
            self.model = Some(model);
        }
        if let Some(target) = lookup(ENV_ESCALATION_TARGET).filter(|t| !t.is_empty()) {
            self.escalation_target = PathBuf::from(target);
        }
    }

    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(model) = &cli.model {
            self.model = Some(model.clone());
        }
        if cli.no_guardian {
            self.guardian = GuardianPolicy::Skip;
        }
        if let Some(target) = &cli.escalation_target {
            self.escalation_target = target.clone();
        }
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_secs(self.cancel_timeout_secs)
    }

    pub fn session_config(&self) -> SessionConfig {
        let config = SessionConfig::new(&self.escalation_target)
            .with_guardian(self.guardian)
            .with_cancel_timeout(self.cancel_timeout());
        match &self.model {
            Some(model) => config.with_model(model.clone()),
            None => config,
        }
    }

    /// A bare name resolves under `agents_dir`; anything path-like is used
    /// as given.
    pub fn resolve_agent(&self, agent: &str) -> PathBuf {
        let path = Path::new(agent);
        if path.components().count() > 1 || path.is_absolute() {
            path.to_path_buf()
        } else {
            self.agents_dir.join(agent)
        }
    }
}
