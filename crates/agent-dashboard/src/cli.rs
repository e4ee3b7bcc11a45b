//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about = "Interactive agent dashboard with escalation", long_about = None)]
pub struct Cli {
    /// Agent to load at startup: a directory, or a name under the agents directory
    #[arg(long)]
    pub agent: Option<String>,

    /// Path to a dashboard TOML config
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Model override for every loaded agent (overrides AGENT_DASHBOARD_MODEL)
    #[arg(long)]
    pub model: Option<String>,

    /// Do not attach the guardian to loaded agents
    #[arg(long, default_value_t = false)]
    pub no_guardian: bool,

    /// Agent swapped in on escalation (overrides AGENT_DASHBOARD_ESCALATION_TARGET)
    #[arg(long)]
    pub escalation_target: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}
