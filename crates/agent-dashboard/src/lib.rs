//! Agent dashboard front end
//!
//! Wires the `coordination` session core to a terminal: command-line and
//! TOML configuration, a loader for agent directories, slash-command
//! parsing, and plain-text rendering of sink snapshots.

pub mod cli;
pub mod commands;
pub mod config;
pub mod loader;
pub mod render;

pub use cli::Cli;
pub use commands::{parse_line, route_line, Input, ParseError};
pub use config::DashboardConfig;
pub use loader::{AgentManifest, DirectoryLoader, ManifestRunner, MANIFEST_FILE};
pub use render::Screen;
