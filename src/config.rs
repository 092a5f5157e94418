//! Configuration management for shellrack.
//!
//! This module defines the structure of the `shellrack.toml` configuration
//! file, locates the data directory and turns configured entries into
//! `Command`s.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::command::{Command, CommandId, CommandSpec};
use crate::errors::ShellrackError;

pub const CONFIG_FILE_NAME: &str = "shellrack.toml";
pub const DEFAULT_MAX_LOG_FILES: usize = 50;
const DATA_DIR_NAME: &str = ".shellrack";
const DEFAULT_WORKING_DIR: &str = "~/";

const TEMPLATE: &str = r#"# shellrack configuration

# Shell used to run scripts. Defaults to $SHELL, then /bin/bash.
# shell = "/bin/zsh"

# Print lifecycle events (started, stopped, failed...) on the console.
notifications = true

# Log files kept per command, and for shellrack's own log.
max_log_files = 50

# Force-kill commands that are still running this long after shutdown
# asked them to stop. Without it shutdown waits indefinitely.
# shutdown_grace_ms = 5000

# Report output lines matching this regex as input requests.
# prompt_pattern = "(?i)enter .*:\\s*$"

[[command]]
name = "Echo Example"
script = "echo \"[$mode] Hello\""
working_dir = "~/"
env = { mode = "DEBUG" }
"#;

/// Top-level configuration structure corresponding to `shellrack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Shell override for running scripts.
    pub shell: Option<PathBuf>,
    /// Whether to print lifecycle events (default: true).
    pub notifications: Option<bool>,
    /// Log files retained per command (default: 50).
    pub max_log_files: Option<usize>,
    /// Grace period before a shutdown escalates to a kill.
    pub shutdown_grace_ms: Option<u64>,
    /// Regex for the prompt detector.
    pub prompt_pattern: Option<String>,
    /// Configured commands, in display order.
    #[serde(rename = "command", default)]
    pub commands: Vec<CommandConfig>,
}

/// Configuration for a single command.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    pub name: String,
    pub script: String,
    /// Defaults to the home directory.
    pub working_dir: Option<String>,
    pub env: Option<HashMap<String, String>>,
}

impl Config {
    pub fn notifications(&self) -> bool {
        self.notifications.unwrap_or(true)
    }

    pub fn max_log_files(&self) -> usize {
        self.max_log_files.unwrap_or(DEFAULT_MAX_LOG_FILES)
    }

    pub fn shutdown_grace(&self) -> Option<Duration> {
        self.shutdown_grace_ms.map(Duration::from_millis)
    }

    /// Builds the command list, rejecting blank entries and names that map to
    /// the same id.
    pub fn into_commands(self) -> Result<Vec<Arc<Command>>, ShellrackError> {
        let mut seen: HashMap<CommandId, String> = HashMap::new();
        let mut commands = Vec::with_capacity(self.commands.len());
        for entry in self.commands {
            let spec = entry.into_spec()?;
            let id = CommandId::from_name(&spec.name);
            if let Some(first) = seen.get(&id) {
                return Err(ShellrackError::DuplicateCommand {
                    first: first.clone(),
                    second: spec.name,
                    id: id.to_string(),
                });
            }
            seen.insert(id, spec.name.clone());
            commands.push(Arc::new(Command::new(spec)));
        }
        Ok(commands)
    }
}

impl CommandConfig {
    fn into_spec(self) -> Result<CommandSpec, ShellrackError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(ShellrackError::Config("command name must not be empty".into()));
        }
        if CommandId::from_name(&name).as_str().is_empty() {
            return Err(ShellrackError::Config(format!(
                "command name {name:?} has no usable characters"
            )));
        }
        if self.script.trim().is_empty() {
            return Err(ShellrackError::Config(format!(
                "command {name:?} has an empty script"
            )));
        }
        Ok(CommandSpec {
            name,
            script: self.script,
            working_dir: self
                .working_dir
                .filter(|dir| !dir.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_WORKING_DIR.to_string()),
            env: self.env.unwrap_or_default(),
        })
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .map_err(ShellrackError::from)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// `~/.shellrack`, or `.shellrack` in the current directory when no home
/// directory is known.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(DATA_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(DATA_DIR_NAME))
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Writes the commented template to `path` unless a file already exists.
/// Returns whether the file was created.
pub fn write_template(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, TEMPLATE)
        .with_context(|| format!("failed to write config file {}", path.display()))?;
    Ok(true)
}
