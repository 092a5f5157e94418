//! Command definitions and their lifecycle state.
//!
//! A `Command` pairs the static definition of a shell task (`CommandSpec`) with
//! its mutable lifecycle state (`CommandState`). The state lives behind a
//! single mutex so that status and the `cancelled` annotation are always read
//! and written together, whichever task touches them.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

/// Stable identifier derived from a command name.
///
/// Alphanumeric and whitespace characters are kept, every whitespace
/// character becomes `_` and everything else is dropped. Two names can map to
/// the same id; the config loader rejects such pairs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    pub fn from_name(name: &str) -> Self {
        let id = name
            .chars()
            .filter(|c| c.is_alphanumeric() || c.is_whitespace())
            .map(|c| if c.is_whitespace() { '_' } else { c })
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Definition of a command as read from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Display name.
    pub name: String,
    /// Command line handed to the shell.
    pub script: String,
    /// Working directory, may start with `~`.
    pub working_dir: String,
    /// Variables merged over the inherited environment.
    pub env: HashMap<String, String>,
}

/// The lifecycle status of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    /// Never started in this session.
    Idle,
    /// A process is live for this command.
    Running,
    /// The last run could not be spawned or exited abnormally.
    Failed,
    /// The last run exited with code 0.
    Success,
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CommandStatus::Idle => "idle",
            CommandStatus::Running => "running",
            CommandStatus::Failed => "failed",
            CommandStatus::Success => "success",
        };
        f.write_str(label)
    }
}

/// Consistent snapshot of a command's mutable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommandState {
    pub status: CommandStatus,
    /// Termination was requested but the process has not exited yet.
    pub cancelled: bool,
}

impl Default for CommandState {
    fn default() -> Self {
        Self {
            status: CommandStatus::Idle,
            cancelled: false,
        }
    }
}

/// A user-defined shell task and its lifecycle state.
#[derive(Debug)]
pub struct Command {
    id: CommandId,
    spec: CommandSpec,
    state: Mutex<CommandState>,
}

impl Command {
    /// Creates an idle command from its definition.
    pub fn new(spec: CommandSpec) -> Self {
        Self {
            id: CommandId::from_name(&spec.name),
            spec,
            state: Mutex::new(CommandState::default()),
        }
    }

    pub fn id(&self) -> &CommandId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Returns status and cancellation as one atomic read.
    pub fn snapshot(&self) -> CommandState {
        *self.lock_state()
    }

    pub fn status(&self) -> CommandStatus {
        self.lock_state().status
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().status == CommandStatus::Running
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock_state().cancelled
    }

    pub(crate) fn mark_running(&self) {
        let mut state = self.lock_state();
        state.status = CommandStatus::Running;
        state.cancelled = false;
    }

    /// Sets the cancelled annotation. Only a running command can be cancelled;
    /// returns whether the flag was set.
    pub(crate) fn mark_cancelled(&self) -> bool {
        let mut state = self.lock_state();
        if state.status != CommandStatus::Running {
            return false;
        }
        state.cancelled = true;
        true
    }

    /// Assigns a terminal status and clears the cancelled annotation.
    pub(crate) fn mark_finished(&self, success: bool) {
        let mut state = self.lock_state();
        state.cancelled = false;
        state.status = if success {
            CommandStatus::Success
        } else {
            CommandStatus::Failed
        };
    }

    // A poisoned lock still holds a valid Copy state.
    fn lock_state(&self) -> MutexGuard<'_, CommandState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
