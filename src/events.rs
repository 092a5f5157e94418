//! Lifecycle events reported to notification sinks.
//!
//! The runner emits one `LifecycleEvent` per observable transition of a
//! command: it started, it could not be started, or its process ended (stopped
//! by the user, completed, or failed). Prompt detection adds `InputRequested`.

use std::fmt;

/// A user-facing report about a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The process was spawned.
    Started { name: String, pid: u32 },
    /// No process could be created.
    FailedToStart { name: String, error: String },
    /// The process exited after a termination request.
    Stopped { name: String },
    /// The process exited on its own with code 0.
    Completed { name: String },
    /// The process exited on its own with a non-zero code, or was killed by a
    /// signal (`code` is `None`).
    Failed { name: String, code: Option<i32> },
    /// Output matched the configured prompt pattern.
    InputRequested { name: String, prompt: String },
}

impl LifecycleEvent {
    /// Name of the command the event is about.
    pub fn name(&self) -> &str {
        match self {
            LifecycleEvent::Started { name, .. }
            | LifecycleEvent::FailedToStart { name, .. }
            | LifecycleEvent::Stopped { name }
            | LifecycleEvent::Completed { name }
            | LifecycleEvent::Failed { name, .. }
            | LifecycleEvent::InputRequested { name, .. } => name,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            LifecycleEvent::Started { .. } => "Command Started",
            LifecycleEvent::FailedToStart { .. } => "Command Failed to Start",
            LifecycleEvent::Stopped { .. } => "Command Stopped",
            LifecycleEvent::Completed { .. } => "Command Completed",
            LifecycleEvent::Failed { .. } => "Command Failed",
            LifecycleEvent::InputRequested { .. } => "Input Requested",
        }
    }

    pub fn body(&self) -> String {
        match self {
            LifecycleEvent::Started { name, .. } => format!("{name} is now running"),
            LifecycleEvent::FailedToStart { name, error } => format!("{name} error: {error}"),
            LifecycleEvent::Stopped { name } => format!("{name} was manually stopped"),
            LifecycleEvent::Completed { name } => format!("{name} completed successfully"),
            LifecycleEvent::Failed {
                name,
                code: Some(code),
            } => format!("{name} failed with exit code: {code}"),
            LifecycleEvent::Failed { name, code: None } => {
                format!("{name} was terminated by a signal")
            }
            LifecycleEvent::InputRequested { name, prompt } => format!("{name}: {prompt}"),
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.title(), self.body())
    }
}
