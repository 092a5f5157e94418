//! Optional observers attached to the output drain.
//!
//! Observers see each complete output line of a run (ANSI codes stripped)
//! after it has been forwarded to the sink. They cannot alter or hold back
//! output. `PromptDetector` reports lines that match a prompt pattern so the
//! control surface can ask the user for input.

use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use crate::command::Command;
use crate::errors::Result;
use crate::events::LifecycleEvent;
use crate::notify::Notifier;
use crate::output::sanitize_text;

pub trait OutputObserver: Send + Sync {
    fn on_line(&self, command: &Command, line: &str);
}

/// Emits `InputRequested` when an output line matches `pattern`.
pub struct PromptDetector {
    pattern: Regex,
    notifier: Arc<dyn Notifier>,
}

impl PromptDetector {
    pub fn new(pattern: &str, notifier: Arc<dyn Notifier>) -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            notifier,
        })
    }
}

impl OutputObserver for PromptDetector {
    fn on_line(&self, command: &Command, line: &str) {
        if !self.pattern.is_match(line) {
            return;
        }
        debug!(command = %command.name(), line, "prompt detected");
        self.notifier.notify(&LifecycleEvent::InputRequested {
            name: command.name().to_string(),
            prompt: line.trim().to_string(),
        });
    }
}

/// Reassembles lines from arbitrary output chunks.
#[derive(Debug, Default)]
pub(crate) struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = sanitize_text(&line[..line.len() - 1]);
            lines.push(text.trim_end_matches('\r').to_string());
        }
        lines
    }

    /// Returns the unterminated tail, if any.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let tail = std::mem::take(&mut self.pending);
        Some(sanitize_text(&tail))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::command::CommandSpec;
    use crate::notify::ChannelNotifier;

    #[test]
    fn splitter_joins_chunks_across_boundaries() {
        let mut splitter = LineSplitter::default();
        assert!(splitter.push(b"hel").is_empty());
        assert_eq!(splitter.push(b"lo\r\nwor"), vec!["hello"]);
        assert_eq!(splitter.push(b"ld\n\x1b[1mbold\x1b[0m\n"), vec!["world", "bold"]);
        assert_eq!(splitter.push(b"tail"), Vec::<String>::new());
        assert_eq!(splitter.finish().as_deref(), Some("tail"));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn detector_reports_matching_lines_only() {
        let (notifier, mut rx) = ChannelNotifier::channel();
        let detector =
            PromptDetector::new("enter the code", Arc::new(notifier)).unwrap();
        let command = Command::new(CommandSpec {
            name: "bot".into(),
            script: "python bot.py".into(),
            working_dir: "~/".into(),
            env: HashMap::new(),
        });

        detector.on_line(&command, "connecting...");
        detector.on_line(&command, "Please enter the code you received: ");

        assert_eq!(
            rx.try_recv().unwrap(),
            LifecycleEvent::InputRequested {
                name: "bot".into(),
                prompt: "Please enter the code you received:".into(),
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let (notifier, _rx) = ChannelNotifier::channel();
        assert!(PromptDetector::new("(", Arc::new(notifier)).is_err());
    }
}
