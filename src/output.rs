//! Output sinks for command runs.
//!
//! Every run of a command gets its own `OutputHandle`, opened through an
//! `OutputSink`. The file-backed sink stores runs under
//! `<data_dir>/outs/<command-id>/<timestamp>.log` and prunes old runs.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use strip_ansi_escapes::strip;
use tracing::{debug, info, warn};

use crate::command::{Command, CommandId};

/// Indicates the source stream of an output chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// Produces a writable handle for one run of a command.
pub trait OutputSink: Send + Sync {
    fn open(&self, command: &Command) -> io::Result<Box<dyn OutputHandle>>;
}

/// Writable destination for one run's output.
pub trait OutputHandle: Send {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Releases the handle. Calling it again is a no-op, and failures are
    /// only logged.
    fn close(&mut self);
}

/// Stores each run in a fresh timestamped file.
#[derive(Debug, Clone)]
pub struct FileOutputSink {
    base_dir: PathBuf,
}

impl FileOutputSink {
    /// `data_dir` is the application data directory; files go to `outs/`
    /// below it.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            base_dir: data_dir.join("outs"),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Keeps the newest `keep` log files of every known command and deletes
    /// the rest. Directories of commands that are no longer configured are
    /// left alone. Returns the number of files removed.
    pub fn cleanup_obsolete(&self, ids: &[&CommandId], keep: usize) -> usize {
        let Ok(entries) = fs::read_dir(&self.base_dir) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let known = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| ids.iter().any(|id| id.as_str() == name))
                .unwrap_or(false);
            if known {
                removed += purge_excess_logs(&path, keep);
            }
        }
        removed
    }
}

impl OutputSink for FileOutputSink {
    fn open(&self, command: &Command) -> io::Result<Box<dyn OutputHandle>> {
        let dir = self.base_dir.join(command.id().as_str());
        fs::create_dir_all(&dir)?;
        let stamp = chrono::Local::now().format("%Y-%m-%d-%H%M%S%.3f").to_string();

        let mut attempt = 0u32;
        loop {
            let file_name = if attempt == 0 {
                format!("{stamp}.log")
            } else {
                format!("{stamp}-{attempt}.log")
            };
            let path = dir.join(file_name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    debug!(command = %command.name(), path = %path.display(), "opened output file");
                    return Ok(Box::new(FileOutputHandle {
                        file: Some(file),
                        path,
                    }));
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
                Err(err) => return Err(err),
            }
        }
    }
}

/// Handle over one run's log file.
#[derive(Debug)]
pub struct FileOutputHandle {
    file: Option<File>,
    path: PathBuf,
}

impl OutputHandle for FileOutputHandle {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(bytes),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("output file {} already closed", self.path.display()),
            )),
        }
    }

    fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(err) = file.flush() {
                warn!(path = %self.path.display(), error = %err, "failed to flush output file");
            }
        }
    }
}

fn purge_excess_logs(dir: &Path, keep: usize) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let mut logs: Vec<(PathBuf, SystemTime)> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "log"))
        .filter_map(|path| {
            let modified = fs::metadata(&path).and_then(|m| m.modified()).ok()?;
            Some((path, modified))
        })
        .collect();
    // Newest first; file names break ties since they embed the start time.
    logs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    let mut removed = 0;
    for (path, _) in logs.into_iter().skip(keep) {
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %path.display(), "deleted log file");
                removed += 1;
            }
            Err(err) => warn!(path = %path.display(), error = %err, "failed to delete log file"),
        }
    }
    removed
}

/// Strips ANSI escape codes and replaces invalid UTF-8.
pub fn sanitize_text(bytes: &[u8]) -> String {
    let stripped = strip(bytes);
    String::from_utf8_lossy(&stripped).to_string()
}
