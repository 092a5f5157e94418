//! shellrack: toggle named shell commands on and off from one console.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads configuration, wires the process runner to its output
//! storage and notifications, and runs the stdin control loop until shutdown.

mod command;
mod config;
mod errors;
mod events;
mod logging;
mod notify;
mod observer;
mod output;
mod runner;
mod shutdown;

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::command::{Command, CommandId, CommandStatus};
use crate::config::Config;
use crate::errors::ShellrackError;
use crate::logging::LogLevel;
use crate::notify::{ChannelNotifier, FanoutNotifier, Notifier, TracingNotifier};
use crate::observer::{OutputObserver, PromptDetector};
use crate::output::FileOutputSink;
use crate::runner::{CommandRunner, RunnerOptions, StartOutcome};
use crate::shutdown::{ShutdownCoordinator, ShutdownReason, ShutdownTrigger};

const CONTROL_HELP: &str = "\
commands:
  toggle <name>        start or stop a command
  start <name>         start a command
  stop <name>          stop a command and wait for it to exit
  status               show every command
  input <name> <text>  send a line to a command's stdin
  stopall              stop every running command
  reload               re-read the config (only while nothing runs)
  quit                 stop everything and exit";

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "shellrack",
    version,
    about = "Toggle named shell commands on and off",
    styles = help_styles()
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to shellrack.toml (default: <data-dir>/shellrack.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Data directory for output and logs (default: ~/.shellrack).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Log level (overrides SHELLRACK_LOG).
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Start the named commands and read control commands from stdin.
    Run {
        /// Commands to start right away, by name or id.
        names: Vec<String>,
    },
    /// List configured commands.
    List {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Write a commented configuration template.
    Init,
    /// Delete old output logs.
    Clean,
}

struct Paths {
    data_dir: PathBuf,
    config: PathBuf,
}

impl Paths {
    fn from_cli(cli: &Cli) -> Self {
        let data_dir = cli.data_dir.clone().unwrap_or_else(config::default_data_dir);
        let config = cli
            .config
            .clone()
            .unwrap_or_else(|| config::config_path(&data_dir));
        Self { data_dir, config }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let paths = Paths::from_cli(&cli);
    let command = cli
        .command
        .clone()
        .unwrap_or(Commands::Run { names: Vec::new() });

    match command {
        Commands::Init => {
            logging::init_logging(cli.log_level, None, 0)?;
            init(&paths)
        }
        Commands::List { json } => {
            logging::init_logging(cli.log_level, None, 0)?;
            list(&paths, json)
        }
        Commands::Clean => {
            logging::init_logging(cli.log_level, None, 0)?;
            clean(&paths)
        }
        Commands::Run { names } => {
            if config::write_template(&paths.config)? {
                println!("created {}", paths.config.display());
            }
            let config = config::load_config(&paths.config)?;
            let _guard = logging::init_logging(
                cli.log_level,
                Some(&paths.data_dir.join("logs")),
                config.max_log_files(),
            )?;
            run(&paths, config, &names).await
        }
    }
}

fn init(paths: &Paths) -> Result<()> {
    if config::write_template(&paths.config)? {
        println!("created {}", paths.config.display());
    } else {
        println!("{} already exists", paths.config.display());
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct CommandSummary<'a> {
    name: &'a str,
    id: &'a CommandId,
    script: &'a str,
    working_dir: &'a str,
}

fn list(paths: &Paths, json: bool) -> Result<()> {
    let commands = load_commands(&paths.config)?;
    let summaries: Vec<CommandSummary<'_>> = commands
        .iter()
        .map(|command| CommandSummary {
            name: command.name(),
            id: command.id(),
            script: &command.spec().script,
            working_dir: &command.spec().working_dir,
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }
    for summary in &summaries {
        println!(
            "{:<24} {:<16} {}",
            summary.name, summary.working_dir, summary.script
        );
    }
    Ok(())
}

fn clean(paths: &Paths) -> Result<()> {
    let config = config::load_config(&paths.config)?;
    let keep = config.max_log_files();
    let commands = config.into_commands()?;
    let sink = FileOutputSink::new(&paths.data_dir);
    let ids: Vec<&CommandId> = commands.iter().map(|command| command.id()).collect();
    let removed = sink.cleanup_obsolete(&ids, keep);
    println!("removed {removed} log file(s)");
    Ok(())
}

fn load_commands(path: &Path) -> Result<Vec<Arc<Command>>> {
    let commands = config::load_config(path)?
        .into_commands()
        .with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(commands)
}

async fn run(paths: &Paths, config: Config, names: &[String]) -> Result<()> {
    let sink = FileOutputSink::new(&paths.data_dir);
    let keep = config.max_log_files();
    let grace = config.shutdown_grace();
    let shell = config.shell.clone();
    let notifications = config.notifications();
    let prompt_pattern = config.prompt_pattern.clone();
    let commands = config.into_commands()?;
    let initial = resolve_commands(&commands, names)?;

    let ids: Vec<&CommandId> = commands.iter().map(|command| command.id()).collect();
    let removed = sink.cleanup_obsolete(&ids, keep);
    debug!(removed, dir = %sink.base_dir().display(), "cleaned up old output logs");

    let mut fanout = FanoutNotifier::new().with(Arc::new(TracingNotifier));
    if notifications {
        let (notifier, events) = ChannelNotifier::channel();
        fanout = fanout.with(Arc::new(notifier));
        spawn_event_printer(events);
    }
    let notifier: Arc<dyn Notifier> = Arc::new(fanout);

    let mut observers: Vec<Arc<dyn OutputObserver>> = Vec::new();
    if let Some(pattern) = prompt_pattern.as_deref() {
        let detector = PromptDetector::new(pattern, notifier.clone())
            .context("invalid prompt_pattern")?;
        observers.push(Arc::new(detector));
    }

    let runner = CommandRunner::new(
        Arc::new(sink),
        notifier,
        RunnerOptions { shell, observers },
    );

    for command in &initial {
        if let StartOutcome::Failed { error } = runner.start(command) {
            warn!(command = %command.name(), %error, "initial start failed");
        }
    }

    let mut coordinator = ShutdownCoordinator::new(runner.clone(), grace);
    coordinator.listen_for_signals();
    let (tx, lines) = mpsc::channel(32);
    spawn_stdin_listener(tx);
    let control = Arc::new(ControlContext::new(runner, commands, paths.config.clone()));
    tokio::spawn(control_loop(control, lines, coordinator.trigger()));
    info!(config = %paths.config.display(), "shellrack ready");
    println!("{CONTROL_HELP}");

    let reason = coordinator.wait().await;
    coordinator.shutdown(reason).await;
    Ok(())
}

/// Resolves every requested name up front so a typo starts nothing.
fn resolve_commands(
    commands: &[Arc<Command>],
    names: &[String],
) -> Result<Vec<Arc<Command>>, ShellrackError> {
    names
        .iter()
        .map(|name| find_command(commands, name).cloned())
        .collect()
}

fn spawn_event_printer(mut events: mpsc::UnboundedReceiver<events::LifecycleEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{event}");
        }
    });
}

/// Reads stdin on a plain thread so a pending read never holds up runtime
/// shutdown.
fn spawn_stdin_listener(tx: mpsc::Sender<String>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
}

/// State shared by the control loop and the control tasks it spawns.
struct ControlContext {
    runner: CommandRunner,
    commands: Mutex<Vec<Arc<Command>>>,
    config_path: PathBuf,
}

impl ControlContext {
    fn new(runner: CommandRunner, commands: Vec<Arc<Command>>, config_path: PathBuf) -> Self {
        Self {
            runner,
            commands: Mutex::new(commands),
            config_path,
        }
    }

    fn commands(&self) -> Vec<Arc<Command>> {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn find(&self, key: &str) -> Result<Arc<Command>, ShellrackError> {
        find_command(&self.commands(), key).cloned()
    }

    /// Re-reads the command list from the config file. Refused while any
    /// command is running, since live processes belong to the current list.
    fn reload(&self) -> Result<usize> {
        if self.runner.is_any_running() {
            bail!("stop all commands before reloading the configuration");
        }
        let commands = load_commands(&self.config_path)?;
        let count = commands.len();
        *self.commands.lock().unwrap_or_else(PoisonError::into_inner) = commands;
        info!(count, config = %self.config_path.display(), "configuration reloaded");
        Ok(count)
    }
}

async fn control_loop(
    ctx: Arc<ControlContext>,
    mut lines: mpsc::Receiver<String>,
    trigger: ShutdownTrigger,
) {
    while let Some(line) = lines.recv().await {
        let control = match parse_control(&line) {
            Ok(Some(control)) => control,
            Ok(None) => continue,
            Err(err) => {
                println!("{err:#}");
                continue;
            }
        };
        match control {
            ControlCommand::Quit => {
                trigger.request(ShutdownReason::Requested);
                break;
            }
            control if control.may_block() => {
                let ctx = ctx.clone();
                tokio::spawn(async move { report(execute(&ctx, control).await) });
            }
            control => report(execute(&ctx, control).await),
        }
    }
    debug!("control loop finished");
}

fn report(result: Result<()>) {
    if let Err(err) = result {
        println!("{err:#}");
    }
}

/// A line typed on the control surface.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ControlCommand {
    Toggle(String),
    Start(String),
    Stop(String),
    Status,
    Input { name: String, text: String },
    StopAll,
    Reload,
    Help,
    Quit,
}

impl ControlCommand {
    /// Controls that wait on a process and so run on their own task.
    fn may_block(&self) -> bool {
        matches!(
            self,
            ControlCommand::Toggle(_)
                | ControlCommand::Stop(_)
                | ControlCommand::StopAll
                | ControlCommand::Input { .. }
        )
    }
}

fn parse_control(line: &str) -> Result<Option<ControlCommand>> {
    if let Some(rest) = line.trim_start().strip_prefix("input") {
        if rest.is_empty() || rest.starts_with(char::is_whitespace) {
            let (name, text) = split_input(rest).context("usage: input <name> <text>")?;
            return Ok(Some(ControlCommand::Input { name, text }));
        }
    }

    let words = shell_words::split(line).context("could not parse command")?;
    let Some((verb, args)) = words.split_first() else {
        return Ok(None);
    };
    let control = match (verb.as_str(), args) {
        ("toggle" | "t", [name]) => ControlCommand::Toggle(name.clone()),
        ("start", [name]) => ControlCommand::Start(name.clone()),
        ("stop", [name]) => ControlCommand::Stop(name.clone()),
        ("status" | "ls", []) => ControlCommand::Status,
        ("stopall", []) => ControlCommand::StopAll,
        ("reload", []) => ControlCommand::Reload,
        ("help" | "?", []) => ControlCommand::Help,
        ("quit" | "exit" | "q", []) => ControlCommand::Quit,
        (verb, _) => bail!("unknown or incomplete command: {verb} (try `help`)"),
    };
    Ok(Some(control))
}

/// Splits `<name> <text>`. The name may be quoted; the text is kept as typed.
fn split_input(rest: &str) -> Option<(String, String)> {
    let rest = rest.trim_start();
    for (idx, ch) in rest.char_indices() {
        if !ch.is_whitespace() {
            continue;
        }
        let Ok(words) = shell_words::split(&rest[..idx]) else {
            continue;
        };
        if let [name] = words.as_slice() {
            let text = rest[idx..].trim_start();
            if text.is_empty() {
                return None;
            }
            return Some((name.clone(), text.to_string()));
        }
    }
    None
}

async fn execute(ctx: &ControlContext, control: ControlCommand) -> Result<()> {
    let runner = &ctx.runner;
    match control {
        ControlCommand::Toggle(name) => runner.toggle(&ctx.find(&name)?).await,
        ControlCommand::Start(name) => {
            let command = ctx.find(&name)?;
            if runner.start(&command) == StartOutcome::AlreadyRunning {
                println!("{} is already running", command.name());
            }
        }
        ControlCommand::Stop(name) => {
            let command = ctx.find(&name)?;
            if !runner.terminate(&command).await {
                println!("{} is not running", command.name());
            }
        }
        ControlCommand::Status => {
            for command in ctx.commands() {
                println!("{}", status_line(runner, &command));
            }
        }
        ControlCommand::Input { name, text } => {
            let command = ctx.find(&name)?;
            if !runner.send_input(&command, &text).await? {
                println!("{} is not running", command.name());
            }
        }
        ControlCommand::StopAll => {
            let stopped = runner.terminate_all().await;
            println!("stopped {stopped} command(s)");
        }
        ControlCommand::Reload => {
            let count = ctx.reload()?;
            println!("loaded {count} command(s)");
        }
        ControlCommand::Help => println!("{CONTROL_HELP}"),
        ControlCommand::Quit => {}
    }
    Ok(())
}

fn status_line(runner: &CommandRunner, command: &Command) -> String {
    let state = command.snapshot();
    let mut status = state.status.to_string();
    if state.cancelled {
        status.push_str(" (stopping)");
    }
    if state.status == CommandStatus::Running {
        if let Some(pid) = runner.pid_of(command.id()) {
            status.push_str(&format!(" pid {pid}"));
        }
    }
    format!("{:<24} {}", command.name(), status)
}

/// Looks a command up by exact name, then by id.
fn find_command<'a>(
    commands: &'a [Arc<Command>],
    key: &str,
) -> Result<&'a Arc<Command>, ShellrackError> {
    commands
        .iter()
        .find(|command| command.name() == key)
        .or_else(|| commands.iter().find(|command| command.id().as_str() == key))
        .ok_or_else(|| ShellrackError::UnknownCommand(key.to_string()))
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}
