//! `taskcache`: offline-first task list on the command line.
//!
//! Each run restores the local cache, merges a fresh server snapshot, applies
//! one command, waits for the resulting server calls, and prints the result.
//! The "server" is a file-backed loopback store, or nothing at all with
//! `--offline`.
//!
//! ```bash
//! taskcache add "Eggs" --list Personal
//! taskcache list
//! taskcache --offline toggle local_1700000000000
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

use taskcache::cache::{FileSlot, Store, StoreEvent, TaskError};
use taskcache::config::{CacheConfig, CliArgs, Command, ConfigError, SubtaskCommand};
use taskcache::lists::ListRegistry;
use taskcache::session::SessionState;
use taskcache::sync::{LoopbackApi, OfflineApi, RefreshOutcome, SyncError, Synchronizer, TaskApi};
use taskcache_proto::task::{Task, TaskId};

/// Errors that end a CLI run.
#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("no task matches {0}")]
    UnknownId(String),
    #[error("{0} matches more than one task")]
    AmbiguousId(String),
    #[error("no list to add the task to")]
    NoList,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging.
///
/// With a log file, entries go through a non-blocking appender and the
/// returned [`WorkerGuard`] must be held until shutdown to flush them.
/// Otherwise they go to stderr so stdout stays clean for command output.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let Some(log_path) = file_path else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(env_filter)
            .init();
        return None;
    };

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;
    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(cli: CliArgs) -> Result<(), CliError> {
    let config = CacheConfig::load(&cli)?;
    let command = cli.command.unwrap_or(Command::List { list: None });
    tracing::debug!(storage = %config.storage_dir.display(), offline = config.offline, "taskcache starting");

    let store = Store::open(FileSlot::new(&config.storage_dir));
    if config.offline {
        return execute(store, OfflineApi, &config, command).await;
    }
    match LoopbackApi::open(Arc::new(FileSlot::new(&config.remote_dir))) {
        Ok(api) => execute(store, api, &config, command).await,
        Err(err) => {
            tracing::warn!(error = %err, "server data unavailable, working offline");
            execute(store, OfflineApi, &config, command).await
        }
    }
}

async fn execute<A: TaskApi + 'static>(
    store: Store<FileSlot>,
    api: A,
    config: &CacheConfig,
    command: Command,
) -> Result<(), CliError> {
    let sync = Synchronizer::new(store, api, config.sync_options())?;
    if sync.refresh().await == RefreshOutcome::Offline {
        eprintln!("(offline: showing cached tasks)");
    }

    let mut events = sync.subscribe();
    let mut session = SessionState::default();
    let result = apply(&sync, &mut session, command);
    sync.settle().await;
    if !result? {
        return Ok(());
    }

    // Keep the open task open across provisional-to-canonical re-keying.
    while let Ok(event) = events.try_recv() {
        if let StoreEvent::Replaced { from, to } = event {
            session.rekey(&from, &to);
        }
    }

    match &session.current_task {
        Some(id) => {
            if let Some(task) = sync.get(id) {
                print_task(&task);
            }
        }
        None => {
            for task in sync.tasks(session.current_list.as_deref()) {
                print_task(&task);
            }
        }
    }
    Ok(())
}

/// Runs one command. Returns `true` if the session view should be printed.
fn apply<A: TaskApi + 'static>(
    sync: &Synchronizer<FileSlot, A>,
    session: &mut SessionState,
    command: Command,
) -> Result<bool, CliError> {
    match command {
        Command::List { list } => {
            if let Some(list) = list {
                session.select_list(list);
            }
        }
        Command::Add { title, list } => {
            if let Some(list) = list {
                session.select_list(list);
            }
            let lists = ListRegistry::new(sync.lists());
            let list = session.target_list(&lists).ok_or(CliError::NoList)?.to_string();
            let id = sync.add_task(&title, &list)?;
            session.open_task(id);
        }
        Command::Toggle { id } => {
            let id = find_task(sync, &id)?;
            sync.toggle_task(&id)?;
            session.open_task(id);
        }
        Command::Move { id, list } => {
            let id = find_task(sync, &id)?;
            sync.move_task(&id, &list)?;
            session.open_task(id);
        }
        Command::Rename { id, title } => {
            let id = find_task(sync, &id)?;
            sync.rename_task(&id, &title)?;
            session.open_task(id);
        }
        Command::Notes { id, text } => {
            let id = find_task(sync, &id)?;
            sync.set_notes(&id, &text)?;
            session.open_task(id);
        }
        Command::Delete { id } => {
            let id = find_task(sync, &id)?;
            let task = sync.delete_task(&id)?;
            println!("deleted {}", task.title);
            return Ok(false);
        }
        Command::Subtask(action) => apply_subtask(sync, session, action)?,
        Command::Lists => {
            for name in sync.lists() {
                let count = sync.tasks(Some(&name)).len();
                println!("{name} ({count})");
            }
            return Ok(false);
        }
        Command::Sync => {
            let sent = sync.push_pending();
            println!("sent {sent} pending task(s)");
        }
    }
    Ok(true)
}

fn apply_subtask<A: TaskApi + 'static>(
    sync: &Synchronizer<FileSlot, A>,
    session: &mut SessionState,
    action: SubtaskCommand,
) -> Result<(), CliError> {
    let (task, result) = match action {
        SubtaskCommand::Add { task, title } => {
            let task = find_task(sync, &task)?;
            let result = sync.add_subtask(&task, &title).map(drop);
            (task, result)
        }
        SubtaskCommand::Toggle { task, subtask } => {
            let task = find_task(sync, &task)?;
            let subtask = find_subtask(sync, &task, &subtask)?;
            (task.clone(), sync.toggle_subtask(&task, &subtask).map(drop))
        }
        SubtaskCommand::Remove { task, subtask } => {
            let task = find_task(sync, &task)?;
            let subtask = find_subtask(sync, &task, &subtask)?;
            (task.clone(), sync.remove_subtask(&task, &subtask))
        }
    };
    result?;
    session.open_task(task);
    Ok(())
}

/// Finds a task by exact id or unique id prefix.
fn find_task<A: TaskApi + 'static>(
    sync: &Synchronizer<FileSlot, A>,
    input: &str,
) -> Result<TaskId, CliError> {
    let id = TaskId::new(input);
    if sync.get(&id).is_some() {
        return Ok(id);
    }
    unique_prefix(sync.tasks(None).iter().map(|t| &t.id), input)
}

fn find_subtask<A: TaskApi + 'static>(
    sync: &Synchronizer<FileSlot, A>,
    task: &TaskId,
    input: &str,
) -> Result<TaskId, CliError> {
    let task = sync
        .get(task)
        .ok_or_else(|| CliError::UnknownId(task.to_string()))?;
    if let Some(subtask) = task.subtasks.iter().find(|s| s.id.as_str() == input) {
        return Ok(subtask.id.clone());
    }
    unique_prefix(task.subtasks.iter().map(|s| &s.id), input)
}

fn unique_prefix<'a>(
    ids: impl Iterator<Item = &'a TaskId>,
    input: &str,
) -> Result<TaskId, CliError> {
    let mut matches = ids.filter(|id| id.as_str().starts_with(input));
    let first = matches
        .next()
        .ok_or_else(|| CliError::UnknownId(input.to_string()))?;
    if matches.next().is_some() {
        return Err(CliError::AmbiguousId(input.to_string()));
    }
    Ok(first.clone())
}

fn print_task(task: &Task) {
    let mark = if task.completed { "x" } else { " " };
    println!("[{mark}] {}  {}  ({})", task.id, task.title, task.list);
    if !task.notes.is_empty() {
        println!("      {}", task.notes);
    }
    for subtask in &task.subtasks {
        let mark = if subtask.completed { "x" } else { " " };
        println!("    [{mark}] {}  {}", subtask.id, subtask.title);
    }
}
