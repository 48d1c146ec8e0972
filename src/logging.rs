//! Logging infrastructure for mcphub
//!
//! Logs to ~/.mcphub/logs/ (one file per day). Nothing is ever written to
//! stdout: in stdio mode that stream carries protocol frames.
//!
//! Each tokio task (or thread, outside a runtime) carries its own context
//! so lines from concurrent agent sessions can be told apart.

use chrono::Local;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

static LOGGER: Mutex<Option<Logger>> = Mutex::new(None);
static TRACE: AtomicBool = AtomicBool::new(false);
static TASK_LOG_CONTEXTS: OnceLock<Mutex<HashMap<String, LogContext>>> = OnceLock::new();

/// Per-task logging context
#[derive(Debug, Default, Clone)]
pub struct LogContext {
    pub server: Option<String>,
    pub session: Option<String>,
    pub backend: Option<String>,
}

thread_local! {
    static LOG_CONTEXT: RefCell<LogContext> = RefCell::new(LogContext::default());
}

fn current_task_id() -> Option<String> {
    tokio::task::try_id().map(|id| id.to_string())
}

fn update_context(update: impl FnOnce(&mut LogContext)) {
    if let Some(task_id) = current_task_id() {
        let store = TASK_LOG_CONTEXTS.get_or_init(|| Mutex::new(HashMap::new()));
        if let Ok(mut contexts) = store.lock() {
            update(contexts.entry(task_id).or_default());
            return;
        }
    }
    LOG_CONTEXT.with(|c| update(&mut c.borrow_mut()));
}

fn context_snapshot() -> LogContext {
    if let Some(task_id) = current_task_id() {
        if let Some(store) = TASK_LOG_CONTEXTS.get() {
            if let Ok(contexts) = store.lock() {
                if let Some(ctx) = contexts.get(&task_id) {
                    return ctx.clone();
                }
            }
        }
    }
    LOG_CONTEXT.with(|c| c.borrow().clone())
}

/// Tag subsequent lines from this task with the serving hub's name
pub fn set_server(server: &str) {
    update_context(|ctx| ctx.server = Some(server.to_string()));
}

/// Tag subsequent lines from this task with an agent session id
pub fn set_session(session: &str) {
    update_context(|ctx| ctx.session = Some(session.to_string()));
}

/// Tag subsequent lines from this task with a backend server name
pub fn set_backend(backend: &str) {
    update_context(|ctx| ctx.backend = Some(backend.to_string()));
}

/// Drop the context of the current task. Connection loops call this on
/// exit so the task map does not grow with every reconnect.
pub fn clear_context() {
    if let Some(task_id) = current_task_id() {
        if let Some(store) = TASK_LOG_CONTEXTS.get() {
            if let Ok(mut contexts) = store.lock() {
                contexts.remove(&task_id);
            }
        }
    }
    LOG_CONTEXT.with(|c| *c.borrow_mut() = LogContext::default());
}

/// Number of live task contexts tagged with `backend`
#[cfg(test)]
pub(crate) fn tasks_tagged_with_backend(backend: &str) -> usize {
    TASK_LOG_CONTEXTS
        .get()
        .and_then(|store| {
            store.lock().ok().map(|contexts| {
                contexts
                    .values()
                    .filter(|ctx| ctx.backend.as_deref() == Some(backend))
                    .count()
            })
        })
        .unwrap_or(0)
}

fn context_prefix(ctx: &LogContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref server) = ctx.server {
        parts.push(format!("srv:{}", server));
    }
    if let Some(ref session) = ctx.session {
        parts.push(format!("ses:{}", truncate(session, 32)));
    }
    if let Some(ref backend) = ctx.backend {
        parts.push(format!("be:{}", backend));
    }

    if parts.is_empty() {
        String::new()
    } else {
        format!("[{}] ", parts.join("|"))
    }
}

pub struct Logger {
    file: File,
}

impl Logger {
    fn new() -> Option<Self> {
        let path = log_path()?;
        fs::create_dir_all(path.parent()?).ok()?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .ok()?;
        Some(Self { file })
    }

    fn write(&mut self, level: &str, message: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let ctx = context_prefix(&context_snapshot());
        let line = format!("[{}] [{}] {}{}\n", timestamp, level, ctx, message);
        let _ = self.file.write_all(line.as_bytes());
        let _ = self.file.flush();
    }
}

fn log_dir() -> Option<PathBuf> {
    crate::config::mcphub_dir().ok().map(|d| d.join("logs"))
}

/// Initialize the logger (call once at startup). Until this runs every
/// log call is a no-op, which keeps library users and tests silent.
pub fn init() {
    if let Ok(mut guard) = LOGGER.lock() {
        if guard.is_none() {
            *guard = Logger::new();
        }
    }
}

fn write(level: &str, message: &str) {
    if let Ok(mut guard) = LOGGER.lock() {
        if let Some(logger) = guard.as_mut() {
            logger.write(level, message);
        }
    }
}

pub fn info(message: &str) {
    write("INFO", message);
}

pub fn warn(message: &str) {
    write("WARN", message);
}

pub fn error(message: &str) {
    write("ERROR", message);
}

/// Log a debug message (only with MCPHUB_TRACE or `--trace`)
pub fn debug(message: &str) {
    if trace_enabled() {
        write("DEBUG", message);
    }
}

/// Force debug logging on (the `--trace` flag)
pub fn set_trace(enabled: bool) {
    TRACE.store(enabled, Ordering::Relaxed);
}

pub fn trace_enabled() -> bool {
    TRACE.load(Ordering::Relaxed) || std::env::var_os("MCPHUB_TRACE").is_some()
}

/// Log one protocol frame ("<-" inbound, "->" outbound)
pub fn rpc(direction: &str, method: &str, detail: &str) {
    if trace_enabled() {
        write(
            "RPC",
            &format!("{} {} {}", direction, method, truncate(detail, 300)),
        );
    }
}

/// Path of today's log file
pub fn log_path() -> Option<PathBuf> {
    let date = Local::now().format("%Y-%m-%d");
    Some(log_dir()?.join(format!("mcphub-{}.log", date)))
}

/// Remove log files older than 7 days
pub fn cleanup_old_logs() {
    let Some(dir) = log_dir() else {
        return;
    };
    let Ok(entries) = fs::read_dir(&dir) else {
        return;
    };
    let cutoff = Local::now() - chrono::Duration::days(7);
    for entry in entries.flatten() {
        let modified = entry.metadata().and_then(|m| m.modified());
        if let Ok(modified) = modified {
            let modified: chrono::DateTime<Local> = modified.into();
            if modified < cutoff {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
