//! Structured logging / audit subsystem (spec §4.5).
//!
//! A process-wide logger set once at startup from `main.rs`, grounded on
//! a single-mutex-appended log file convention and its
//! `tracing`/`tracing-subscriber` console stack. Calls made before
//! `init()` (e.g. from a component constructed directly in a unit test)
//! are silently dropped rather than panicking, per the "guard `NULL`
//! logger calls" design note.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::store::types::{AuditEntry, LogEntry, LogLevel};
use crate::store::Store;

const ROTATE_SIZE_BYTES: u64 = 100 * 1024 * 1024;
const RETENTION_DAYS: i64 = 7;

static LOGGER: OnceLock<Logger> = OnceLock::new();

pub struct Logger {
    log_dir: PathBuf,
    log_file: Mutex<std::fs::File>,
    audit_file: Mutex<std::fs::File>,
    store: Store,
    console_logging_enabled: bool,
}

impl Logger {
    pub fn open(log_dir: &Path, store: Store, console_logging_enabled: bool) -> anyhow::Result<Self> {
        std::fs::create_dir_all(log_dir)?;
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join("agentainer.log"))?;
        let audit_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join("audit.log"))?;

        Ok(Self {
            log_dir: log_dir.to_path_buf(),
            log_file: Mutex::new(log_file),
            audit_file: Mutex::new(audit_file),
            store,
            console_logging_enabled,
        })
    }

    fn mirror_to_console(&self, level: LogLevel, component: &str, message: &str) {
        if !self.console_logging_enabled {
            return;
        }
        match level {
            LogLevel::Debug => debug!(component, "{}", message),
            LogLevel::Info => info!(component, "{}", message),
            LogLevel::Warn => warn!(component, "{}", message),
            LogLevel::Error | LogLevel::Fatal => error!(component, "{}", message),
        }
    }
}

/// Install the process-wide logger. Must be called at most once.
pub fn init(logger: Logger) {
    let _ = LOGGER.set(logger);
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Append a log entry to file, Redis, and (if enabled) the console.
/// `FATAL` terminates the process once the record is durably written.
pub async fn log(
    level: LogLevel,
    component: &str,
    message: &str,
    agent_id: Option<String>,
    details: Option<serde_json::Value>,
) {
    let Some(logger) = LOGGER.get() else { return };

    let entry = LogEntry {
        timestamp: now_unix(),
        level,
        component: component.to_string(),
        message: message.to_string(),
        agent_id,
        details,
    };

    logger.mirror_to_console(level, component, message);
    write_line(&logger.log_file, &entry);

    if let Err(e) = logger.store.append_log(&entry).await {
        warn!(error = %e, "failed to index log entry in Redis");
    }

    if matches!(level, LogLevel::Fatal) {
        error!("fatal error recorded, terminating process");
        std::process::exit(1);
    }
}

/// Append an audit entry to file, Redis, and the console.
pub async fn audit(user_id: &str, action: &str, resource: &str, resource_id: &str, result: &str) {
    let Some(logger) = LOGGER.get() else { return };

    let entry = AuditEntry {
        timestamp: now_unix(),
        user_id: user_id.to_string(),
        action: action.to_string(),
        resource: resource.to_string(),
        resource_id: resource_id.to_string(),
        result: result.to_string(),
    };

    if logger.console_logging_enabled {
        info!(user_id, action, resource, resource_id, result, "audit");
    }

    write_line(&logger.audit_file, &entry);

    if let Err(e) = logger.store.append_audit(&entry).await {
        warn!(error = %e, "failed to index audit entry in Redis");
    }
}

fn write_line<T: serde::Serialize>(file: &Mutex<std::fs::File>, entry: &T) {
    let Ok(mut line) = serde_json::to_string(entry) else {
        return;
    };
    line.push('\n');
    let mut file = file.lock();
    let _ = file.write_all(line.as_bytes());
}

/// Rotates `agentainer.log`/`audit.log` once per hour if they exceed
/// `ROTATE_SIZE_BYTES`, and deletes rotated copies older than 7 days.
/// Runs until `cancel` fires.
pub async fn spawn_rotation_task(cancel: tokio_util::sync::CancellationToken) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let Some(logger) = LOGGER.get() else { continue };
                rotate_if_needed(&logger.log_dir, "agentainer.log", &logger.log_file);
                rotate_if_needed(&logger.log_dir, "audit.log", &logger.audit_file);
                purge_old_rotations(&logger.log_dir);
            }
            _ = cancel.cancelled() => break,
        }
    }
}

fn rotate_if_needed(log_dir: &Path, file_name: &str, file: &Mutex<std::fs::File>) {
    let path = log_dir.join(file_name);
    let Ok(metadata) = std::fs::metadata(&path) else {
        return;
    };
    if metadata.len() <= ROTATE_SIZE_BYTES {
        return;
    }

    let suffix = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let rotated_path = log_dir.join(format!("{file_name}.{suffix}"));

    let mut guard = file.lock();
    if std::fs::rename(&path, &rotated_path).is_err() {
        return;
    }
    if let Ok(fresh) = OpenOptions::new().create(true).append(true).open(&path) {
        *guard = fresh;
        info!(file = file_name, "rotated log file");
    }
}

fn purge_old_rotations(log_dir: &Path) {
    let cutoff = chrono::Utc::now() - chrono::Duration::days(RETENTION_DAYS);
    let Ok(entries) = std::fs::read_dir(log_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.contains('.') || (!name.starts_with("agentainer.log.") && !name.starts_with("audit.log.")) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else { continue };
        let Ok(modified) = metadata.modified() else { continue };
        let modified: chrono::DateTime<chrono::Utc> = modified.into();
        if modified < cutoff {
            let _ = std::fs::remove_file(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purge_skips_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("agentainer.log"), b"x").unwrap();
        purge_old_rotations(dir.path());
        assert!(dir.path().join("agentainer.log").exists());
    }
}
