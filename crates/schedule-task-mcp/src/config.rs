use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;
use tracing::warn;

use crate::time;

pub const ENV_DB_PATH: &str = "SCHEDULE_TASK_DB_PATH";
pub const ENV_TIMEZONE: &str = "SCHEDULE_TASK_TIMEZONE";
pub const ENV_SAMPLING_TIMEOUT: &str = "SCHEDULE_TASK_SAMPLING_TIMEOUT";

/// Default timeout in milliseconds for a sampling round-trip.
const DEFAULT_SAMPLING_TIMEOUT_MSEC: u64 = 180_000;

/// Process configuration, resolved once at startup from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Database file location. Always ends in a real extension; a `.json`
    /// value from the environment is rewritten to `.db`.
    pub db_path: PathBuf,
    /// Legacy free-form task file considered for one-shot import. Set when
    /// the environment pointed at a `.json` file; otherwise the import
    /// falls back to `tasks.json` alongside the database.
    pub legacy_path: Option<PathBuf>,
    /// Zone used for `*_local` presentation fields and cron evaluation.
    pub timezone: Tz,
    /// Deadline for one sampling round-trip to the client.
    pub sampling_timeout: Duration,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let (db_path, legacy_path) = match std::env::var(ENV_DB_PATH) {
            Ok(raw) => {
                let raw = PathBuf::from(raw);
                let legacy = raw
                    .extension()
                    .is_some_and(|ext| ext == "json")
                    .then(|| raw.clone());
                (normalize_db_path(raw), legacy)
            }
            Err(_) => (default_db_path(), None),
        };

        let timezone = time::resolve_zone(std::env::var(ENV_TIMEZONE).ok().as_deref());

        let sampling_timeout = std::env::var(ENV_SAMPLING_TIMEOUT)
            .ok()
            .and_then(|raw| match raw.parse::<u64>() {
                Ok(ms) if ms > 0 => Some(Duration::from_millis(ms)),
                _ => {
                    warn!(
                        "ignoring invalid {ENV_SAMPLING_TIMEOUT}={raw:?}; \
                         expected a positive integer of milliseconds"
                    );
                    None
                }
            })
            .unwrap_or(Duration::from_millis(DEFAULT_SAMPLING_TIMEOUT_MSEC));

        Self {
            db_path,
            legacy_path,
            timezone,
            sampling_timeout,
        }
    }

    /// The legacy file to probe for import: the configured `.json` path if
    /// the environment supplied one, else `tasks.json` next to the database.
    pub fn legacy_import_path(&self) -> PathBuf {
        self.legacy_path
            .clone()
            .unwrap_or_else(|| self.db_path.with_file_name("tasks.json"))
    }
}

fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".schedule-task-mcp")
        .join("tasks.db")
}

/// `.json` paths are rewritten to `.db`; extensionless paths gain `.db`;
/// anything else is taken as-is.
fn normalize_db_path(path: PathBuf) -> PathBuf {
    match path.extension() {
        Some(ext) if ext == "json" => path.with_extension("db"),
        Some(_) => path,
        None => path.with_extension("db"),
    }
}
