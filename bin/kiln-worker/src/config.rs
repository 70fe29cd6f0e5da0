//! Worker host configuration, loaded from environment variables at startup.

/// Runtime configuration for kiln-worker.
///
/// Every field has a sensible default so the worker runs out-of-the-box
/// without any environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite (or other sqlx-compatible) database URL
    /// (default: `"sqlite://kiln.db"`).
    pub database_url: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,sqlx=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Capacity of each per-kind job queue.
    pub queue_capacity: usize,

    /// Worker tasks spawned per content kind.
    pub workers_per_kind: usize,

    /// Hours a terminal job stays queryable before the reconciler purges it.
    pub retention_hours: u64,

    /// Seconds between reconciliation passes.
    pub reconcile_interval_secs: u64,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            database_url: env_or("KILN_DATABASE_URL", "sqlite://kiln.db"),
            log_level: env_or("KILN_LOG", "info"),
            log_json: std::env::var("KILN_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            queue_capacity: parse_env("KILN_QUEUE_CAPACITY", 64),
            workers_per_kind: parse_env("KILN_WORKERS_PER_KIND", 4),
            retention_hours: parse_env("KILN_RETENTION_HOURS", 24),
            reconcile_interval_secs: parse_env("KILN_RECONCILE_INTERVAL_SECS", 60),
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
