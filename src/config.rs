use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub db_max_connections: u32,
    pub name_match_threshold: f64,
    pub merge_lock_timeout_ms: u64,
    pub merge_event_buffer: usize,
    pub run_migrations: bool,
    pub metrics_enabled: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")?;
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        let db_max_connections = env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(10);
        let name_match_threshold = env::var("NAME_MATCH_THRESHOLD")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.3);
        let merge_lock_timeout_ms = env::var("MERGE_LOCK_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(5000);
        let merge_event_buffer = env::var("MERGE_EVENT_BUFFER")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(256);
        let run_migrations = env::var("RUN_MIGRATIONS")
            .map(|s| matches!(s.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let metrics_enabled = env::var("METRICS_ENABLED")
            .map(|s| !matches!(s.trim(), "0" | "false" | "no"))
            .unwrap_or(true);

        if !(0.0..=1.0).contains(&name_match_threshold) {
            anyhow::bail!("NAME_MATCH_THRESHOLD must be within 0..=1, got {name_match_threshold}");
        }

        Ok(Self {
            database_url,
            bind_addr,
            db_max_connections,
            name_match_threshold,
            merge_lock_timeout_ms,
            merge_event_buffer,
            run_migrations,
            metrics_enabled,
        })
    }
}
