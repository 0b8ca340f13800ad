use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_usize(profile: &str, key: &str, default: usize) -> usize {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub storage: StorageConfig,
    pub ingest: IngestConfig,
    pub postgres: PostgresConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `CHESS_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let profile = env_or("CHESS_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Result<Self, ConfigError> {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Ok(Self {
            profile: p.to_string(),
            storage: StorageConfig::from_env_profiled(p),
            ingest: IngestConfig::from_env_profiled(p)?,
            postgres: PostgresConfig::from_env_profiled(p),
        })
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  storage:     data_dir={}", self.storage.data_dir.display());
        tracing::info!(
            "  ingest:      store={}, reports={}, delay={}..{}ms, max_concurrent={}",
            self.ingest.store.as_str(),
            self.ingest.report_prefix,
            self.ingest.delay_min_ms,
            self.ingest.delay_max_ms,
            self.ingest.max_concurrent
        );
        tracing::info!("  postgres:    host={}, db={}", self.postgres.host, self.postgres.database);
    }
}

// ── Storage ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl StorageConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            data_dir: PathBuf::from(profiled_env_or(p, "DATA_DIR", "data")),
        }
    }
}

// ── Ingest ────────────────────────────────────────────────────

/// Which persistence backend holds ingest runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Jsonl,
    Postgres,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "jsonl" | "file" => Ok(Self::Jsonl),
            "postgres" | "pg" => Ok(Self::Postgres),
            "memory" | "" => Ok(Self::Memory),
            _ => Err(ConfigError::UnknownStore(value.to_string())),
        }
    }
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Jsonl => "jsonl",
            Self::Postgres => "postgres",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub store: StoreBackend,
    /// Prefix for report URIs produced by the simulated executor.
    pub report_prefix: String,
    /// Simulated processing latency bounds, `[min, max)` milliseconds.
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
    /// Upper bound on runs executing at the same time (at least 1).
    pub max_concurrent: usize,
}

impl IngestConfig {
    fn from_env_profiled(p: &str) -> Result<Self, ConfigError> {
        let delay_min_ms = profiled_env_u64(p, "INGEST_DELAY_MIN_MS", 50);
        let delay_max_ms = profiled_env_u64(p, "INGEST_DELAY_MAX_MS", 150).max(delay_min_ms);
        Ok(Self {
            store: profiled_env_or(p, "INGEST_STORE", "memory").parse()?,
            report_prefix: profiled_env_or(p, "INGEST_REPORT_PREFIX", "s3://reports/ingest"),
            delay_min_ms,
            delay_max_ms,
            max_concurrent: profiled_env_usize(p, "INGEST_MAX_CONCURRENT", 4).max(1),
        })
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "PG_HOST", "localhost"),
            port: profiled_env_u16(p, "PG_PORT", 5432),
            database: profiled_env_or(p, "PG_DATABASE", "chessapp"),
            username: profiled_env_opt(p, "PG_USERNAME"),
            password: profiled_env_opt(p, "PG_PASSWORD"),
            ssl_mode: profiled_env_or(p, "PG_SSL_MODE", "prefer"),
            max_connections: profiled_env_u32(p, "PG_MAX_CONNECTIONS", 10),
        }
    }

    pub fn connection_string(&self) -> String {
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            user, pass, self.host, self.port, self.database, self.ssl_mode
        )
    }

    pub fn is_configured(&self) -> bool {
        self.username.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own profile prefix so parallel tests never share keys.

    #[test]
    fn test_profiled_keys_take_precedence() {
        env::set_var("CFGTESTA_PG_HOST", "db.internal");
        env::set_var("CFGTESTA_INGEST_STORE", "jsonl");
        let config = Config::for_profile("cfgtesta").unwrap();
        assert_eq!(config.profile, "CFGTESTA");
        assert_eq!(config.postgres.host, "db.internal");
        assert_eq!(config.ingest.store, StoreBackend::Jsonl);
    }

    #[test]
    fn test_delay_bounds_never_inverted() {
        env::set_var("CFGTESTB_INGEST_DELAY_MIN_MS", "200");
        env::set_var("CFGTESTB_INGEST_DELAY_MAX_MS", "100");
        let config = Config::for_profile("CFGTESTB").unwrap();
        assert_eq!(config.ingest.delay_min_ms, 200);
        assert_eq!(config.ingest.delay_max_ms, 200);
    }

    #[test]
    fn test_store_backend_parse() {
        assert_eq!("Postgres".parse::<StoreBackend>(), Ok(StoreBackend::Postgres));
        assert_eq!("pg".parse::<StoreBackend>(), Ok(StoreBackend::Postgres));
        assert_eq!(" file ".parse::<StoreBackend>(), Ok(StoreBackend::Jsonl));
        assert_eq!("".parse::<StoreBackend>(), Ok(StoreBackend::Memory));
        assert_eq!(
            "postgress".parse::<StoreBackend>(),
            Err(ConfigError::UnknownStore("postgress".to_string()))
        );
    }

    #[test]
    fn test_unknown_store_fails_config() {
        env::set_var("CFGTESTD_INGEST_STORE", "redis");
        let err = Config::for_profile("CFGTESTD").unwrap_err();
        assert_eq!(err, ConfigError::UnknownStore("redis".to_string()));
        assert!(err.to_string().contains("redis"));
    }

    #[test]
    fn test_max_concurrent_defaults_and_floor() {
        let config = Config::for_profile("CFGTESTE").unwrap();
        assert_eq!(config.ingest.max_concurrent, 4);

        env::set_var("CFGTESTF_INGEST_MAX_CONCURRENT", "0");
        let config = Config::for_profile("CFGTESTF").unwrap();
        assert_eq!(config.ingest.max_concurrent, 1);
    }

    #[test]
    fn test_connection_string_defaults() {
        let pg = PostgresConfig {
            host: "localhost".to_string(),
            port: 5432,
            database: "chessapp".to_string(),
            username: None,
            password: None,
            ssl_mode: "prefer".to_string(),
            max_connections: 10,
        };
        assert_eq!(
            pg.connection_string(),
            "postgres://postgres:@localhost:5432/chessapp?sslmode=prefer"
        );
        assert!(!pg.is_configured());
    }
}
