use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown ingest store '{0}' (expected memory, jsonl or postgres)")]
    UnknownStore(String),
}
