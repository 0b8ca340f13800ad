pub mod config;
pub mod error;

pub use config::{load_dotenv, Config, IngestConfig, PostgresConfig, StorageConfig, StoreBackend};
pub use error::ConfigError;
