use anyhow::{Context, Result};
use clap::Parser;
use std::env;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub db_max_connections: u32,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Container registry blob upload finalizer")]
pub struct Args {
    /// Host to bind to (overrides BLOB_REGISTRY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides BLOB_REGISTRY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where blob payloads are stored (overrides BLOB_REGISTRY_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides BLOB_REGISTRY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// SQLite pool size (overrides BLOB_REGISTRY_DB_MAX_CONNECTIONS)
    #[arg(long)]
    pub db_max_connections: Option<u32>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    /// Apply CLI overrides on top of the environment, then defaults.
    pub fn merge(args: Args) -> Result<Self> {
        Ok(Self {
            host: args
                .host
                .unwrap_or_else(|| env_or("BLOB_REGISTRY_HOST", "0.0.0.0")),
            port: match args.port {
                Some(port) => port,
                None => parse_env("BLOB_REGISTRY_PORT", 5000)?,
            },
            storage_dir: args
                .storage_dir
                .unwrap_or_else(|| env_or("BLOB_REGISTRY_STORAGE_DIR", "./data/blobs")),
            database_url: args.database_url.unwrap_or_else(|| {
                env_or("BLOB_REGISTRY_DATABASE_URL", "sqlite://./data/meta/registry.db")
            }),
            db_max_connections: match args.db_max_connections {
                Some(n) => n,
                None => parse_env("BLOB_REGISTRY_DB_MAX_CONNECTIONS", 1)?,
            },
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.into())
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_arguments_override_defaults() {
        let args = Args::parse_from([
            "blob-registry",
            "--port",
            "6000",
            "--storage-dir",
            "/tmp/blobs",
            "--db-max-connections",
            "4",
        ]);
        let cfg = AppConfig::merge(args).unwrap();
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.storage_dir, "/tmp/blobs");
        assert_eq!(cfg.db_max_connections, 4);
        assert!(cfg.addr().ends_with(":6000"));
    }

    #[test]
    fn migrate_flag_is_parsed() {
        let args = Args::parse_from(["blob-registry", "--migrate"]);
        assert!(args.migrate);
    }
}
