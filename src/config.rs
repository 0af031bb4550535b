use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

use crate::services::retry::RetryPolicy;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub max_body_bytes: usize,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub lock_timeout_ms: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "File storage API")]
pub struct Args {
    /// Host to bind to (overrides FILE_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILE_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where file payloads are stored (overrides FILE_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL for the metadata index (overrides FILE_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Largest accepted request body in bytes (overrides FILE_STORE_MAX_BODY_BYTES)
    #[arg(long)]
    pub max_body_bytes: Option<usize>,

    /// Attempts per store call before giving up (overrides FILE_STORE_RETRY_ATTEMPTS)
    #[arg(long)]
    pub retry_attempts: Option<u32>,

    /// First retry delay in milliseconds, doubled per attempt (overrides FILE_STORE_RETRY_BACKOFF_MS)
    #[arg(long)]
    pub retry_backoff_ms: Option<u64>,

    /// Longest wait for a per-file lock in milliseconds (overrides FILE_STORE_LOCK_TIMEOUT_MS)
    #[arg(long)]
    pub lock_timeout_ms: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Delete blobs no record refers to during startup reconciliation
    #[arg(long)]
    pub remove_orphans: bool,
}

/// Flags that select a startup mode rather than configure the server.
#[derive(Debug, Clone, Copy, Default)]
pub struct StartupFlags {
    pub migrate: bool,
    pub remove_orphans: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and startup flags.
    pub fn from_env_and_args() -> Result<(Self, StartupFlags)> {
        Self::merge(Args::parse(), |name| env::var(name))
    }

    /// Merge parsed args over values from `lookup`, falling back to defaults.
    fn merge<F>(args: Args, lookup: F) -> Result<(Self, StartupFlags)>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let env_or = |name: &str, default: &str| lookup(name).unwrap_or_else(|_| default.into());

        let cfg = Self {
            host: args
                .host
                .unwrap_or_else(|| env_or("FILE_STORE_HOST", "0.0.0.0")),
            port: pick(args.port, &lookup, "FILE_STORE_PORT", 3000)?,
            storage_dir: args
                .storage_dir
                .unwrap_or_else(|| env_or("FILE_STORE_STORAGE_DIR", "./data/files")),
            database_url: args.database_url.unwrap_or_else(|| {
                env_or(
                    "FILE_STORE_DATABASE_URL",
                    "sqlite://./data/meta/file_store.db",
                )
            }),
            max_body_bytes: pick(
                args.max_body_bytes,
                &lookup,
                "FILE_STORE_MAX_BODY_BYTES",
                64 * 1024 * 1024,
            )?,
            retry_attempts: pick(args.retry_attempts, &lookup, "FILE_STORE_RETRY_ATTEMPTS", 3)?,
            retry_backoff_ms: pick(
                args.retry_backoff_ms,
                &lookup,
                "FILE_STORE_RETRY_BACKOFF_MS",
                25,
            )?,
            lock_timeout_ms: pick(
                args.lock_timeout_ms,
                &lookup,
                "FILE_STORE_LOCK_TIMEOUT_MS",
                30_000,
            )?,
        };

        let flags = StartupFlags {
            migrate: args.migrate,
            remove_orphans: args.remove_orphans,
        };
        Ok((cfg, flags))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let initial_backoff = Duration::from_millis(self.retry_backoff_ms);
        RetryPolicy {
            max_attempts: self.retry_attempts.max(1),
            initial_backoff,
            max_backoff: initial_backoff.saturating_mul(20),
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// CLI value if given, else the parsed environment variable, else `default`.
fn pick<T, F>(cli: Option<T>, lookup: &F, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Result<String, env::VarError>,
{
    if let Some(value) = cli {
        return Ok(value);
    }
    match lookup(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(
        vars: &[(&str, &str)],
    ) -> impl Fn(&str) -> Result<String, env::VarError> + use<> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned().ok_or(env::VarError::NotPresent)
    }

    #[test]
    fn defaults_apply_without_env_or_args() {
        let (cfg, flags) = AppConfig::merge(Args::default(), lookup_from(&[])).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:3000");
        assert_eq!(cfg.storage_dir, "./data/files");
        assert_eq!(cfg.retry_attempts, 3);
        assert!(!flags.migrate);
        assert!(!flags.remove_orphans);
    }

    #[test]
    fn args_override_env() {
        let args = Args {
            port: Some(9000),
            storage_dir: Some("/srv/blobs".into()),
            remove_orphans: true,
            ..Args::default()
        };
        let lookup = lookup_from(&[
            ("FILE_STORE_PORT", "8000"),
            ("FILE_STORE_HOST", "127.0.0.1"),
            ("FILE_STORE_STORAGE_DIR", "/ignored"),
            ("FILE_STORE_LOCK_TIMEOUT_MS", "250"),
        ]);
        let (cfg, flags) = AppConfig::merge(args, lookup).unwrap();
        assert_eq!(cfg.addr(), "127.0.0.1:9000");
        assert_eq!(cfg.storage_dir, "/srv/blobs");
        assert_eq!(cfg.lock_timeout(), Duration::from_millis(250));
        assert!(flags.remove_orphans);
    }

    #[test]
    fn bad_numbers_are_reported() {
        let err = AppConfig::merge(Args::default(), lookup_from(&[("FILE_STORE_PORT", "http")]))
            .unwrap_err();
        assert!(err.to_string().contains("FILE_STORE_PORT"));
    }

    #[test]
    fn retry_policy_never_drops_to_zero_attempts() {
        let (mut cfg, _) = AppConfig::merge(Args::default(), lookup_from(&[])).unwrap();
        cfg.retry_attempts = 0;
        assert_eq!(cfg.retry_policy().max_attempts, 1);
    }
}
