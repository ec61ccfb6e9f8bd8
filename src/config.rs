use crate::{
    services::{jobs::VerificationBatch, multipart::MultipartSettings, tasks::JobSettings},
    storage::{ChecksumAlgorithm, DEFAULT_CHUNK_SIZE},
};
use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Root of the default location.
    pub storage_dir: String,
    pub database_url: String,
    pub default_location: String,
    pub checksum_algorithm: ChecksumAlgorithm,
    pub multipart_min_chunk: u64,
    pub multipart_max_chunk: u64,
    pub multipart_ttl_hours: i64,
    pub verify_frequency_hours: u64,
    pub verify_batch_interval_secs: u64,
    pub verify_pessimistic: bool,
    pub orphan_limit: u64,
    pub orphan_interval_secs: u64,
    pub workers: usize,
    pub jobs_enabled: bool,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Versioned file storage service")]
pub struct Args {
    /// Host to bind to (overrides FILES_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILES_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory backing the default location (overrides FILES_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides FILES_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Name of the default location (overrides FILES_STORE_DEFAULT_LOCATION)
    #[arg(long)]
    pub default_location: Option<String>,

    /// Checksum algorithm for new files: sha256 or md5 (overrides FILES_STORE_CHECKSUM)
    #[arg(long)]
    pub checksum: Option<ChecksumAlgorithm>,

    /// Smallest accepted multipart part size in bytes
    #[arg(long)]
    pub multipart_min_chunk: Option<u64>,

    /// Largest accepted multipart part size in bytes
    #[arg(long)]
    pub multipart_max_chunk: Option<u64>,

    /// Hours before an unfinished multipart upload expires
    #[arg(long)]
    pub multipart_ttl_hours: Option<i64>,

    /// Hours within which every file should be verified once
    #[arg(long)]
    pub verify_frequency_hours: Option<u64>,

    /// Seconds between checksum verification batches
    #[arg(long)]
    pub verify_batch_interval_secs: Option<u64>,

    /// Re-verify files already marked unreadable
    #[arg(long)]
    pub verify_pessimistic: bool,

    /// Orphans examined per cleanup run
    #[arg(long)]
    pub orphan_limit: Option<u64>,

    /// Seconds between orphan cleanup runs
    #[arg(long)]
    pub orphan_interval_secs: Option<u64>,

    /// Background workers (overrides FILES_STORE_WORKERS)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Disable background jobs
    #[arg(long)]
    pub no_jobs: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read `name` from the environment, parsed, or `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|err| anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        Self::merge(Args::parse())
    }

    fn merge(args: Args) -> Result<(Self, bool)> {
        // --- Environment fallback ---
        let env_host = env::var("FILES_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("FILES_STORE_PORT", 3000u16)?;
        let env_storage =
            env::var("FILES_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/files".into());
        let env_db = env::var("FILES_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/files_store.db".into());
        let env_location =
            env::var("FILES_STORE_DEFAULT_LOCATION").unwrap_or_else(|_| "default".into());
        let env_checksum = env_or("FILES_STORE_CHECKSUM", ChecksumAlgorithm::Sha256)?;
        let defaults = MultipartSettings::default();
        let env_min_chunk = env_or("FILES_STORE_MULTIPART_MIN_CHUNK", defaults.min_chunk_size)?;
        let env_max_chunk = env_or("FILES_STORE_MULTIPART_MAX_CHUNK", defaults.max_chunk_size)?;
        let env_ttl = env_or("FILES_STORE_MULTIPART_TTL_HOURS", 24i64)?;
        let env_frequency = env_or("FILES_STORE_VERIFY_FREQUENCY_HOURS", 30 * 24u64)?;
        let env_interval = env_or("FILES_STORE_VERIFY_BATCH_INTERVAL_SECS", 3600u64)?;
        let env_pessimistic = env_or("FILES_STORE_VERIFY_PESSIMISTIC", false)?;
        let env_orphan_limit = env_or("FILES_STORE_ORPHAN_LIMIT", 1000u64)?;
        let env_orphan_interval = env_or("FILES_STORE_ORPHAN_INTERVAL_SECS", 24 * 3600u64)?;
        let env_workers = env_or("FILES_STORE_WORKERS", 2usize)?;
        let env_jobs = env_or("FILES_STORE_JOBS_ENABLED", true)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            default_location: args.default_location.unwrap_or(env_location),
            checksum_algorithm: args.checksum.unwrap_or(env_checksum),
            multipart_min_chunk: args.multipart_min_chunk.unwrap_or(env_min_chunk),
            multipart_max_chunk: args.multipart_max_chunk.unwrap_or(env_max_chunk),
            multipart_ttl_hours: args.multipart_ttl_hours.unwrap_or(env_ttl),
            verify_frequency_hours: args.verify_frequency_hours.unwrap_or(env_frequency),
            verify_batch_interval_secs: args.verify_batch_interval_secs.unwrap_or(env_interval),
            verify_pessimistic: args.verify_pessimistic || env_pessimistic,
            orphan_limit: args.orphan_limit.unwrap_or(env_orphan_limit),
            orphan_interval_secs: args.orphan_interval_secs.unwrap_or(env_orphan_interval),
            workers: args.workers.unwrap_or(env_workers),
            jobs_enabled: !args.no_jobs && env_jobs,
        };

        if cfg.multipart_min_chunk == 0 || cfg.multipart_min_chunk > cfg.multipart_max_chunk {
            anyhow::bail!(
                "multipart chunk bounds {}..={} are invalid",
                cfg.multipart_min_chunk,
                cfg.multipart_max_chunk
            );
        }

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn multipart(&self) -> MultipartSettings {
        MultipartSettings {
            min_chunk_size: self.multipart_min_chunk,
            max_chunk_size: self.multipart_max_chunk,
            ..MultipartSettings::default()
        }
    }

    pub fn jobs(&self) -> JobSettings {
        JobSettings {
            verification: VerificationBatch {
                frequency: Duration::from_secs(self.verify_frequency_hours * 3600),
                batch_interval: Duration::from_secs(self.verify_batch_interval_secs.max(1)),
                pessimistic: self.verify_pessimistic,
                chunk_size: DEFAULT_CHUNK_SIZE,
                ..VerificationBatch::default()
            },
            orphan_limit: self.orphan_limit,
            orphan_interval: Duration::from_secs(self.orphan_interval_secs.max(1)),
            upload_ttl: chrono::Duration::hours(self.multipart_ttl_hours),
            ..JobSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_arguments_override_defaults() {
        let args = Args::parse_from([
            "files-store",
            "--port",
            "8080",
            "--checksum",
            "md5",
            "--multipart-min-chunk",
            "10",
            "--no-jobs",
            "--migrate",
        ]);
        let (cfg, migrate) = AppConfig::merge(args).unwrap();
        assert!(migrate);
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.addr(), format!("{}:8080", cfg.host));
        assert_eq!(cfg.checksum_algorithm, ChecksumAlgorithm::Md5);
        assert_eq!(cfg.multipart().min_chunk_size, 10);
        assert!(!cfg.jobs_enabled);
    }

    #[test]
    fn rejects_inverted_chunk_bounds() {
        let args = Args::parse_from([
            "files-store",
            "--multipart-min-chunk",
            "100",
            "--multipart-max-chunk",
            "10",
        ]);
        assert!(AppConfig::merge(args).is_err());
    }
}
