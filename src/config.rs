use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::{env, fmt, path::PathBuf, str::FromStr};

/// What to do when a multi-resolution upload is not a supported raster type.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MultiResolutionPolicy {
    /// Log a warning and store the file as a single-resolution resource.
    #[default]
    Warn,
    /// Refuse the upload with an unsupported-media-type error.
    Reject,
}

impl FromStr for MultiResolutionPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        <Self as ValueEnum>::from_str(s, true)
            .map_err(|_| anyhow::anyhow!("expected `warn` or `reject`, got `{}`", s))
    }
}

/// Settings the resource manager and cleaner receive at construction.
#[derive(Debug, Clone)]
pub struct ResourceConfig {
    /// Root for timestamp-named download staging directories.
    pub download_temp_folder: PathBuf,
    /// Root for timestamp-named upload staging directories.
    pub upload_temp_folder: PathBuf,
    /// Staging directories older than this are removed by the cleaner.
    pub temp_cleanup_before_minutes: u32,
    pub multi_resolution_policy: MultiResolutionPolicy,
}

impl ResourceConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.temp_cleanup_before_minutes))
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub download_temp_folder: String,
    pub upload_temp_folder: String,
    pub temp_cleanup_before_minutes: u32,
    pub cleanup_interval_minutes: u32,
    pub multi_resolution_policy: MultiResolutionPolicy,
    /// Prefix for shareable links; defaults to `http://{host}:{port}`.
    pub public_base_url: String,
    pub link_secret: String,
}

// Keeps the link secret out of the startup log line.
impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("storage_dir", &self.storage_dir)
            .field("database_url", &self.database_url)
            .field("download_temp_folder", &self.download_temp_folder)
            .field("upload_temp_folder", &self.upload_temp_folder)
            .field("temp_cleanup_before_minutes", &self.temp_cleanup_before_minutes)
            .field("cleanup_interval_minutes", &self.cleanup_interval_minutes)
            .field("multi_resolution_policy", &self.multi_resolution_policy)
            .field("public_base_url", &self.public_base_url)
            .finish_non_exhaustive()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Versioned file resource store")]
pub struct Args {
    /// Host to bind to (overrides RESOURCE_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides RESOURCE_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides RESOURCE_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides RESOURCE_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Root for download staging directories (overrides RESOURCE_STORE_DOWNLOAD_TEMP_FOLDER)
    #[arg(long)]
    pub download_temp_folder: Option<String>,

    /// Root for upload staging directories (overrides RESOURCE_STORE_UPLOAD_TEMP_FOLDER)
    #[arg(long)]
    pub upload_temp_folder: Option<String>,

    /// Minutes a staging directory is kept (overrides RESOURCE_STORE_TEMP_CLEANUP_BEFORE_MINUTES)
    #[arg(long)]
    pub temp_cleanup_before_minutes: Option<u32>,

    /// Minutes between cleanup sweeps (overrides RESOURCE_STORE_CLEANUP_INTERVAL_MINUTES)
    #[arg(long)]
    pub cleanup_interval_minutes: Option<u32>,

    /// Handling of unsupported multi-resolution uploads (overrides RESOURCE_STORE_MULTI_RESOLUTION_POLICY)
    #[arg(long, value_enum)]
    pub multi_resolution_policy: Option<MultiResolutionPolicy>,

    /// Base URL for shareable links (overrides RESOURCE_STORE_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Store a local file as a new resource and exit
    #[arg(long, value_name = "PATH", conflicts_with = "migrate")]
    pub import: Option<PathBuf>,

    /// Storage key for --import (defaults to the dated key for the file name)
    #[arg(long, value_name = "KEY", requires = "import")]
    pub import_key: Option<String>,

    /// Mark the imported resource as public
    #[arg(long, requires = "import")]
    pub import_public: bool,
}

/// What the binary does after connecting to the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupTask {
    Serve,
    Migrate,
    Import {
        path: PathBuf,
        key: Option<String>,
        is_public: bool,
    },
}

impl Args {
    fn task(&self) -> StartupTask {
        match (&self.import, self.migrate) {
            (Some(path), _) => StartupTask::Import {
                path: path.clone(),
                key: self.import_key.clone(),
                is_public: self.import_public,
            },
            (None, true) => StartupTask::Migrate,
            (None, false) => StartupTask::Serve,
        }
    }
}

/// Read and parse an environment variable, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the task to run.
    pub fn from_env_and_args() -> Result<(Self, StartupTask)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("RESOURCE_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("RESOURCE_STORE_PORT", 3000u16)?;
        let env_storage =
            env::var("RESOURCE_STORE_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("RESOURCE_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/resources.db".into());
        let env_download = env::var("RESOURCE_STORE_DOWNLOAD_TEMP_FOLDER")
            .unwrap_or_else(|_| "./data/tmp/downloads".into());
        let env_upload = env::var("RESOURCE_STORE_UPLOAD_TEMP_FOLDER")
            .unwrap_or_else(|_| "./data/tmp/uploads".into());
        let env_retention = env_or("RESOURCE_STORE_TEMP_CLEANUP_BEFORE_MINUTES", 60u32)?;
        let env_interval = env_or("RESOURCE_STORE_CLEANUP_INTERVAL_MINUTES", 15u32)?;
        let env_policy = env_or(
            "RESOURCE_STORE_MULTI_RESOLUTION_POLICY",
            MultiResolutionPolicy::Warn,
        )?;
        let env_base_url = env::var("RESOURCE_STORE_PUBLIC_BASE_URL").ok();
        let link_secret = match env::var("RESOURCE_STORE_LINK_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ => {
                tracing::warn!(
                    "RESOURCE_STORE_LINK_SECRET not set; shareable links will not survive a restart"
                );
                uuid::Uuid::new_v4().simple().to_string()
            }
        };

        let task = args.task();

        // --- Merge ---
        let host = args.host.unwrap_or(env_host);
        let port = args.port.unwrap_or(env_port);
        let public_base_url = args
            .public_base_url
            .or(env_base_url)
            .unwrap_or_else(|| format!("http://{}:{}", host, port));

        let cfg = Self {
            host,
            port,
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            download_temp_folder: args.download_temp_folder.unwrap_or(env_download),
            upload_temp_folder: args.upload_temp_folder.unwrap_or(env_upload),
            temp_cleanup_before_minutes: args.temp_cleanup_before_minutes.unwrap_or(env_retention),
            cleanup_interval_minutes: args
                .cleanup_interval_minutes
                .unwrap_or(env_interval)
                .max(1),
            multi_resolution_policy: args.multi_resolution_policy.unwrap_or(env_policy),
            public_base_url,
            link_secret,
        };

        Ok((cfg, task))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn resource_config(&self) -> ResourceConfig {
        ResourceConfig {
            download_temp_folder: PathBuf::from(&self.download_temp_folder),
            upload_temp_folder: PathBuf::from(&self.upload_temp_folder),
            temp_cleanup_before_minutes: self.temp_cleanup_before_minutes,
            multi_resolution_policy: self.multi_resolution_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_parses_case_insensitively() {
        assert_eq!(
            "REJECT".parse::<MultiResolutionPolicy>().unwrap(),
            MultiResolutionPolicy::Reject
        );
        assert_eq!(
            "warn".parse::<MultiResolutionPolicy>().unwrap(),
            MultiResolutionPolicy::Warn
        );
        assert!("drop".parse::<MultiResolutionPolicy>().is_err());
    }

    #[test]
    fn import_flags_select_import_task() {
        let args = Args::parse_from([
            "resource-store",
            "--import",
            "/data/report.pdf",
            "--import-key",
            "reports/2024/report.pdf",
            "--import-public",
        ]);
        assert_eq!(
            args.task(),
            StartupTask::Import {
                path: PathBuf::from("/data/report.pdf"),
                key: Some("reports/2024/report.pdf".into()),
                is_public: true,
            }
        );

        assert_eq!(
            Args::parse_from(["resource-store", "--migrate"]).task(),
            StartupTask::Migrate
        );
        assert_eq!(Args::parse_from(["resource-store"]).task(), StartupTask::Serve);
        assert!(Args::try_parse_from(["resource-store", "--import-public"]).is_err());
    }

    #[test]
    fn retention_is_in_minutes() {
        let cfg = ResourceConfig {
            download_temp_folder: "d".into(),
            upload_temp_folder: "u".into(),
            temp_cleanup_before_minutes: 90,
            multi_resolution_policy: MultiResolutionPolicy::Warn,
        };
        assert_eq!(cfg.retention(), chrono::Duration::minutes(90));
    }
}
