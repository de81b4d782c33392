//! Process configuration.
//!
//! Settings are layered. Built-in defaults come first, then the YAML file passed with
//! `-c`/`--config`, and finally environment variables, which win over everything else.
//!
//! Environment variables start with `CS__` and use `__` to step into nested sections:
//!
//! - `CS__STORAGE__TYPE=filesystem` selects the local filesystem document store
//! - `CS__STORAGE__PATH=/data` moves its root directory
//! - `CS__CLEANUP__ENABLED=true` makes this process own the cleanup sweep
//!
//! The same settings as YAML:
//!
//! ```yaml
//! storage:
//!   type: filesystem
//!   path: /data
//! cleanup:
//!   enabled: true
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use chunkstore_service::StorageOptions;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use secrecy::{CloneableSecret, SecretBox, SerializableSecret, zeroize::Zeroize};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

const ENV_PREFIX: &str = "CS__";

/// A configuration value that must not show up in logs, such as the Sentry DSN.
///
/// Wrap it in a [`SecretBox`] and call `expose_secret` where the plain value is needed.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigSecret(String);

impl ConfigSecret {
    /// The plain secret.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConfigSecret {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Debug for ConfigSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConfigSecret(***)")
    }
}

impl Zeroize for ConfigSecret {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

impl CloneableSecret for ConfigSecret {}
impl SerializableSecret for ConfigSecret {}

/// The document store that holds chunks, deletion markers and entity documents.
///
/// Selected by `type`, which is either `memory` or `filesystem`.
#[derive(Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Storage {
    /// Keeps all documents in process memory. Nothing survives a restart.
    Memory,

    /// Writes one JSON file per document below `path`.
    ///
    /// ```yaml
    /// storage:
    ///   type: filesystem
    ///   path: /var/lib/chunkstore
    /// ```
    FileSystem {
        /// Root directory of the store, created on first write.
        ///
        /// Set with `CS__STORAGE__PATH`. Relative paths resolve against the working directory.
        path: PathBuf,
    },
}

/// Chunking and deletion behavior of the
/// [`StorageService`](chunkstore_service::StorageService).
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Service {
    /// Payload bytes per chunk document, `524288` unless set with `CS__SERVICE__CHUNK_SIZE`.
    ///
    /// Keep this well below the size limit of a single document in the backing store.
    pub chunk_size: usize,

    /// How long deleted or replaced blobs stay readable before the sweep removes them.
    ///
    /// Accepts human readable durations such as `30s` or `5m`. Defaults to five minutes; set with
    /// `CS__SERVICE__DELETION_GRACE`.
    #[serde(with = "humantime_serde")]
    pub deletion_grace: Duration,
}

impl Service {
    /// Converts this section into [`StorageOptions`].
    pub fn options(&self) -> StorageOptions {
        StorageOptions {
            chunk_size: self.chunk_size,
            deletion_grace: self.deletion_grace,
        }
    }
}

impl Default for Service {
    fn default() -> Self {
        let StorageOptions {
            chunk_size,
            deletion_grace,
        } = StorageOptions::default();
        Self {
            chunk_size,
            deletion_grace,
        }
    }
}

/// The periodic cleanup sweep.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Cleanup {
    /// Runs the sweep in this process (`CS__CLEANUP__ENABLED`, off by default).
    ///
    /// Exactly one process of a deployment should have this set. Additional sweepers only
    /// duplicate work since purging is idempotent.
    pub enabled: bool,

    /// Milliseconds between sweeps, fifteen minutes by default.
    pub interval_ms: u64,

    /// Minimum age of an unfinished blob before the sweep removes it.
    ///
    /// Unfinished blobs are chunk sets without a final chunk, left behind by writers that failed
    /// halfway. They are never removed while this is unset.
    #[serde(with = "humantime_serde")]
    pub orphan_ttl: Option<Duration>,
}

impl Cleanup {
    /// The configured sweep period.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for Cleanup {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 15 * 60 * 1000,
            orphan_ttl: None,
        }
    }
}

/// Schema versioning of entity documents.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Schema {
    /// Migrates outdated documents on load instead of only logging the mismatch.
    pub auto_migrate: bool,
}

/// The tokio runtime driving the process.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Runtime {
    /// Worker thread count (`CS__RUNTIME__WORKER_THREADS`). Defaults to one per CPU core.
    pub worker_threads: usize,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get(),
        }
    }
}

/// Error reporting to [Sentry](https://sentry.io/).
///
/// Reporting stays off until a DSN is configured.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Sentry {
    /// Project DSN, read from `CS__SENTRY__DSN`.
    pub dsn: Option<SecretBox<ConfigSecret>>,
    /// Deployment environment reported with every event.
    pub environment: Option<Cow<'static, str>>,
    /// Name of this host or pod.
    pub server_name: Option<Cow<'static, str>>,
    /// Fraction of error events to send, from `0.0` to `1.0`. All events are sent by default.
    pub sample_rate: f32,
    /// Prints SDK diagnostics to stderr.
    pub debug: bool,
    /// Tags added to every event, one variable per tag (`CS__SENTRY__TAGS__REGION=eu`).
    pub tags: BTreeMap<String, String>,
}

impl Sentry {
    /// `true` if a DSN is configured.
    pub fn is_enabled(&self) -> bool {
        self.dsn.is_some()
    }
}

impl Default for Sentry {
    fn default() -> Self {
        Self {
            dsn: None,
            environment: None,
            server_name: None,
            sample_rate: 1.0,
            debug: false,
            tags: BTreeMap::new(),
        }
    }
}

/// How log lines are rendered on stderr.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum LogFormat {
    /// [`Pretty`](Self::Pretty) when stderr is a terminal, [`Simplified`](Self::Simplified)
    /// otherwise.
    Auto,
    /// Colored multi-line output for local development.
    Pretty,
    /// One plain line per event:
    ///
    /// ```text
    /// 2025-03-01T09:30:00Z  INFO chunkstore_service::cleanup: cleanup sweep finished
    /// ```
    Simplified,
    /// Newline delimited JSON objects.
    Json,
}

/// A log format name that is not one of `auto`, `pretty`, `simplified` or `json`.
#[derive(Clone, Debug)]
pub struct FormatParseError(String);

impl fmt::Display for FormatParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown log format {:?}", self.0)
    }
}

impl std::error::Error for FormatParseError {}

impl TryFrom<String> for LogFormat {
    type Error = FormatParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl FromStr for LogFormat {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "pretty" => Ok(Self::Pretty),
            "simplified" => Ok(Self::Simplified),
            "json" => Ok(Self::Json),
            _ => Err(FormatParseError(s.to_owned())),
        }
    }
}

/// Serde adapter for [`LevelFilter`], which only implements `Display` and `FromStr`.
mod level_filter {
    use std::borrow::Cow;

    use serde::{Deserialize, Deserializer, Serializer, de};
    use tracing::level_filters::LevelFilter;

    pub fn serialize<S>(level: &LevelFilter, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(level)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level = Cow::<'de, str>::deserialize(deserializer)?;
        level.parse().map_err(de::Error::custom)
    }
}

/// Logging to stderr.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// Lowest level that is logged, `INFO` by default.
    ///
    /// `RUST_LOG` overrides this and allows per-module directives.
    #[serde(with = "level_filter")]
    pub level: LevelFilter,

    /// Rendering of log lines, see [`LogFormat`].
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// All settings of a chunkstore process.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Where documents are stored. Defaults to the filesystem below `./data`.
    pub storage: Storage,
    /// See [`Service`].
    pub service: Service,
    /// See [`Cleanup`].
    pub cleanup: Cleanup,
    /// See [`Schema`].
    pub schema: Schema,
    /// See [`Runtime`].
    pub runtime: Runtime,
    /// See [`Logging`].
    pub logging: Logging,
    /// See [`Sentry`].
    pub sentry: Sentry,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: Storage::FileSystem {
                path: PathBuf::from("data"),
            },
            service: Default::default(),
            cleanup: Default::default(),
            schema: Default::default(),
            runtime: Default::default(),
            logging: Default::default(),
            sentry: Default::default(),
        }
    }
}

impl Config {
    /// Resolves the configuration from defaults, the optional YAML file and the environment.
    ///
    /// Fails if the file cannot be read or if any layer holds a value of the wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let figment = Figment::new().merge(Serialized::defaults(Self::default()));
        let figment = match path {
            Some(path) => figment.merge(Yaml::file(path)),
            None => figment,
        };

        Ok(figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    fn write_yaml(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("chunkstore.yml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn uses_defaults_without_sources() {
        figment::Jail::expect_with(|_jail| {
            let config = Config::load(None).unwrap();

            assert!(matches!(
                &config.storage,
                Storage::FileSystem { path } if path == Path::new("data")
            ));
            assert_eq!(config.service.options(), StorageOptions::default());
            assert!(!config.cleanup.enabled);
            assert_eq!(config.cleanup.interval(), Duration::from_secs(900));
            assert!(config.cleanup.orphan_ttl.is_none());
            assert!(!config.schema.auto_migrate);
            assert_eq!(config.logging.level, LevelFilter::INFO);
            assert_eq!(config.logging.format, LogFormat::Auto);
            assert!(!config.sentry.is_enabled());
            Ok(())
        });
    }

    #[test]
    fn reads_environment() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("CS__STORAGE__TYPE", "memory");
            jail.set_env("CS__SERVICE__CHUNK_SIZE", "1024");
            jail.set_env("CS__SERVICE__DELETION_GRACE", "30s");
            jail.set_env("CS__CLEANUP__ENABLED", "true");
            jail.set_env("CS__CLEANUP__INTERVAL_MS", "60000");
            jail.set_env("CS__CLEANUP__ORPHAN_TTL", "1h");
            jail.set_env("CS__SCHEMA__AUTO_MIGRATE", "true");
            jail.set_env("CS__LOGGING__LEVEL", "debug");
            jail.set_env("CS__LOGGING__FORMAT", "JSON");
            jail.set_env("CS__SENTRY__DSN", "https://key@sentry.invalid/1");
            jail.set_env("CS__SENTRY__SAMPLE_RATE", "0.25");
            jail.set_env("CS__SENTRY__TAGS__REGION", "eu");

            let config = Config::load(None).unwrap();

            assert!(matches!(config.storage, Storage::Memory));
            assert_eq!(config.service.chunk_size, 1024);
            assert_eq!(config.service.deletion_grace, Duration::from_secs(30));
            assert!(config.cleanup.enabled);
            assert_eq!(config.cleanup.interval(), Duration::from_secs(60));
            assert_eq!(config.cleanup.orphan_ttl, Some(Duration::from_secs(3600)));
            assert!(config.schema.auto_migrate);
            assert_eq!(config.logging.level, LevelFilter::DEBUG);
            assert_eq!(config.logging.format, LogFormat::Json);

            let dsn = config.sentry.dsn.as_ref().unwrap();
            assert_eq!(dsn.expose_secret().as_str(), "https://key@sentry.invalid/1");
            assert_eq!(config.sentry.sample_rate, 0.25);
            assert_eq!(config.sentry.tags.get("region").map(String::as_str), Some("eu"));
            Ok(())
        });
    }

    #[test]
    fn reads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(
            &dir,
            "
storage:
  type: filesystem
  path: /var/lib/chunkstore
service:
  chunk_size: 4096
cleanup:
  enabled: true
  orphan_ttl: 2h
sentry:
  environment: staging
",
        );

        figment::Jail::expect_with(|_jail| {
            let config = Config::load(Some(&path)).unwrap();

            assert!(matches!(
                &config.storage,
                Storage::FileSystem { path } if path == Path::new("/var/lib/chunkstore")
            ));
            assert_eq!(config.service.chunk_size, 4096);
            assert_eq!(config.service.deletion_grace, Duration::from_secs(300));
            assert!(config.cleanup.enabled);
            assert_eq!(config.cleanup.interval_ms, 900_000);
            assert_eq!(config.cleanup.orphan_ttl, Some(Duration::from_secs(7200)));
            assert_eq!(config.sentry.environment.as_deref(), Some("staging"));
            assert!(!config.sentry.is_enabled());
            Ok(())
        });
    }

    #[test]
    fn environment_overrides_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(
            &dir,
            "
storage:
  type: filesystem
  path: /var/lib/chunkstore
service:
  chunk_size: 4096
",
        );

        figment::Jail::expect_with(|jail| {
            jail.set_env("CS__STORAGE__PATH", "/tmp/chunkstore");

            let config = Config::load(Some(&path)).unwrap();
            assert!(matches!(
                &config.storage,
                Storage::FileSystem { path } if path == Path::new("/tmp/chunkstore")
            ));
            assert_eq!(config.service.chunk_size, 4096);
            Ok(())
        });
    }

    #[test]
    fn rejects_unknown_log_format() {
        assert_eq!("Pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("fancy".parse::<LogFormat>().is_err());

        figment::Jail::expect_with(|jail| {
            jail.set_env("CS__LOGGING__FORMAT", "fancy");
            assert!(Config::load(None).is_err());
            Ok(())
        });
    }
}
