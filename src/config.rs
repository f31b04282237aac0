use anyhow::{anyhow, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::database::{
    BackendKind, ConnectionConfig, Migration, StorageSettings, STORAGE_FILE,
};
use crate::error::StorageError;
use crate::libraries::{ProvisionerConfig, DEFAULT_NAMESPACE};

/// Prefix of environment overrides, e.g. `HOSTSTORE_DATA_DIR` or
/// `HOSTSTORE_STORAGE__REMOTE__HOST`
const ENV_PREFIX: &str = "HOSTSTORE";

const EMPTY_CONFIG: &str = r#"### hoststore configuration file

### directory holding the store, the storage configuration and the library cache
# data_dir = "~/.hoststore"

[libraries]
### optional libraries provisioned at startup
# enabled = ["bstats-base"]

### mirrors tried after each library's own repository
# repositories = ["https://repo1.maven.org/maven2/"]

### where downloaded and relocated artifacts are kept (default: {data_dir}/libraries)
# cache_dir = "~/.hoststore/libraries"

### private namespace relocated packages are moved under
# namespace = "hoststore.libs"

# attempts = 3
# backoff_ms = 500
# fetch_timeout_secs = 60
"#;

const EMPTY_STORAGE_CONFIG: &str = r#"### hoststore storage configuration
###
### To move to another storage method, write the new settings to
### storage-new.toml next to this file; the data is copied over on the next
### startup and this file is kept as storage-old.toml.

[storage]
### embedded-file (sqlite), embedded-memory (duckdb), networked-engine-a (mysql), networked-engine-b (postgresql)
method = "embedded-file"

### file for embedded methods (default: {data_dir}/data/sqlite/data.db; embedded-memory stays in memory when unset)
# path = "~/.hoststore/data/sqlite/data.db"

### prepended to every table name
# table_prefix = ""

# pool_size = 4
# connect_timeout_secs = 10
# acquire_timeout_secs = 30
# shutdown_timeout_secs = 10

[storage.remote]
# host = "localhost"
# port = 3306
# database = "hoststore"
# username = "hoststore"
# password = ""

[storage.remote.properties]
# ssl-mode = "preferred"

[storage.tables]
### table = ["column", ...], created or extended on startup
# players = ["name", "score"]
"#;

/// Main configuration
pub struct HostStoreConfig {
    /// Path to the directory holding hoststore's data
    pub data_dir: String,

    pub libraries: LibrariesSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LibrariesSection {
    pub enabled: Vec<String>,
    pub repositories: Vec<String>,
    pub cache_dir: Option<PathBuf>,
    pub namespace: String,
    pub attempts: u32,
    pub backoff_ms: u64,
    pub fetch_timeout_secs: u64,
}

impl Default for LibrariesSection {
    fn default() -> Self {
        LibrariesSection {
            enabled: vec![],
            repositories: vec![],
            cache_dir: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            attempts: 3,
            backoff_ms: 500,
            fetch_timeout_secs: 60,
        }
    }
}

#[derive(Deserialize, Default)]
struct RawConfig {
    data_dir: Option<String>,
    #[serde(default)]
    libraries: LibrariesSection,
}

/// Contents of `storage.toml` (or a pending `storage-new.toml`)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub storage: StorageSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageSection {
    pub method: String,
    pub path: Option<PathBuf>,
    pub table_prefix: String,
    pub pool_size: usize,
    pub connect_timeout_secs: u64,
    pub acquire_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub remote: RemoteSection,
    pub tables: BTreeMap<String, Vec<String>>,
}

impl Default for StorageSection {
    fn default() -> Self {
        StorageSection {
            method: BackendKind::EmbeddedFile.name().to_string(),
            path: None,
            table_prefix: String::new(),
            pool_size: crate::database::core::DEFAULT_POOL_SIZE,
            connect_timeout_secs: crate::database::core::DEFAULT_CONNECT_TIMEOUT.as_secs(),
            acquire_timeout_secs: crate::database::core::DEFAULT_ACQUIRE_TIMEOUT.as_secs(),
            shutdown_timeout_secs: crate::database::DEFAULT_SHUTDOWN_TIMEOUT.as_secs(),
            remote: RemoteSection::default(),
            tables: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub properties: BTreeMap<String, String>,
}

impl fmt::Debug for RemoteSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("properties", &self.properties)
            .finish()
    }
}

fn home_dir() -> Result<String> {
    dirs::home_dir()
        .ok_or_else(|| anyhow!("Could not find home directory"))?
        .to_str()
        .ok_or_else(|| anyhow!("Could not convert home directory path to string"))
        .map(|s| s.to_owned())
}

/// Expand a leading `~/`
fn expand_home(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => match home_dir() {
            Ok(home) => format!("{}/{}", home, rest),
            Err(_) => path.to_string(),
        },
        None => path.to_string(),
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl Default for HostStoreConfig {
    fn default() -> Self {
        let home_dir = dirs::home_dir()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|| ".".to_string());

        Self {
            data_dir: format!("{}/.hoststore", home_dir),
            libraries: LibrariesSection::default(),
        }
    }
}

impl HostStoreConfig {
    /// Load the configuration, creating a commented default file when absent
    ///
    /// Without `path` the file is `~/.hoststore/hoststore.toml`.
    pub fn new(path: &Option<String>) -> Result<HostStoreConfig> {
        let mut builder = Config::builder();

        let p = match path {
            Some(p) => p.clone(),
            None => {
                let dir = format!("{}/.hoststore", home_dir()?);
                std::fs::create_dir_all(dir.as_str())
                    .map_err(|e| anyhow!("Unable to create hoststore directory: {}", e))?;
                format!("{}/hoststore.toml", dir)
            }
        };
        if Path::new(p.as_str()).exists() {
            builder = builder.add_source(File::new(p.as_str(), FileFormat::Toml));
        } else {
            std::fs::write(p.as_str(), EMPTY_CONFIG)
                .map_err(|e| anyhow!("Unable to create config file {}: {}", p.as_str(), e))?;
        }

        // Add in settings from the environment (with a prefix of HOSTSTORE)
        // E.g., `HOSTSTORE_DATA_DIR=/srv/hoststore` would set the data directory
        builder = builder.add_source(environment());

        let settings = builder
            .build()
            .map_err(|e| anyhow!("Failed to build configuration: {}", e))?;
        let raw = settings
            .try_deserialize::<RawConfig>()
            .map_err(|e| anyhow!("Failed to deserialize configuration: {}", e))?;

        let data_dir = match raw.data_dir {
            Some(d) => expand_home(&d),
            None => HostStoreConfig::default().data_dir,
        };
        crate::database::ensure_data_dir(&data_dir)?;

        Ok(HostStoreConfig {
            data_dir,
            libraries: raw.libraries,
        })
    }

    /// Configuration rooted at `data_dir`, without reading any file
    pub fn with_data_dir(data_dir: &str) -> Self {
        HostStoreConfig {
            data_dir: data_dir.to_string(),
            libraries: LibrariesSection::default(),
        }
    }

    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(self.data_dir.trim_end_matches('/'))
    }

    /// Path of the active storage configuration
    pub fn storage_file(&self) -> PathBuf {
        self.data_path().join(STORAGE_FILE)
    }

    /// Default file of the embedded-file store
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_path().join("data").join("sqlite").join("data.db")
    }

    pub fn cache_dir(&self) -> PathBuf {
        match &self.libraries.cache_dir {
            Some(dir) => PathBuf::from(expand_home(&dir.to_string_lossy())),
            None => self.data_path().join("libraries"),
        }
    }

    /// Active storage configuration, written with defaults when absent
    pub fn storage(&self) -> Result<StorageConfig> {
        let path = self.storage_file();
        if !path.exists() {
            std::fs::write(&path, EMPTY_STORAGE_CONFIG).map_err(|e| {
                anyhow!("Unable to create storage config {}: {}", path.display(), e)
            })?;
        }
        StorageConfig::load(&path, true)
    }

    pub fn provisioner_config(&self) -> ProvisionerConfig {
        let libs = &self.libraries;
        ProvisionerConfig {
            cache_dir: self.cache_dir(),
            repositories: libs.repositories.clone(),
            namespace: libs.namespace.clone(),
            attempts: libs.attempts.max(1),
            backoff: Duration::from_millis(libs.backoff_ms),
            fetch_timeout: Duration::from_secs(libs.fetch_timeout_secs),
        }
    }

    /// Display configuration summary
    pub fn summary(&self) -> String {
        let lines = [
            format!("Data Directory:     {}", self.data_dir),
            format!("Storage Config:     {}", self.storage_file().display()),
            format!("Library Cache:      {}", self.cache_dir().display()),
            format!("Enabled Libraries:  {}", self.libraries.enabled.join(", ")),
        ];
        lines.join("\n")
    }
}

impl StorageConfig {
    /// Read a storage file; `env` applies `HOSTSTORE_STORAGE__*` overrides
    pub fn load(path: &Path, env: bool) -> Result<StorageConfig> {
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("Could not convert path to string"))?;
        let mut builder = Config::builder().add_source(File::new(path_str, FileFormat::Toml));
        if env {
            builder = builder.add_source(environment());
        }
        builder
            .build()
            .map_err(|e| anyhow!("Failed to read storage config {}: {}", path_str, e))?
            .try_deserialize::<StorageConfig>()
            .map_err(|e| anyhow!("Invalid storage config {}: {}", path_str, e))
    }

    pub fn kind(&self) -> Result<BackendKind, StorageError> {
        self.storage.method.parse()
    }

    /// Connection parameters, with embedded files defaulting under `config`'s
    /// data directory
    pub fn connection_config(&self, config: &HostStoreConfig) -> Result<ConnectionConfig, StorageError> {
        let s = &self.storage;
        let kind = self.kind()?;
        let path = s
            .path
            .as_ref()
            .map(|p| PathBuf::from(expand_home(&p.to_string_lossy())));

        let mut conn = match kind {
            BackendKind::EmbeddedFile => {
                ConnectionConfig::embedded_file(path.unwrap_or_else(|| config.sqlite_path()))
            }
            BackendKind::EmbeddedMemory => {
                let mut conn = ConnectionConfig::embedded_memory();
                conn.path = path;
                conn
            }
            BackendKind::NetworkedEngineA | BackendKind::NetworkedEngineB => {
                let r = &s.remote;
                let mut conn = ConnectionConfig::networked(
                    kind,
                    r.host.as_deref().unwrap_or_default(),
                    r.database.as_deref().unwrap_or_default(),
                );
                conn.port = r.port;
                conn.username = r.username.clone();
                conn.password = r.password.clone();
                conn.properties = r.properties.clone();
                conn
            }
        };
        conn.pool_size = s.pool_size;
        conn.connect_timeout = Duration::from_secs(s.connect_timeout_secs);
        conn.acquire_timeout = Duration::from_secs(s.acquire_timeout_secs);
        conn.validate()?;
        Ok(conn)
    }

    pub fn settings(&self, migrations: Vec<Migration>) -> StorageSettings {
        StorageSettings {
            table_prefix: self.storage.table_prefix.clone(),
            tables: self.storage.tables.clone(),
            migrations,
            shutdown_timeout: Duration::from_secs(self.storage.shutdown_timeout_secs),
        }
    }
}
