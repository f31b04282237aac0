//! Runtime library provisioning
//!
//! Optional third-party libraries (storage drivers, a reflection helper, a
//! metrics client) are not bundled with the host artifact. They are resolved,
//! verified, relocated into a private namespace and loaded on demand.
//!
//! ```text
//! libraries/
//! ├── registry    # descriptor table (RuntimeLibrary)
//! ├── repository  # artifact sources (HTTP mirrors, local directories)
//! ├── resolver    # cache + download + checksum, single-flight per coordinate
//! ├── relocate    # archive/package relocation
//! └── loader      # scope directories, LibraryHandle, DriverHandle
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use hoststore::libraries::{Provisioner, ProvisionerConfig};
//!
//! let provisioner = Provisioner::new(ProvisionerConfig::new("~/.hoststore/libraries"));
//! let handle = provisioner.provision("postgresql")?;
//! let driver = handle.driver();
//! ```

pub mod loader;
pub mod registry;
pub mod relocate;
pub mod repository;
pub mod resolver;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::database::BackendKind;
use crate::error::ProvisioningError;

pub use loader::{DriverHandle, LibraryHandle, Loader, DEFAULT_NAMESPACE};
pub use registry::{Capability, LibraryDescriptor, Registry, Relocation, RuntimeLibrary, MAVEN_CENTRAL};
pub use relocate::{RelocationSummary, Relocator};
pub use repository::{source_for, ArtifactSource, FetchError, HttpRepository, LocalRepository};
pub use resolver::{
    ResolvedArtifact, Resolver, CACHE_SOURCE, DEFAULT_ATTEMPTS, DEFAULT_BACKOFF,
    DEFAULT_FETCH_TIMEOUT,
};

/// Settings for a [`Provisioner`]
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    pub cache_dir: PathBuf,
    /// Mirrors tried after each library's preferred repository
    pub repositories: Vec<String>,
    pub namespace: String,
    pub attempts: u32,
    pub backoff: Duration,
    pub fetch_timeout: Duration,
}

impl ProvisionerConfig {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        ProvisionerConfig {
            cache_dir: cache_dir.into(),
            repositories: vec![],
            namespace: DEFAULT_NAMESPACE.to_string(),
            attempts: DEFAULT_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

/// Provisioning state of one registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LibraryState {
    /// Not requested yet
    Pending,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct LibraryStatus {
    pub id: String,
    pub coordinate: String,
    pub capability: Capability,
    pub state: LibraryState,
    pub classes: usize,
    pub path: Option<PathBuf>,
    pub error: Option<String>,
}

/// Outcome of [`Provisioner::provision_enabled`]
#[derive(Debug, Default)]
pub struct ProvisioningReport {
    pub ready: Vec<String>,
    pub failed: Vec<(String, ProvisioningError)>,
}

impl ProvisioningReport {
    pub fn all_ready(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Registry + resolver + loader
///
/// Failures are recorded per library; one library failing never affects
/// another that does not depend on it.
pub struct Provisioner {
    registry: Registry,
    resolver: Resolver,
    loader: Loader,
    failures: Mutex<HashMap<String, ProvisioningError>>,
}

impl Provisioner {
    /// Provisioner over the built-in registry
    pub fn new(config: ProvisionerConfig) -> Self {
        let mirrors = config
            .repositories
            .iter()
            .map(|location| source_for(location, config.fetch_timeout))
            .collect();
        let resolver = Resolver::new(&config.cache_dir, mirrors)
            .with_attempts(config.attempts)
            .with_backoff(config.backoff)
            .with_fetch_timeout(config.fetch_timeout);
        let loader = Loader::new(&config.cache_dir, &config.namespace);
        Provisioner::from_parts(Registry::builtin(), resolver, loader)
    }

    pub fn from_parts(registry: Registry, resolver: Resolver, loader: Loader) -> Self {
        Provisioner {
            registry,
            resolver,
            loader,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Resolve and load `id`, dependencies first
    pub fn provision(&self, id: &str) -> Result<Arc<LibraryHandle>, ProvisioningError> {
        if let Some(handle) = self.loader.get(id) {
            return Ok(handle);
        }

        let result = self.provision_uncached(id);
        match &result {
            Ok(_) => {
                self.failures.lock().remove(id);
            }
            Err(e) => {
                self.failures.lock().insert(id.to_string(), e.clone());
            }
        }
        result
    }

    fn provision_uncached(&self, id: &str) -> Result<Arc<LibraryHandle>, ProvisioningError> {
        let order = self.registry.provisioning_order(id)?;
        let mut last = None;
        for descriptor in order {
            let artifact = self.resolver.resolve(descriptor)?;
            let handle = self.loader.load(&artifact)?;
            info!(
                "library {} ready ({} from {})",
                descriptor.id,
                descriptor.coordinate(),
                artifact.source
            );
            last = Some(handle);
        }
        last.ok_or_else(|| ProvisioningError::NotFound {
            coordinate: id.to_string(),
        })
    }

    /// Provision every id in `ids`, isolating failures per library
    pub fn provision_enabled(&self, ids: &[&str]) -> ProvisioningReport {
        let mut report = ProvisioningReport::default();
        for id in ids {
            match self.provision(id) {
                Ok(_) => report.ready.push(id.to_string()),
                Err(e) => {
                    warn!("optional library {} unavailable: {}", id, e);
                    report.failed.push((id.to_string(), e));
                }
            }
        }
        report
    }

    /// The library-ready signal consumed by collaborators
    pub fn is_ready(&self, id: &str) -> bool {
        self.loader.get(id).is_some()
    }

    pub fn handle(&self, id: &str) -> Option<Arc<LibraryHandle>> {
        self.loader.get(id)
    }

    pub fn failure(&self, id: &str) -> Option<ProvisioningError> {
        self.failures.lock().get(id).cloned()
    }

    /// Driver token for `kind`, provisioning its library when needed
    ///
    /// Built-in engines need no library and yield `None`.
    pub fn driver_for(&self, kind: BackendKind) -> Result<Option<DriverHandle>, ProvisioningError> {
        let Some(library) = kind.required_library() else {
            return Ok(None);
        };
        let handle = self.provision(library.id())?;
        handle
            .driver()
            .map(Some)
            .ok_or_else(|| ProvisioningError::CorruptArtifact {
                coordinate: handle.descriptor().coordinate(),
                reason: format!("library does not provide a {} driver", kind),
            })
    }

    /// Status of every registry entry, sorted by id
    pub fn status(&self) -> Vec<LibraryStatus> {
        let failures = self.failures.lock();
        self.registry
            .iter()
            .map(|descriptor| {
                let handle = self.loader.get(&descriptor.id);
                let failure = failures.get(&descriptor.id);
                let state = match (&handle, failure) {
                    (Some(_), _) => LibraryState::Ready,
                    (None, Some(_)) => LibraryState::Failed,
                    (None, None) => LibraryState::Pending,
                };
                LibraryStatus {
                    id: descriptor.id.clone(),
                    coordinate: descriptor.coordinate(),
                    capability: descriptor.capability,
                    state,
                    classes: handle.as_ref().map(|h| h.class_count()).unwrap_or(0),
                    path: handle.as_ref().map(|h| h.path().to_path_buf()),
                    error: failure.map(|e| e.to_string()),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    fn write_jar(path: &Path, classes: &[&str]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        for class in classes {
            zip.start_file(format!("{}.class", class), SimpleFileOptions::default())
                .unwrap();
            let mut bytes = vec![0xCA, 0xFE, 0xBA, 0xBE, 0, 0, 0, 52, 0, 2, 1];
            bytes.extend_from_slice(&(class.len() as u16).to_be_bytes());
            bytes.extend_from_slice(class.as_bytes());
            zip.write_all(&bytes).unwrap();
        }
        zip.finish().unwrap();
    }

    fn publish(repo: &Path, descriptor: &LibraryDescriptor, classes: &[&str]) {
        let path = descriptor
            .repository_path()
            .split('/')
            .fold(repo.to_path_buf(), |acc, p| acc.join(p));
        write_jar(&path, classes);
    }

    fn provisioner(repo: &Path, cache: &Path, registry: Registry) -> Provisioner {
        let resolver = Resolver::new(cache, vec![Box::new(LocalRepository::new(repo))])
            .with_attempts(1)
            .with_backoff(Duration::ZERO);
        Provisioner::from_parts(registry, resolver, Loader::new(cache, DEFAULT_NAMESPACE))
    }

    fn local(lib: RuntimeLibrary) -> LibraryDescriptor {
        let mut d = lib.descriptor();
        d.repository = None;
        d
    }

    #[test]
    fn test_provision_with_dependencies() {
        let repo = tempdir().unwrap();
        let cache = tempdir().unwrap();
        let javassist = local(RuntimeLibrary::Javassist);
        let reflections = local(RuntimeLibrary::Reflections);
        publish(repo.path(), &javassist, &["javassist/ClassPool"]);
        publish(repo.path(), &reflections, &["org/reflections/Reflections"]);

        let p = provisioner(repo.path(), cache.path(), Registry::new([javassist, reflections]));
        let handle = p.provision("reflections").unwrap();
        assert_eq!(handle.capability(), Capability::Reflection);
        assert!(p.is_ready("reflections"));
        assert!(p.is_ready("javassist"));
        assert_eq!(p.resolver().downloads(), 2);
    }

    #[test]
    fn test_failures_are_isolated() {
        let repo = tempdir().unwrap();
        let cache = tempdir().unwrap();
        let bstats = local(RuntimeLibrary::BstatsBase);
        let duckdb = local(RuntimeLibrary::DuckDb);
        publish(repo.path(), &bstats, &["org/bstats/MetricsBase"]);

        let p = provisioner(repo.path(), cache.path(), Registry::new([bstats, duckdb]));
        let report = p.provision_enabled(&["duckdb", "bstats-base"]);
        assert_eq!(report.ready, vec!["bstats-base".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(
            report.failed[0].1,
            ProvisioningError::NotFound { .. }
        ));
        assert!(p.is_ready("bstats-base"));
        assert!(!p.is_ready("duckdb"));

        let status = p.status();
        let duck = status.iter().find(|s| s.id == "duckdb").unwrap();
        assert_eq!(duck.state, LibraryState::Failed);
        assert!(duck.error.is_some());
    }

    #[test]
    fn test_driver_for() {
        let repo = tempdir().unwrap();
        let cache = tempdir().unwrap();
        let duckdb = local(RuntimeLibrary::DuckDb);
        publish(repo.path(), &duckdb, &["org/duckdb/DuckDBDriver"]);

        let p = provisioner(repo.path(), cache.path(), Registry::new([duckdb]));
        assert_eq!(p.driver_for(BackendKind::EmbeddedFile).unwrap(), None);
        let driver = p.driver_for(BackendKind::EmbeddedMemory).unwrap().unwrap();
        assert_eq!(driver.backend, BackendKind::EmbeddedMemory);
        assert_eq!(driver.entry_point, "hoststore.libs.duckdb.DuckDBDriver");
        assert!(driver.library_path.exists());
    }

    #[test]
    fn test_unknown_library() {
        let repo = tempdir().unwrap();
        let cache = tempdir().unwrap();
        let p = provisioner(repo.path(), cache.path(), Registry::default());
        assert!(matches!(
            p.provision("nope"),
            Err(ProvisioningError::NotFound { .. })
        ));
    }
}
