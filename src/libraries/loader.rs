//! Relocating loader
//!
//! Turns a [`ResolvedArtifact`] into a [`LibraryHandle`]: the artifact is
//! relocated into the private namespace and written to its own scope
//! directory, `{cache}/isolated/{id}/`, so another plugin bundling a different
//! version of the same library never sees ours.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};
use zip::ZipArchive;

use crate::database::BackendKind;
use crate::error::ProvisioningError;
use crate::libraries::registry::{Capability, LibraryDescriptor};
use crate::libraries::relocate::{class_name, RelocationError, Relocator};
use crate::libraries::resolver::ResolvedArtifact;

/// Default private namespace relocated packages are moved under
pub const DEFAULT_NAMESPACE: &str = "hoststore.libs";

const ISOLATED_DIR: &str = "isolated";

/// Proof that a storage driver library was provisioned and relocated
///
/// Adapters for provisioned engines refuse to start without one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverHandle {
    pub backend: BackendKind,
    /// Library id the driver came from
    pub library: String,
    /// Relocated driver entry point
    pub entry_point: String,
    pub library_path: PathBuf,
}

impl DriverHandle {
    /// Isolated directory holding the driver library, where the engine keeps
    /// its runtime files
    pub fn scope_dir(&self) -> &Path {
        self.library_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
    }

    /// Whether the relocated library is still on disk
    pub fn is_present(&self) -> bool {
        self.library_path.is_file()
    }
}

/// A relocated, loaded optional library
#[derive(Debug, Clone, Serialize)]
pub struct LibraryHandle {
    descriptor: LibraryDescriptor,
    path: PathBuf,
    namespace: String,
    #[serde(skip)]
    relocator_rules: Vec<(String, String)>,
    classes: BTreeSet<String>,
}

impl LibraryHandle {
    pub fn descriptor(&self) -> &LibraryDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Location of the relocated archive
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capability(&self) -> Capability {
        self.descriptor.capability
    }

    /// Relocated, dotted class names
    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.classes.iter().map(|c| c.as_str())
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Where `original` lives after relocation
    pub fn relocated_name(&self, original: &str) -> String {
        let mut rules = self.relocator_rules.clone();
        rules.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        for (from, to) in &rules {
            if original == from {
                return to.clone();
            }
            if let Some(rest) = original
                .strip_prefix(from.as_str())
                .and_then(|r| r.strip_prefix('.'))
            {
                return format!("{}.{}", to, rest);
            }
        }
        original.to_string()
    }

    /// Whether `class` exists in this library, given by its original or
    /// relocated name
    pub fn contains_class(&self, class: &str) -> bool {
        self.classes.contains(class) || self.classes.contains(&self.relocated_name(class))
    }

    /// Relocated entry point class, if the library declares one
    pub fn entry_point(&self) -> Option<String> {
        self.descriptor
            .entry_point
            .as_deref()
            .map(|e| self.relocated_name(e))
    }

    /// Driver token for storage adapters, present only for driver libraries
    pub fn driver(&self) -> Option<DriverHandle> {
        match self.descriptor.capability {
            Capability::Driver(backend) => Some(DriverHandle {
                backend,
                library: self.descriptor.id.clone(),
                entry_point: self.entry_point()?,
                library_path: self.path.clone(),
            }),
            _ => None,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

/// Relocates resolved artifacts and memoizes the handles per library id
pub struct Loader {
    scope_root: PathBuf,
    namespace: String,
    handles: Mutex<HashMap<String, Arc<LibraryHandle>>>,
}

fn corrupt(descriptor: &LibraryDescriptor, reason: impl ToString) -> ProvisioningError {
    ProvisioningError::CorruptArtifact {
        coordinate: descriptor.coordinate(),
        reason: reason.to_string(),
    }
}

impl Loader {
    /// Loader writing scope directories under `{cache_dir}/isolated`
    pub fn new(cache_dir: &Path, namespace: &str) -> Self {
        Loader {
            scope_root: cache_dir.join(ISOLATED_DIR),
            namespace: namespace.trim_matches('.').to_string(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Scope directory of library `id`
    pub fn scope_dir(&self, id: &str) -> PathBuf {
        self.scope_root.join(id)
    }

    /// Previously loaded handle for `id`
    pub fn get(&self, id: &str) -> Option<Arc<LibraryHandle>> {
        self.handles.lock().get(id).cloned()
    }

    pub fn loaded(&self) -> Vec<Arc<LibraryHandle>> {
        let mut handles: Vec<_> = self.handles.lock().values().cloned().collect();
        handles.sort_by(|a, b| a.id().cmp(b.id()));
        handles
    }

    /// Relocate `artifact` into its scope directory and index its classes
    pub fn load(&self, artifact: &ResolvedArtifact) -> Result<Arc<LibraryHandle>, ProvisioningError> {
        let descriptor = &artifact.descriptor;
        if let Some(handle) = self.get(&descriptor.id) {
            return Ok(handle);
        }

        let relocator = Relocator::new(&self.namespace, &descriptor.relocations);
        let scope = self.scope_dir(&descriptor.id);
        fs::create_dir_all(&scope).map_err(|e| corrupt(descriptor, e))?;
        let target = scope.join(descriptor.file_name());
        let origin = scope.join(format!("{}.origin", descriptor.file_name()));

        let reusable = target.exists()
            && fs::read_to_string(&origin)
                .map(|s| s.trim() == artifact.sha256)
                .unwrap_or(false);

        let classes = if reusable {
            debug!("reusing relocated {} at {}", descriptor.id, target.display());
            index_classes(&target).map_err(|e| corrupt(descriptor, e))?
        } else {
            let temp = scope.join(format!("{}.part", descriptor.file_name()));
            let summary = match relocator.relocate_archive(&artifact.path, &temp) {
                Ok(summary) => summary,
                Err(e) => {
                    let _ = fs::remove_file(&temp);
                    return Err(corrupt(descriptor, e));
                }
            };
            fs::rename(&temp, &target).map_err(|e| corrupt(descriptor, e))?;
            fs::write(&origin, &artifact.sha256).map_err(|e| corrupt(descriptor, e))?;
            info!(
                "relocated {} into {}: {} classes ({} rewritten), {} entries dropped",
                descriptor.coordinate(),
                self.namespace,
                summary.classes.len(),
                summary.rewritten_classes,
                summary.dropped_entries
            );
            summary.classes.into_iter().collect()
        };

        let handle = LibraryHandle {
            descriptor: descriptor.clone(),
            path: target,
            namespace: self.namespace.clone(),
            relocator_rules: relocator_rules(&self.namespace, descriptor),
            classes,
        };

        if let Some(entry) = handle.entry_point() {
            if !handle.classes.contains(&entry) {
                return Err(corrupt(
                    descriptor,
                    format!("entry point {} is missing", entry),
                ));
            }
        }

        let handle = Arc::new(handle);
        Ok(Arc::clone(
            self.handles
                .lock()
                .entry(descriptor.id.clone())
                .or_insert(handle),
        ))
    }
}

fn relocator_rules(namespace: &str, descriptor: &LibraryDescriptor) -> Vec<(String, String)> {
    descriptor
        .relocations
        .iter()
        .map(|r| {
            let to = r.to.trim_matches('.');
            let target = if namespace.is_empty() {
                to.to_string()
            } else {
                format!("{}.{}", namespace, to)
            };
            (r.from.trim_matches('.').to_string(), target)
        })
        .collect()
}

fn index_classes(path: &Path) -> Result<BTreeSet<String>, RelocationError> {
    let archive = ZipArchive::new(File::open(path)?)?;
    Ok(archive.file_names().filter_map(class_name).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libraries::resolver::sha256_hex;
    use std::io::Write;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    fn class_bytes(name: &str) -> Vec<u8> {
        let mut bytes = vec![0xCA, 0xFE, 0xBA, 0xBE, 0, 0, 0, 52, 0, 2, 1];
        bytes.extend_from_slice(&(name.len() as u16).to_be_bytes());
        bytes.extend_from_slice(name.as_bytes());
        bytes
    }

    fn write_jar(path: &Path, classes: &[&str]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        let options = SimpleFileOptions::default();
        zip.start_file("META-INF/MANIFEST.MF", options).unwrap();
        zip.write_all(b"Manifest-Version: 1.0\n").unwrap();
        zip.start_file("META-INF/SIGNER.SF", options).unwrap();
        zip.write_all(b"sig").unwrap();
        for class in classes {
            zip.start_file(format!("{}.class", class), options).unwrap();
            zip.write_all(&class_bytes(class)).unwrap();
        }
        zip.finish().unwrap();
    }

    fn artifact(dir: &Path, descriptor: LibraryDescriptor, classes: &[&str]) -> ResolvedArtifact {
        let path = dir.join(descriptor.file_name());
        write_jar(&path, classes);
        let bytes = fs::read(&path).unwrap();
        ResolvedArtifact {
            descriptor,
            sha256: sha256_hex(&bytes),
            size: bytes.len() as u64,
            path,
            source: "test".to_string(),
        }
    }

    fn driver_descriptor() -> LibraryDescriptor {
        LibraryDescriptor::new(
            "duckdb",
            "org.duckdb",
            "duckdb_jdbc",
            "1.1.3",
            Capability::Driver(BackendKind::EmbeddedMemory),
        )
        .relocate("org.duckdb", "duckdb")
        .with_entry_point("org.duckdb.DuckDBDriver")
    }

    #[test]
    fn test_load_driver_library() {
        let dir = tempdir().unwrap();
        let art = artifact(
            dir.path(),
            driver_descriptor(),
            &["org/duckdb/DuckDBDriver", "org/duckdb/DuckDBConnection"],
        );
        let loader = Loader::new(dir.path(), DEFAULT_NAMESPACE);
        let handle = loader.load(&art).unwrap();

        assert!(handle.path().starts_with(dir.path().join("isolated/duckdb")));
        assert!(handle.contains_class("org.duckdb.DuckDBDriver"));
        assert!(handle.contains_class("hoststore.libs.duckdb.DuckDBConnection"));
        assert!(!handle.contains_class("org.duckdb.Missing"));
        assert_eq!(handle.class_count(), 2);

        let driver = handle.driver().unwrap();
        assert_eq!(driver.backend, BackendKind::EmbeddedMemory);
        assert_eq!(driver.entry_point, "hoststore.libs.duckdb.DuckDBDriver");

        // signature files do not survive relocation
        let archive = ZipArchive::new(File::open(handle.path()).unwrap()).unwrap();
        assert!(archive.file_names().all(|n| !n.ends_with(".SF")));

        // memoized per id
        assert!(Arc::ptr_eq(&handle, &loader.load(&art).unwrap()));
    }

    #[test]
    fn test_missing_entry_point_is_corrupt() {
        let dir = tempdir().unwrap();
        let art = artifact(dir.path(), driver_descriptor(), &["org/duckdb/Other"]);
        let loader = Loader::new(dir.path(), DEFAULT_NAMESPACE);
        assert!(matches!(
            loader.load(&art),
            Err(ProvisioningError::CorruptArtifact { .. })
        ));
        assert!(loader.get("duckdb").is_none());
    }

    #[test]
    fn test_garbage_archive_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.jar");
        fs::write(&path, b"definitely not a zip").unwrap();
        let art = ResolvedArtifact {
            descriptor: driver_descriptor(),
            path,
            sha256: "00".to_string(),
            size: 20,
            source: "test".to_string(),
        };
        let loader = Loader::new(dir.path(), DEFAULT_NAMESPACE);
        assert!(matches!(
            loader.load(&art),
            Err(ProvisioningError::CorruptArtifact { .. })
        ));
    }

    #[test]
    fn test_relocated_copy_reused_across_loaders() {
        let dir = tempdir().unwrap();
        let art = artifact(dir.path(), driver_descriptor(), &["org/duckdb/DuckDBDriver"]);
        let first = Loader::new(dir.path(), DEFAULT_NAMESPACE).load(&art).unwrap();
        let second = Loader::new(dir.path(), DEFAULT_NAMESPACE).load(&art).unwrap();
        assert_eq!(first.path(), second.path());
        assert_eq!(
            first.classes().collect::<Vec<_>>(),
            second.classes().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_non_driver_library_has_no_driver() {
        let dir = tempdir().unwrap();
        let descriptor = LibraryDescriptor::new(
            "bstats-base",
            "org.bstats",
            "bstats-base",
            "3.1.0",
            Capability::Metrics,
        )
        .relocate("org.bstats", "bstats");
        let art = artifact(dir.path(), descriptor, &["org/bstats/MetricsBase"]);
        let handle = Loader::new(dir.path(), DEFAULT_NAMESPACE).load(&art).unwrap();
        assert!(handle.driver().is_none());
        assert_eq!(handle.capability(), Capability::Metrics);
        assert_eq!(
            handle.relocated_name("org.bstats.MetricsBase"),
            "hoststore.libs.bstats.MetricsBase"
        );
    }
}
