//! Dependency resolver/downloader
//!
//! Resolves a [`LibraryDescriptor`] to a verified artifact file in the local
//! cache, downloading it from the first repository that has it. Concurrent
//! first-time requests for one coordinate share a single in-flight download.
//!
//! Cache layout:
//!
//! ```text
//! {cache}/
//! └── {group}_{artifact}_{version}/
//!     ├── {artifact}-{version}.jar
//!     └── {artifact}-{version}.jar.sha256
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::ProvisioningError;
use crate::libraries::registry::LibraryDescriptor;
use crate::libraries::repository::{source_for, ArtifactSource, FetchError};

/// Source name recorded for artifacts served from the local cache
pub const CACHE_SOURCE: &str = "cache";

pub const DEFAULT_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// A verified artifact on local disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedArtifact {
    pub descriptor: LibraryDescriptor,
    pub path: PathBuf,
    pub sha256: String,
    pub size: u64,
    /// Repository the bytes came from, or `cache`
    pub source: String,
}

type Slot = Arc<OnceLock<Result<Arc<ResolvedArtifact>, ProvisioningError>>>;

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub struct Resolver {
    cache_dir: PathBuf,
    mirrors: Vec<Box<dyn ArtifactSource>>,
    attempts: u32,
    backoff: Duration,
    fetch_timeout: Duration,
    memo: Mutex<HashMap<String, Arc<ResolvedArtifact>>>,
    inflight: Mutex<HashMap<String, Slot>>,
    downloads: AtomicUsize,
    temp_counter: AtomicUsize,
}

impl Resolver {
    pub fn new(cache_dir: impl Into<PathBuf>, mirrors: Vec<Box<dyn ArtifactSource>>) -> Self {
        Resolver {
            cache_dir: cache_dir.into(),
            mirrors,
            attempts: DEFAULT_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            memo: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            downloads: AtomicUsize::new(0),
            temp_counter: AtomicUsize::new(0),
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Number of artifacts actually downloaded (cache hits excluded)
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    /// Whether `descriptor` has already been resolved in this process
    pub fn is_resolved(&self, descriptor: &LibraryDescriptor) -> bool {
        self.memo.lock().contains_key(&descriptor.coordinate())
    }

    /// Resolve `descriptor` to a verified local artifact
    pub fn resolve(
        &self,
        descriptor: &LibraryDescriptor,
    ) -> Result<Arc<ResolvedArtifact>, ProvisioningError> {
        let coordinate = descriptor.coordinate();
        if let Some(hit) = self.memo.lock().get(&coordinate) {
            return Ok(Arc::clone(hit));
        }

        let slot = Arc::clone(
            self.inflight
                .lock()
                .entry(coordinate.clone())
                .or_insert_with(|| Arc::new(OnceLock::new())),
        );
        let result = slot.get_or_init(|| self.resolve_uncached(descriptor)).clone();

        if let Ok(artifact) = &result {
            self.memo
                .lock()
                .insert(coordinate.clone(), Arc::clone(artifact));
        }
        let mut inflight = self.inflight.lock();
        if inflight
            .get(&coordinate)
            .is_some_and(|current| Arc::ptr_eq(current, &slot))
        {
            inflight.remove(&coordinate);
        }
        result
    }

    fn artifact_paths(&self, descriptor: &LibraryDescriptor) -> (PathBuf, PathBuf, PathBuf) {
        let dir = self.cache_dir.join(descriptor.cache_dir_name());
        let file = dir.join(descriptor.file_name());
        let sidecar = dir.join(format!("{}.sha256", descriptor.file_name()));
        (dir, file, sidecar)
    }

    /// Ordered sources for `descriptor`: preferred repository, then mirrors
    fn sources_for<'a>(
        &'a self,
        descriptor: &LibraryDescriptor,
        preferred: &'a Option<Box<dyn ArtifactSource>>,
    ) -> Vec<&'a dyn ArtifactSource> {
        let mut sources: Vec<&dyn ArtifactSource> = vec![];
        if let Some(p) = preferred {
            sources.push(p.as_ref());
        }
        for mirror in &self.mirrors {
            if !sources.iter().any(|s| s.name() == mirror.name()) {
                sources.push(mirror.as_ref());
            }
        }
        debug!(
            "{} sources for {}",
            sources.len(),
            descriptor.coordinate()
        );
        sources
    }

    fn resolve_uncached(
        &self,
        descriptor: &LibraryDescriptor,
    ) -> Result<Arc<ResolvedArtifact>, ProvisioningError> {
        let coordinate = descriptor.coordinate();
        let (dir, file, sidecar) = self.artifact_paths(descriptor);

        if let Some(cached) = self.check_cache(descriptor, &file, &sidecar) {
            debug!("{} served from cache", coordinate);
            return Ok(Arc::new(cached));
        }

        let preferred = descriptor
            .repository
            .as_deref()
            .map(|r| source_for(r, self.fetch_timeout));
        let sources = self.sources_for(descriptor, &preferred);
        if sources.is_empty() {
            return Err(ProvisioningError::Unreachable {
                coordinate,
                reason: "no repositories configured".to_string(),
            });
        }

        let path = descriptor.repository_path();
        let mut mismatch: Option<(String, String)> = None;
        let mut last_failure: Option<String> = None;

        for attempt in 1..=self.attempts {
            let mut all_not_found = true;
            for source in &sources {
                match source.fetch(&path) {
                    Ok(bytes) => {
                        let digest = sha256_hex(&bytes);
                        if let Some(expected) = &descriptor.sha256 {
                            if *expected != digest {
                                warn!(
                                    "{} from {} failed checksum verification",
                                    coordinate,
                                    source.name()
                                );
                                all_not_found = false;
                                mismatch = Some((expected.clone(), digest));
                                continue;
                            }
                        }
                        self.downloads.fetch_add(1, Ordering::SeqCst);
                        info!("downloaded {} from {}", coordinate, source.name());
                        return self
                            .store(descriptor, &dir, &file, &sidecar, &bytes, digest, source.name())
                            .map(Arc::new);
                    }
                    Err(FetchError::NotFound) => {
                        debug!("{} not found in {}", coordinate, source.name());
                    }
                    Err(e) => {
                        all_not_found = false;
                        debug!("fetching {} from {} failed: {}", coordinate, source.name(), e);
                        last_failure = Some(format!("{}: {}", source.name(), e));
                    }
                }
            }

            if all_not_found {
                return Err(ProvisioningError::NotFound { coordinate });
            }
            if attempt < self.attempts {
                std::thread::sleep(self.backoff * attempt);
            }
        }

        match (mismatch, last_failure) {
            (Some((expected, actual)), _) => Err(ProvisioningError::ChecksumMismatch {
                coordinate,
                expected,
                actual,
            }),
            (None, reason) => Err(ProvisioningError::Unreachable {
                coordinate,
                reason: reason.unwrap_or_else(|| "all repositories failed".to_string()),
            }),
        }
    }

    /// Validate an existing cache entry, discarding it when invalid
    fn check_cache(
        &self,
        descriptor: &LibraryDescriptor,
        file: &Path,
        sidecar: &Path,
    ) -> Option<ResolvedArtifact> {
        if !file.exists() {
            return None;
        }
        let discard = |reason: &str| {
            warn!(
                "discarding cached {} ({})",
                descriptor.coordinate(),
                reason
            );
            let _ = fs::remove_file(file);
            let _ = fs::remove_file(sidecar);
            None
        };

        let recorded = match fs::read_to_string(sidecar) {
            Ok(s) => s.trim().to_lowercase(),
            Err(_) => return discard("missing checksum sidecar"),
        };
        let bytes = match fs::read(file) {
            Ok(b) => b,
            Err(_) => return discard("unreadable artifact"),
        };
        let actual = sha256_hex(&bytes);
        if actual != recorded {
            return discard("checksum does not match sidecar");
        }
        if descriptor.sha256.as_ref().is_some_and(|e| *e != actual) {
            return discard("checksum does not match the expected digest");
        }

        Some(ResolvedArtifact {
            descriptor: descriptor.clone(),
            path: file.to_path_buf(),
            sha256: actual,
            size: bytes.len() as u64,
            source: CACHE_SOURCE.to_string(),
        })
    }

    fn temp_path(&self, dir: &Path, name: &str) -> PathBuf {
        let n = self.temp_counter.fetch_add(1, Ordering::SeqCst);
        dir.join(format!(".{}.{}.{}.tmp", name, std::process::id(), n))
    }

    fn write_atomic(&self, dir: &Path, target: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = self.temp_path(dir, &name);
        fs::write(&temp, bytes)?;
        fs::rename(&temp, target).inspect_err(|_| {
            let _ = fs::remove_file(&temp);
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn store(
        &self,
        descriptor: &LibraryDescriptor,
        dir: &Path,
        file: &Path,
        sidecar: &Path,
        bytes: &[u8],
        digest: String,
        source: &str,
    ) -> Result<ResolvedArtifact, ProvisioningError> {
        let failed = |e: std::io::Error| ProvisioningError::Unreachable {
            coordinate: descriptor.coordinate(),
            reason: format!("cannot write to cache {}: {}", dir.display(), e),
        };
        fs::create_dir_all(dir).map_err(failed)?;
        self.write_atomic(dir, file, bytes).map_err(failed)?;
        self.write_atomic(dir, sidecar, digest.as_bytes())
            .map_err(failed)?;

        Ok(ResolvedArtifact {
            descriptor: descriptor.clone(),
            path: file.to_path_buf(),
            sha256: digest,
            size: bytes.len() as u64,
            source: source.to_string(),
        })
    }
}
