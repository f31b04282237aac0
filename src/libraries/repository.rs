//! Artifact sources
//!
//! A repository is anything that can hand back the bytes stored under a
//! Maven-layout path: an HTTP(S) mirror or a local directory.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Largest artifact accepted from a repository
const MAX_ARTIFACT_SIZE: u64 = 256 * 1024 * 1024;

const USER_AGENT: &str = concat!("hoststore/", env!("CARGO_PKG_VERSION"));

/// Failure of a single fetch from a single repository
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("not found")]
    NotFound,

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("{0}")]
    Unreachable(String),
}

/// One place artifacts can be fetched from
pub trait ArtifactSource: Send + Sync {
    /// Human-readable location, used in logs and in resolved-artifact records
    fn name(&self) -> &str;

    /// Fetch the artifact stored at `path` (Maven layout, `/`-separated)
    fn fetch(&self, path: &str) -> Result<Vec<u8>, FetchError>;
}

/// Maven repository reachable over HTTP(S)
pub struct HttpRepository {
    base: String,
    agent: ureq::Agent,
}

impl HttpRepository {
    pub fn new(base: &str, timeout: Duration) -> Self {
        let mut base = base.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        HttpRepository { base, agent }
    }
}

impl ArtifactSource for HttpRepository {
    fn name(&self) -> &str {
        &self.base
    }

    fn fetch(&self, path: &str) -> Result<Vec<u8>, FetchError> {
        let url = format!("{}{}", self.base, path);
        debug!("fetching {}", url);
        let mut response = self
            .agent
            .get(&url)
            .header("User-Agent", USER_AGENT)
            .call()
            .map_err(|e| match e {
                ureq::Error::StatusCode(404) => FetchError::NotFound,
                ureq::Error::StatusCode(code) => FetchError::Status(code),
                other => FetchError::Unreachable(other.to_string()),
            })?;
        response
            .body_mut()
            .with_config()
            .limit(MAX_ARTIFACT_SIZE)
            .read_to_vec()
            .map_err(|e| FetchError::Unreachable(e.to_string()))
    }
}

/// Maven-layout directory on the local filesystem
pub struct LocalRepository {
    name: String,
    root: PathBuf,
}

impl LocalRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        LocalRepository {
            name: format!("file://{}", root.display()),
            root,
        }
    }
}

impl ArtifactSource for LocalRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, path: &str) -> Result<Vec<u8>, FetchError> {
        let file = path
            .split('/')
            .fold(self.root.clone(), |acc, part| acc.join(part));
        std::fs::read(&file).map_err(|e| match e.kind() {
            ErrorKind::NotFound => FetchError::NotFound,
            _ => FetchError::Unreachable(format!("{}: {}", file.display(), e)),
        })
    }
}

/// Build a source from a configured location: `http(s)://` URLs become
/// [`HttpRepository`], `file://` URLs and plain paths become [`LocalRepository`]
pub fn source_for(location: &str, timeout: Duration) -> Box<dyn ArtifactSource> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Box::new(HttpRepository::new(location, timeout))
    } else {
        let path = location.strip_prefix("file://").unwrap_or(location);
        Box::new(LocalRepository::new(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_local_repository_fetch() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("org/example/lib/1.0/lib-1.0.jar");
        std::fs::create_dir_all(artifact.parent().unwrap()).unwrap();
        std::fs::write(&artifact, b"jar bytes").unwrap();

        let repo = LocalRepository::new(dir.path());
        assert_eq!(
            repo.fetch("org/example/lib/1.0/lib-1.0.jar").unwrap(),
            b"jar bytes".to_vec()
        );
        assert_eq!(
            repo.fetch("org/example/lib/2.0/lib-2.0.jar"),
            Err(FetchError::NotFound)
        );
    }

    #[test]
    fn test_source_for_schemes() {
        let dir = tempdir().unwrap();
        let location = format!("file://{}", dir.path().display());
        let source = source_for(&location, Duration::from_secs(1));
        assert!(source.name().starts_with("file://"));

        let source = source_for("https://repo.example.org/maven2", Duration::from_secs(1));
        assert_eq!(source.name(), "https://repo.example.org/maven2/");
    }

    #[test]
    fn test_unreachable_http_repository() {
        let repo = HttpRepository::new("http://127.0.0.1:1/", Duration::from_secs(2));
        assert!(matches!(
            repo.fetch("a/b/1/b-1.jar"),
            Err(FetchError::Unreachable(_))
        ));
    }
}
