//! Library descriptor registry
//!
//! Static table of the optional libraries hoststore may provision. Nothing in
//! this table is bundled with the host; each entry is fetched, verified and
//! relocated only when a feature actually needs it.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::Serialize;

use crate::database::BackendKind;
use crate::error::ProvisioningError;

/// Maven Central, the default repository for every built-in library
pub const MAVEN_CENTRAL: &str = "https://repo1.maven.org/maven2/";

/// What a provisioned library is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "type", content = "backend")]
pub enum Capability {
    /// Storage driver for the given engine
    Driver(BackendKind),
    Reflection,
    Metrics,
    Bytecode,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Driver(kind) => write!(f, "driver ({})", kind),
            Capability::Reflection => write!(f, "reflection"),
            Capability::Metrics => write!(f, "metrics"),
            Capability::Bytecode => write!(f, "bytecode"),
        }
    }
}

/// Package relocation: `from` (dotted package) moves to `{namespace}.{to}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Relocation {
    pub from: String,
    pub to: String,
}

impl Relocation {
    pub fn new(from: &str, to: &str) -> Self {
        Relocation {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

/// Immutable description of one optional library
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LibraryDescriptor {
    pub id: String,
    pub group: String,
    pub artifact: String,
    pub version: String,
    /// Preferred repository, tried before the configured mirrors
    pub repository: Option<String>,
    pub relocations: Vec<Relocation>,
    /// Ids of libraries that must be provisioned first
    pub dependencies: Vec<String>,
    /// `group:artifact` coordinates never pulled in on this library's behalf
    pub excludes: Vec<String>,
    /// Expected SHA-256 of the artifact, lowercase hex
    pub sha256: Option<String>,
    /// Class that must be present after relocation (original, dotted name)
    pub entry_point: Option<String>,
    pub capability: Capability,
}

impl LibraryDescriptor {
    pub fn new(id: &str, group: &str, artifact: &str, version: &str, capability: Capability) -> Self {
        LibraryDescriptor {
            id: id.to_string(),
            group: group.to_string(),
            artifact: artifact.to_string(),
            version: version.to_string(),
            repository: None,
            relocations: vec![],
            dependencies: vec![],
            excludes: vec![],
            sha256: None,
            entry_point: None,
            capability,
        }
    }

    pub fn with_repository(mut self, repository: &str) -> Self {
        self.repository = Some(repository.to_string());
        self
    }

    pub fn relocate(mut self, from: &str, to: &str) -> Self {
        self.relocations.push(Relocation::new(from, to));
        self
    }

    pub fn depends_on(mut self, id: &str) -> Self {
        self.dependencies.push(id.to_string());
        self
    }

    pub fn exclude(mut self, coordinate: &str) -> Self {
        self.excludes.push(coordinate.to_string());
        self
    }

    pub fn with_sha256(mut self, sha256: &str) -> Self {
        self.sha256 = Some(sha256.to_lowercase());
        self
    }

    pub fn with_entry_point(mut self, class: &str) -> Self {
        self.entry_point = Some(class.to_string());
        self
    }

    /// `group:artifact:version`
    pub fn coordinate(&self) -> String {
        format!("{}:{}:{}", self.group, self.artifact, self.version)
    }

    /// `group:artifact`, the form used in exclusion lists
    pub fn module(&self) -> String {
        format!("{}:{}", self.group, self.artifact)
    }

    pub fn file_name(&self) -> String {
        format!("{}-{}.jar", self.artifact, self.version)
    }

    /// Path of the artifact relative to a Maven-layout repository root
    pub fn repository_path(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.group.replace('.', "/"),
            self.artifact,
            self.version,
            self.file_name()
        )
    }

    /// Name of the per-coordinate cache directory
    pub fn cache_dir_name(&self) -> String {
        format!("{}_{}_{}", self.group, self.artifact, self.version)
    }
}

/// The built-in optional libraries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeLibrary {
    Javassist,
    Reflections,
    BstatsBase,
    DuckDb,
    Postgresql,
}

impl RuntimeLibrary {
    pub fn all() -> [RuntimeLibrary; 5] {
        [
            RuntimeLibrary::Javassist,
            RuntimeLibrary::Reflections,
            RuntimeLibrary::BstatsBase,
            RuntimeLibrary::DuckDb,
            RuntimeLibrary::Postgresql,
        ]
    }

    pub fn id(&self) -> &'static str {
        match self {
            RuntimeLibrary::Javassist => "javassist",
            RuntimeLibrary::Reflections => "reflections",
            RuntimeLibrary::BstatsBase => "bstats-base",
            RuntimeLibrary::DuckDb => "duckdb",
            RuntimeLibrary::Postgresql => "postgresql",
        }
    }

    pub fn from_id(id: &str) -> Option<RuntimeLibrary> {
        RuntimeLibrary::all()
            .into_iter()
            .find(|lib| lib.id().eq_ignore_ascii_case(id))
    }

    pub fn descriptor(&self) -> LibraryDescriptor {
        match self {
            RuntimeLibrary::Javassist => LibraryDescriptor::new(
                self.id(),
                "org.javassist",
                "javassist",
                "3.28.0-GA",
                Capability::Bytecode,
            )
            .with_repository(MAVEN_CENTRAL)
            .relocate("javassist", "javassist")
            .with_entry_point("javassist.ClassPool"),
            RuntimeLibrary::Reflections => LibraryDescriptor::new(
                self.id(),
                "org.reflections",
                "reflections",
                "0.10.2",
                Capability::Reflection,
            )
            .with_repository(MAVEN_CENTRAL)
            .relocate("javassist", "javassist")
            .relocate("org.reflections", "reflections")
            .depends_on(RuntimeLibrary::Javassist.id())
            .exclude("org.slf4j:slf4j-api")
            .with_entry_point("org.reflections.Reflections"),
            RuntimeLibrary::BstatsBase => LibraryDescriptor::new(
                self.id(),
                "org.bstats",
                "bstats-base",
                "3.1.0",
                Capability::Metrics,
            )
            .with_repository(MAVEN_CENTRAL)
            .relocate("org.bstats", "bstats"),
            RuntimeLibrary::DuckDb => LibraryDescriptor::new(
                self.id(),
                "org.duckdb",
                "duckdb_jdbc",
                "1.1.3",
                Capability::Driver(BackendKind::EmbeddedMemory),
            )
            .with_repository(MAVEN_CENTRAL)
            .relocate("org.duckdb", "duckdb")
            .with_entry_point("org.duckdb.DuckDBDriver"),
            RuntimeLibrary::Postgresql => LibraryDescriptor::new(
                self.id(),
                "org.postgresql",
                "postgresql",
                "42.7.7",
                Capability::Driver(BackendKind::NetworkedEngineB),
            )
            .with_repository(MAVEN_CENTRAL)
            .relocate("org.postgresql", "postgresql")
            .with_entry_point("org.postgresql.Driver"),
        }
    }
}

impl fmt::Display for RuntimeLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// Lookup table of descriptors by id
#[derive(Debug, Clone, Default)]
pub struct Registry {
    descriptors: BTreeMap<String, LibraryDescriptor>,
}

impl Registry {
    /// Registry holding every [`RuntimeLibrary`]
    pub fn builtin() -> Self {
        Registry::new(RuntimeLibrary::all().iter().map(|lib| lib.descriptor()))
    }

    pub fn new(descriptors: impl IntoIterator<Item = LibraryDescriptor>) -> Self {
        Registry {
            descriptors: descriptors
                .into_iter()
                .map(|d| (d.id.clone(), d))
                .collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&LibraryDescriptor> {
        self.descriptors.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LibraryDescriptor> {
        self.descriptors.values()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// `id` and its transitive dependencies, dependencies first
    ///
    /// Dependencies whose `group:artifact` appears in the requesting
    /// library's exclusion list are skipped.
    pub fn provisioning_order(&self, id: &str) -> Result<Vec<&LibraryDescriptor>, ProvisioningError> {
        let mut order = vec![];
        let mut visiting = HashSet::new();
        let mut done = HashSet::new();
        self.visit(id, &mut visiting, &mut done, &mut order)?;
        Ok(order)
    }

    fn visit<'a>(
        &'a self,
        id: &str,
        visiting: &mut HashSet<String>,
        done: &mut HashSet<String>,
        order: &mut Vec<&'a LibraryDescriptor>,
    ) -> Result<(), ProvisioningError> {
        if done.contains(id) {
            return Ok(());
        }
        let descriptor = self.get(id).ok_or_else(|| ProvisioningError::NotFound {
            coordinate: id.to_string(),
        })?;
        if !visiting.insert(id.to_string()) {
            return Err(ProvisioningError::CorruptArtifact {
                coordinate: descriptor.coordinate(),
                reason: "dependency cycle".to_string(),
            });
        }

        for dep in &descriptor.dependencies {
            let excluded = self
                .get(dep)
                .is_some_and(|d| descriptor.excludes.contains(&d.module()));
            if !excluded {
                self.visit(dep, visiting, done, order)?;
            }
        }

        visiting.remove(id);
        done.insert(id.to_string());
        order.push(descriptor);
        Ok(())
    }
}
