//! Package relocation for archive artifacts
//!
//! Moves every class of a relocated package into a private namespace so two
//! plugins bundling different versions of one library can never collide:
//!
//! - entry paths under a relocated package are renamed,
//! - `.class` entries get their constant-pool UTF-8 strings rewritten, in both
//!   internal (`a/b/`) and dotted (`a.b.`) form,
//! - `META-INF/services/<type>` files are renamed and their contents rewritten,
//! - signature files are dropped, since relocation invalidates them.
//!
//! Everything else is copied verbatim.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::libraries::registry::Relocation;

const CLASS_MAGIC: [u8; 4] = [0xCA, 0xFE, 0xBA, 0xBE];
const SERVICES_DIR: &str = "META-INF/services/";
const VERSIONS_DIR: &str = "META-INF/versions/";

/// Largest entry read into memory while relocating
const MAX_ENTRY_BYTES: u64 = 64 * 1024 * 1024;
/// Upper bound on the buffer reserved from an entry's declared size
const MAX_PREALLOC: u64 = 1024 * 1024;

#[derive(Error, Debug)]
pub enum RelocationError {
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed class file {entry}: {reason}")]
    MalformedClass { entry: String, reason: String },

    #[error("archive entry {entry} exceeds {limit} bytes")]
    EntryTooLarge { entry: String, limit: u64 },
}

/// Read one archive entry, refusing more than `limit` bytes whatever its
/// header declares
fn read_entry(
    reader: impl Read,
    entry: &str,
    declared: u64,
    limit: u64,
) -> Result<Vec<u8>, RelocationError> {
    let mut content = Vec::with_capacity(declared.min(limit).min(MAX_PREALLOC) as usize);
    reader.take(limit + 1).read_to_end(&mut content)?;
    if content.len() as u64 > limit {
        return Err(RelocationError::EntryTooLarge {
            entry: entry.to_string(),
            limit,
        });
    }
    Ok(content)
}

/// One compiled relocation rule
#[derive(Debug, Clone)]
struct Rule {
    /// `org/example`
    from_internal: String,
    /// `org.example`
    from_dotted: String,
    /// `ns/path/example`
    to_internal: String,
    /// `ns.path.example`
    to_dotted: String,
}

/// What [`Relocator::relocate_archive`] did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelocationSummary {
    pub entries: usize,
    /// Every class in the output archive, dotted and relocated
    pub classes: Vec<String>,
    /// Class files whose constant pool changed
    pub rewritten_classes: usize,
    pub renamed_entries: usize,
    pub dropped_entries: usize,
    /// Relocated service registration types
    pub services: Vec<String>,
}

pub struct Relocator {
    rules: Vec<Rule>,
}

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

/// Whether a package reference may start at `i`: not preceded by more of a
/// name, except for the `L` of a field descriptor
fn at_boundary(bytes: &[u8], i: usize) -> bool {
    if i == 0 {
        return true;
    }
    let prev = bytes[i - 1];
    if !is_ident(prev) && prev != b'/' && prev != b'.' {
        return true;
    }
    prev == b'L'
        && (i == 1
            || matches!(
                bytes[i - 2],
                b'(' | b')' | b';' | b'[' | b'<' | b':' | b'+' | b'-'
            ))
}

fn is_signature_file(name: &str) -> bool {
    let Some(file) = name.strip_prefix("META-INF/") else {
        return false;
    };
    if file.contains('/') {
        return false;
    }
    let upper = file.to_ascii_uppercase();
    [".SF", ".RSA", ".DSA", ".EC"]
        .iter()
        .any(|ext| upper.ends_with(ext))
}

impl Relocator {
    /// Compile `relocations` so each `from` package lands under `namespace`
    pub fn new(namespace: &str, relocations: &[Relocation]) -> Self {
        let namespace = namespace.trim_matches('.');
        let mut rules: Vec<Rule> = relocations
            .iter()
            .map(|r| {
                let from = r.from.trim_matches('.');
                let to_dotted = if namespace.is_empty() {
                    r.to.trim_matches('.').to_string()
                } else {
                    format!("{}.{}", namespace, r.to.trim_matches('.'))
                };
                Rule {
                    from_internal: from.replace('.', "/"),
                    from_dotted: from.to_string(),
                    to_internal: to_dotted.replace('.', "/"),
                    to_dotted,
                }
            })
            .collect();
        // most specific package wins
        rules.sort_by(|a, b| b.from_dotted.len().cmp(&a.from_dotted.len()));
        Relocator { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Relocated form of a dotted class or package name
    pub fn relocate_name(&self, dotted: &str) -> String {
        for rule in &self.rules {
            if dotted == rule.from_dotted {
                return rule.to_dotted.clone();
            }
            if let Some(rest) = dotted
                .strip_prefix(rule.from_dotted.as_str())
                .and_then(|r| r.strip_prefix('.'))
            {
                return format!("{}.{}", rule.to_dotted, rest);
            }
        }
        dotted.to_string()
    }

    /// Relocated form of an archive entry path
    pub fn relocate_path(&self, entry: &str) -> String {
        if let Some(rest) = entry.strip_prefix(VERSIONS_DIR) {
            if let Some((version, inner)) = rest.split_once('/') {
                return format!("{}{}/{}", VERSIONS_DIR, version, self.relocate_path(inner));
            }
        }
        if let Some(service) = entry.strip_prefix(SERVICES_DIR) {
            return format!("{}{}", SERVICES_DIR, self.relocate_name(service));
        }
        for rule in &self.rules {
            if let Some(rest) = entry
                .strip_prefix(rule.from_internal.as_str())
                .and_then(|r| r.strip_prefix('/'))
            {
                return format!("{}/{}", rule.to_internal, rest);
            }
        }
        entry.to_string()
    }

    /// Rewrite package references inside one string; `None` when unchanged
    fn rewrite_bytes(&self, input: &[u8]) -> Option<Vec<u8>> {
        for rule in &self.rules {
            if input == rule.from_internal.as_bytes() {
                return Some(rule.to_internal.as_bytes().to_vec());
            }
            if input == rule.from_dotted.as_bytes() {
                return Some(rule.to_dotted.as_bytes().to_vec());
            }
        }

        let mut out = Vec::with_capacity(input.len());
        let mut changed = false;
        let mut i = 0;
        'scan: while i < input.len() {
            if at_boundary(input, i) {
                for rule in &self.rules {
                    for (from, to, sep) in [
                        (&rule.from_internal, &rule.to_internal, b'/'),
                        (&rule.from_dotted, &rule.to_dotted, b'.'),
                    ] {
                        let from = from.as_bytes();
                        let end = i + from.len();
                        if input.len() > end
                            && &input[i..end] == from
                            && input[end] == sep
                        {
                            out.extend_from_slice(to.as_bytes());
                            out.push(sep);
                            i = end + 1;
                            changed = true;
                            continue 'scan;
                        }
                    }
                }
            }
            out.push(input[i]);
            i += 1;
        }
        changed.then_some(out)
    }

    /// Rewrite the constant pool of one class file
    ///
    /// Returns the new bytes and whether anything changed.
    pub fn rewrite_class(&self, entry: &str, class: &[u8]) -> Result<(Vec<u8>, bool), RelocationError> {
        let malformed = |reason: &str| RelocationError::MalformedClass {
            entry: entry.to_string(),
            reason: reason.to_string(),
        };

        if class.len() < 10 || class[0..4] != CLASS_MAGIC {
            return Err(malformed("bad magic"));
        }
        let count = u16::from_be_bytes([class[8], class[9]]) as usize;

        let mut out = Vec::with_capacity(class.len() + 64);
        out.extend_from_slice(&class[..10]);
        let mut pos = 10;
        let mut changed = false;
        let mut index = 1;

        let take = |pos: usize, len: usize| -> Result<&[u8], RelocationError> {
            class
                .get(pos..pos + len)
                .ok_or_else(|| malformed("truncated constant pool"))
        };

        while index < count {
            let tag = *take(pos, 1)?.first().ok_or_else(|| malformed("truncated"))?;
            let (size, slots) = match tag {
                1 => {
                    let len_bytes = take(pos + 1, 2)?;
                    let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
                    let text = take(pos + 3, len)?;
                    match self.rewrite_bytes(text) {
                        Some(new_text) => {
                            let new_len = u16::try_from(new_text.len())
                                .map_err(|_| malformed("relocated string exceeds 65535 bytes"))?;
                            out.push(1);
                            out.extend_from_slice(&new_len.to_be_bytes());
                            out.extend_from_slice(&new_text);
                            changed = true;
                        }
                        None => out.extend_from_slice(take(pos, 3 + len)?),
                    }
                    pos += 3 + len;
                    index += 1;
                    continue;
                }
                7 | 8 | 16 | 19 | 20 => (3, 1),
                15 => (4, 1),
                3 | 4 | 9 | 10 | 11 | 12 | 17 | 18 => (5, 1),
                5 | 6 => (9, 2),
                other => return Err(malformed(&format!("unknown constant tag {}", other))),
            };
            out.extend_from_slice(take(pos, size)?);
            pos += size;
            index += slots;
        }

        out.extend_from_slice(class.get(pos..).ok_or_else(|| malformed("truncated"))?);
        Ok((out, changed))
    }

    fn rewrite_service(&self, content: &[u8]) -> Vec<u8> {
        let text = String::from_utf8_lossy(content);
        let mut out = String::with_capacity(text.len());
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                out.push_str(line);
            } else {
                out.push_str(&self.relocate_name(trimmed));
            }
            out.push('\n');
        }
        out.into_bytes()
    }

    /// Relocate the archive at `input`, writing the result to `output`
    pub fn relocate_archive(
        &self,
        input: &Path,
        output: &Path,
    ) -> Result<RelocationSummary, RelocationError> {
        let mut archive = ZipArchive::new(File::open(input)?)?;
        let mut writer = ZipWriter::new(File::create(output)?);
        let options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut summary = RelocationSummary::default();

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            let name = entry.name().to_string();

            if is_signature_file(&name) {
                summary.dropped_entries += 1;
                continue;
            }

            let new_name = self.relocate_path(&name);
            if new_name != name {
                summary.renamed_entries += 1;
            }

            if entry.is_dir() {
                writer.add_directory(new_name, options)?;
                summary.entries += 1;
                continue;
            }

            let declared = entry.size();
            let content = read_entry(&mut entry, &name, declared, MAX_ENTRY_BYTES)?;

            let content = if name.ends_with(".class") {
                let (bytes, changed) = self.rewrite_class(&name, &content)?;
                if changed {
                    summary.rewritten_classes += 1;
                }
                if let Some(class) = class_name(&new_name) {
                    summary.classes.push(class);
                }
                bytes
            } else if let Some(service) = new_name.strip_prefix(SERVICES_DIR) {
                if !service.is_empty() {
                    summary.services.push(service.to_string());
                }
                self.rewrite_service(&content)
            } else {
                content
            };

            writer.start_file(new_name, options)?;
            writer.write_all(&content)?;
            summary.entries += 1;
        }

        writer.finish()?;
        summary.classes.sort();
        Ok(summary)
    }
}

/// Dotted class name of a `.class` entry, ignoring `module-info` and
/// multi-release prefixes
pub fn class_name(entry: &str) -> Option<String> {
    let path = match entry.strip_prefix(VERSIONS_DIR) {
        Some(rest) => rest.split_once('/')?.1,
        None => entry,
    };
    let stem = path.strip_suffix(".class")?;
    if stem.ends_with("module-info") || stem.ends_with("package-info") {
        return None;
    }
    Some(stem.replace('/', "."))
}
