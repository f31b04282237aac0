//! Shared fixtures: minimal class files, jars and a local repository

#![allow(dead_code)]

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use hoststore::libraries::{
    LibraryDescriptor, LocalRepository, Loader, Provisioner, Registry, Resolver, RuntimeLibrary,
    DEFAULT_NAMESPACE,
};
use zip::write::SimpleFileOptions;

/// A class file whose constant pool holds one Utf8 entry per string
pub fn class_file(strings: &[&str]) -> Vec<u8> {
    let mut bytes = vec![0xCA, 0xFE, 0xBA, 0xBE, 0, 0, 0, 52];
    bytes.extend_from_slice(&((strings.len() + 1) as u16).to_be_bytes());
    for s in strings {
        bytes.push(1);
        bytes.extend_from_slice(&(s.len() as u16).to_be_bytes());
        bytes.extend_from_slice(s.as_bytes());
    }
    // access flags, this, super, no interfaces/fields/methods/attributes
    bytes.extend_from_slice(&[0, 0x21, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    bytes
}

pub fn write_jar(path: &Path, entries: &[(&str, Vec<u8>)]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
    for (name, content) in entries {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(content).unwrap();
    }
    zip.finish().unwrap();
}

/// A jar holding one trivial class per internal name
pub fn classes_jar(path: &Path, classes: &[&str]) {
    let entries: Vec<(String, Vec<u8>)> = classes
        .iter()
        .map(|c| (format!("{}.class", c), class_file(&[c])))
        .collect();
    let refs: Vec<(&str, Vec<u8>)> = entries
        .iter()
        .map(|(n, b)| (n.as_str(), b.clone()))
        .collect();
    write_jar(path, &refs);
}

/// Place a jar where a Maven-layout repository rooted at `repo` serves `descriptor`
pub fn publish(repo: &Path, descriptor: &LibraryDescriptor, entries: &[(&str, Vec<u8>)]) {
    let path = descriptor
        .repository_path()
        .split('/')
        .fold(repo.to_path_buf(), |acc, p| acc.join(p));
    write_jar(&path, entries);
}

pub fn published_bytes(repo: &Path, descriptor: &LibraryDescriptor) -> Vec<u8> {
    let path = descriptor
        .repository_path()
        .split('/')
        .fold(repo.to_path_buf(), |acc, p| acc.join(p));
    fs::read(path).unwrap()
}

/// A builtin descriptor with its preferred remote repository removed
pub fn local(lib: RuntimeLibrary) -> LibraryDescriptor {
    let mut descriptor = lib.descriptor();
    descriptor.repository = None;
    descriptor.sha256 = None;
    descriptor
}

pub fn resolver(repo: &Path, cache: &Path) -> Resolver {
    Resolver::new(cache, vec![Box::new(LocalRepository::new(repo))])
        .with_attempts(1)
        .with_backoff(std::time::Duration::ZERO)
}

pub fn provisioner(repo: &Path, cache: &Path, registry: Registry) -> Provisioner {
    Provisioner::from_parts(
        registry,
        resolver(repo, cache),
        Loader::new(cache, DEFAULT_NAMESPACE),
    )
}
