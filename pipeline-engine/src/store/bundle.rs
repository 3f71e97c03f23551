// File Bundles
// Deterministic tar bundles of workspace files captured for artifacts and caches

use crate::store::StoreError;
use crate::utils::build_glob_set;

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Component, Path};
use walkdir::WalkDir;

/// A set of files keyed by their workspace-relative path (always `/`-separated).
///
/// Encoding is deterministic: entries are written in path order with a zero
/// mtime and fixed ownership, so identical file sets produce identical bytes
/// and identical digests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bundle {
    files: BTreeMap<String, Vec<u8>>,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file
    pub fn insert(&mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.files.insert(normalize(&path.into()), content.into());
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Total size of the file contents in bytes
    pub fn content_size(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }

    /// Lay `other` over this bundle. Files present in both take the content of `other`.
    pub fn overlay(&mut self, other: Bundle) {
        self.files.extend(other.files);
    }

    /// Capture the files under `root` matching CI-style path patterns.
    ///
    /// A plain directory name captures everything below it. Patterns are
    /// matched against the path relative to `root`.
    pub fn collect(root: &Path, patterns: &[String]) -> Result<Self, StoreError> {
        let mut bundle = Bundle::new();
        if patterns.is_empty() || !root.is_dir() {
            return Ok(bundle);
        }

        let set = build_glob_set(patterns)
            .map_err(|e| StoreError::InvalidPattern(e.to_string()))?;

        for entry in WalkDir::new(root)
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git")
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = match entry.path().strip_prefix(root) {
                Ok(p) => p,
                Err(_) => continue,
            };
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if set.is_match(&rel) {
                let content = std::fs::read(entry.path())?;
                bundle.files.insert(rel, content);
            }
        }

        Ok(bundle)
    }

    /// Write every file of the bundle below `root`, creating directories as needed.
    ///
    /// Returns the number of files written.
    pub fn extract(&self, root: &Path) -> Result<usize, StoreError> {
        for (path, content) in &self.files {
            let rel = Path::new(path);
            if !is_safe_relative(rel) {
                return Err(StoreError::InvalidPath(path.clone()));
            }
            let dest = root.join(rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&dest, content)?;
        }
        Ok(self.files.len())
    }

    /// Encode the bundle as an uncompressed tar archive
    pub fn to_tar(&self) -> Result<Vec<u8>, StoreError> {
        let mut builder = tar::Builder::new(Vec::new());
        builder.mode(tar::HeaderMode::Deterministic);

        for (path, content) in &self.files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            header.set_entry_type(tar::EntryType::Regular);
            builder.append_data(&mut header, path, content.as_slice())?;
        }

        Ok(builder.into_inner()?)
    }

    /// Decode a bundle produced by [`Bundle::to_tar`]
    pub fn from_tar(bytes: &[u8]) -> Result<Self, StoreError> {
        let mut archive = tar::Archive::new(bytes);
        let mut bundle = Bundle::new();

        for entry in archive.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path()?.to_string_lossy().to_string();
            let path = normalize(&path);
            if !is_safe_relative(Path::new(&path)) {
                return Err(StoreError::InvalidPath(path));
            }
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            bundle.files.insert(path, content);
        }

        Ok(bundle)
    }
}

/// SHA-256 of `bytes` as lowercase hex
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn normalize(path: &str) -> String {
    path.trim_start_matches("./").replace('\\', "/")
}

fn is_safe_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
