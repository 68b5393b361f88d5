use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use workpack_core::WorkloadError;

use crate::fs_utils::{copy_dir_recursive, read_json_file, remove_dir_all_if_exists};

pub const PAYLOAD_MANIFEST_FILE: &str = "msi.json";

/// Describes the native package carried inside a workload package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PayloadManifest {
    pub product_code: String,
    pub product_version: String,
    pub provider_key_name: String,
    /// File name of the package, relative to the manifest.
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedPayload {
    pub package_id: String,
    pub version: String,
    pub manifest: PayloadManifest,
    pub package_path: PathBuf,
}

/// Machine-wide copies of native packages, kept so they can be repaired or
/// removed later. Only packages inside this cache are ever executed.
#[derive(Debug, Clone)]
pub struct PackageCache {
    root: PathBuf,
}

impl PackageCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn payload_dir(&self, package_id: &str, version: &str) -> PathBuf {
        self.root.join(package_id).join(version)
    }

    /// Copies an extracted package's payload into the cache. `staged_dir` is
    /// the extraction root; the payload normally sits under its `data/`.
    pub fn cache_payload(&self, package_id: &str, version: &str, staged_dir: &Path) -> Result<CachedPayload> {
        let data_dir = staged_dir.join("data");
        let source = if data_dir.is_dir() { data_dir } else { staged_dir.to_path_buf() };
        if !source.join(PAYLOAD_MANIFEST_FILE).is_file() {
            return Err(anyhow!(
                "package {package_id}@{version} does not contain {PAYLOAD_MANIFEST_FILE}"
            ));
        }

        let dest = self.payload_dir(package_id, version);
        remove_dir_all_if_exists(&dest)
            .with_context(|| format!("failed to replace cached payload {}", dest.display()))?;
        copy_dir_recursive(&source, &dest)?;
        tracing::debug!(package = package_id, version, dest = %dest.display(), "cached package payload");

        self.read_payload(package_id, version)?
            .ok_or_else(|| anyhow!("cached payload for {package_id}@{version} disappeared"))
    }

    pub fn read_payload(&self, package_id: &str, version: &str) -> Result<Option<CachedPayload>> {
        let dir = self.payload_dir(package_id, version);
        let Some(manifest) = read_json_file::<PayloadManifest>(&dir.join(PAYLOAD_MANIFEST_FILE))? else {
            return Ok(None);
        };
        let package_path = dir.join(&manifest.payload);
        if !package_path.is_file() {
            return Err(WorkloadError::InvalidPackage { path: package_path }.into());
        }
        Ok(Some(CachedPayload {
            package_id: package_id.to_string(),
            version: version.to_string(),
            manifest,
            package_path,
        }))
    }

    /// Every cached payload as `(package_id, version)`.
    pub fn entries(&self) -> Result<Vec<(String, String)>> {
        let mut entries = Vec::new();
        for package in read_dir_names(&self.root)? {
            for version in read_dir_names(&self.root.join(&package))? {
                if self.payload_dir(&package, &version).join(PAYLOAD_MANIFEST_FILE).is_file() {
                    entries.push((package.clone(), version));
                }
            }
        }
        entries.sort();
        Ok(entries)
    }

    pub fn remove_payload(&self, package_id: &str, version: &str) -> Result<()> {
        let dir = self.payload_dir(package_id, version);
        remove_dir_all_if_exists(&dir)
            .with_context(|| format!("failed to remove cached payload {}", dir.display()))?;
        let package_dir = self.root.join(package_id);
        if read_dir_names(&package_dir)?.is_empty() {
            remove_dir_all_if_exists(&package_dir)
                .with_context(|| format!("failed to remove {}", package_dir.display()))?;
        }
        Ok(())
    }

    /// Rejects a package path that does not resolve to a file in the cache.
    pub fn verify_in_cache(&self, package_path: &Path) -> Result<PathBuf> {
        let invalid = || WorkloadError::InvalidPackage {
            path: package_path.to_path_buf(),
        };
        let root = fs::canonicalize(&self.root).map_err(|_| invalid())?;
        let resolved = fs::canonicalize(package_path).map_err(|_| invalid())?;
        if !resolved.starts_with(&root) || !resolved.is_file() {
            return Err(invalid().into());
        }
        Ok(resolved)
    }
}

fn read_dir_names(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", dir.display())),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        if entry.path().is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}
