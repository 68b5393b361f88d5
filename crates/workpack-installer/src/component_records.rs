//! Installation records for packs, manifests and workload sets.
//!
//! A record is a file whose path names the component and the feature band
//! that needs it. Removing the last record for a component prunes the
//! now-empty directories above it.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use workpack_core::{FeatureBand, ManifestId, PackId, PackInfo};

use crate::fs_utils::{delete_empty_parents, read_json_file, remove_file_if_exists, write_json_file};
use crate::WorkloadLayout;

pub type PackRecords = BTreeMap<(PackId, String), Vec<FeatureBand>>;
pub type ManifestRecords = BTreeMap<(ManifestId, String, FeatureBand), Vec<FeatureBand>>;
pub type WorkloadSetRecords = BTreeMap<(String, FeatureBand), Vec<FeatureBand>>;

pub fn write_pack_record(layout: &WorkloadLayout, pack: &PackInfo, band: &FeatureBand) -> Result<PathBuf> {
    let path = layout.pack_record_path(pack.id.as_str(), &pack.version, band);
    write_json_file(&path, pack)
        .with_context(|| format!("failed to write pack record for {}@{}", pack.id, pack.version))?;
    Ok(path)
}

pub fn pack_record_exists(layout: &WorkloadLayout, pack_id: &PackId, version: &str, band: &FeatureBand) -> bool {
    layout.pack_record_path(pack_id.as_str(), version, band).is_file()
}

pub fn read_pack_record(
    layout: &WorkloadLayout,
    pack_id: &PackId,
    version: &str,
    band: &FeatureBand,
) -> Result<Option<PackInfo>> {
    read_json_file(&layout.pack_record_path(pack_id.as_str(), version, band))
}

pub fn delete_pack_record(
    layout: &WorkloadLayout,
    pack_id: &PackId,
    version: &str,
    band: &FeatureBand,
) -> Result<()> {
    let path = layout.pack_record_path(pack_id.as_str(), version, band);
    delete_record_file(&path, &layout.installed_packs_dir())
}

/// Bands that still hold a record for `pack_id@version`.
pub fn pack_record_bands(layout: &WorkloadLayout, pack_id: &PackId, version: &str) -> Result<Vec<FeatureBand>> {
    let dir = layout.installed_packs_dir().join(pack_id.as_str()).join(version);
    let mut bands = Vec::new();
    for name in list_entries(&dir)? {
        match FeatureBand::parse(&name) {
            Ok(band) => bands.push(band),
            Err(err) => tracing::debug!(%err, record = %dir.join(&name).display(), "skipping unreadable pack record"),
        }
    }
    Ok(bands)
}

pub fn read_pack_records(layout: &WorkloadLayout) -> Result<PackRecords> {
    let mut records = PackRecords::new();
    for leaf in list_record_leaves(&layout.installed_packs_dir(), 3)? {
        let [pack_id, version, band] = leaf.as_slice() else {
            continue;
        };
        let Ok(band) = FeatureBand::parse(band) else {
            continue;
        };
        records
            .entry((PackId::new(pack_id.as_str()), version.clone()))
            .or_default()
            .push(band);
    }
    Ok(records)
}

pub fn write_manifest_record(
    layout: &WorkloadLayout,
    manifest_id: &ManifestId,
    version: &str,
    manifest_band: &FeatureBand,
    referencing_band: &FeatureBand,
) -> Result<PathBuf> {
    let path = layout.manifest_record_path(manifest_id, version, manifest_band, referencing_band);
    touch_record_file(&path)?;
    Ok(path)
}

pub fn manifest_record_exists(
    layout: &WorkloadLayout,
    manifest_id: &ManifestId,
    version: &str,
    manifest_band: &FeatureBand,
    referencing_band: &FeatureBand,
) -> bool {
    layout
        .manifest_record_path(manifest_id, version, manifest_band, referencing_band)
        .is_file()
}

pub fn delete_manifest_record(
    layout: &WorkloadLayout,
    manifest_id: &ManifestId,
    version: &str,
    manifest_band: &FeatureBand,
    referencing_band: &FeatureBand,
) -> Result<()> {
    let path = layout.manifest_record_path(manifest_id, version, manifest_band, referencing_band);
    delete_record_file(&path, &layout.installed_manifests_dir())
}

pub fn read_manifest_records(layout: &WorkloadLayout) -> Result<ManifestRecords> {
    let mut records = ManifestRecords::new();
    for leaf in list_record_leaves(&layout.installed_manifests_dir(), 4)? {
        let [manifest_id, version, manifest_band, referencing_band] = leaf.as_slice() else {
            continue;
        };
        let (Ok(manifest_band), Ok(referencing_band)) =
            (FeatureBand::parse(manifest_band), FeatureBand::parse(referencing_band))
        else {
            continue;
        };
        records
            .entry((ManifestId::new(manifest_id.as_str()), version.clone(), manifest_band))
            .or_default()
            .push(referencing_band);
    }
    Ok(records)
}

pub fn write_workload_set_record(
    layout: &WorkloadLayout,
    version: &str,
    set_band: &FeatureBand,
    referencing_band: &FeatureBand,
) -> Result<PathBuf> {
    let path = layout.workload_set_record_path(version, set_band, referencing_band);
    touch_record_file(&path)?;
    Ok(path)
}

pub fn workload_set_record_exists(
    layout: &WorkloadLayout,
    version: &str,
    set_band: &FeatureBand,
    referencing_band: &FeatureBand,
) -> bool {
    layout
        .workload_set_record_path(version, set_band, referencing_band)
        .is_file()
}

pub fn delete_workload_set_record(
    layout: &WorkloadLayout,
    version: &str,
    set_band: &FeatureBand,
    referencing_band: &FeatureBand,
) -> Result<()> {
    let path = layout.workload_set_record_path(version, set_band, referencing_band);
    delete_record_file(&path, &layout.installed_workload_sets_dir())
}

pub fn read_workload_set_records(layout: &WorkloadLayout) -> Result<WorkloadSetRecords> {
    let mut records = WorkloadSetRecords::new();
    for leaf in list_record_leaves(&layout.installed_workload_sets_dir(), 3)? {
        let [version, set_band, referencing_band] = leaf.as_slice() else {
            continue;
        };
        let (Ok(set_band), Ok(referencing_band)) =
            (FeatureBand::parse(set_band), FeatureBand::parse(referencing_band))
        else {
            continue;
        };
        records
            .entry((version.clone(), set_band))
            .or_default()
            .push(referencing_band);
    }
    Ok(records)
}

fn touch_record_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, b"").with_context(|| format!("failed to write record {}", path.display()))
}

fn delete_record_file(path: &Path, records_root: &Path) -> Result<()> {
    remove_file_if_exists(path)
        .with_context(|| format!("failed to delete record {}", path.display()))?;
    if let Some(parent) = path.parent() {
        delete_empty_parents(parent, records_root)?;
    }
    Ok(())
}

fn list_entries(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", dir.display()));
        }
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Collects the relative path components of every file exactly `depth`
/// levels below `root`.
fn list_record_leaves(root: &Path, depth: usize) -> Result<Vec<Vec<String>>> {
    let mut leaves = Vec::new();
    collect_leaves(root, depth, &mut Vec::new(), &mut leaves)?;
    Ok(leaves)
}

fn collect_leaves(
    dir: &Path,
    remaining: usize,
    prefix: &mut Vec<String>,
    leaves: &mut Vec<Vec<String>>,
) -> Result<()> {
    for name in list_entries(dir)? {
        let path = dir.join(&name);
        prefix.push(name);
        if remaining == 1 {
            if path.is_file() {
                leaves.push(prefix.clone());
            }
        } else if path.is_dir() {
            collect_leaves(&path, remaining - 1, prefix, leaves)?;
        }
        prefix.pop();
    }
    Ok(())
}
