use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use workpack_core::{
    parse_version_band, workload_set_version_to_package_version, FeatureBand, ManifestId,
    ManifestInfo, PackId, PackInfo, ResolverFactory, ResolverSelection, WorkloadError, WorkloadId,
    WorkloadResolver,
};

use crate::document::ManifestDocument;
use crate::select::select_newest_version;
use crate::{WORKLOAD_MANIFEST_FILE, WORKLOAD_SETS_DIR};

pub fn default_host_rid() -> String {
    let os = if cfg!(windows) {
        "win"
    } else if cfg!(target_os = "macos") {
        "osx"
    } else {
        "linux"
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        other => other,
    };
    format!("{os}-{arch}")
}

/// Builds resolvers from the `sdk-manifests` tree under a workload root.
#[derive(Debug, Clone)]
pub struct ManifestDirectoryResolverFactory {
    workload_root: PathBuf,
    band: FeatureBand,
    host_rid: String,
}

impl ManifestDirectoryResolverFactory {
    pub fn new(workload_root: impl Into<PathBuf>, band: FeatureBand) -> Self {
        Self {
            workload_root: workload_root.into(),
            band,
            host_rid: default_host_rid(),
        }
    }

    pub fn with_host_rid(mut self, host_rid: impl Into<String>) -> Self {
        self.host_rid = host_rid.into();
        self
    }

    fn manifests_root(&self) -> PathBuf {
        self.workload_root.join("sdk-manifests")
    }

    fn manifest_dir(&self, id: &ManifestId, version: &str, band: &FeatureBand) -> PathBuf {
        self.manifests_root()
            .join(band.to_string())
            .join(id.as_str())
            .join(version)
    }

    fn newest_manifests(&self) -> Result<BTreeMap<ManifestId, (String, FeatureBand)>> {
        let band_dir = self.manifests_root().join(self.band.to_string());
        let mut selected = BTreeMap::new();
        for manifest_dir in read_subdirs(&band_dir)? {
            let Some(name) = dir_name(&manifest_dir) else {
                continue;
            };
            if name.eq_ignore_ascii_case(WORKLOAD_SETS_DIR) {
                continue;
            }
            let versions = read_subdirs(&manifest_dir)?
                .into_iter()
                .filter(|dir| dir.join(WORKLOAD_MANIFEST_FILE).is_file())
                .filter_map(|dir| dir_name(&dir))
                .collect::<Vec<_>>();
            if let Some(newest) = select_newest_version(versions.iter().map(String::as_str)) {
                selected.insert(ManifestId::new(name), (newest.to_string(), self.band.clone()));
            }
        }
        Ok(selected)
    }

    fn workload_set_manifests(
        &self,
        version: &str,
    ) -> Result<BTreeMap<ManifestId, (String, FeatureBand)>> {
        let (_, set_band) = workload_set_version_to_package_version(version)?;
        let set_dir = self
            .manifests_root()
            .join(set_band.to_string())
            .join(WORKLOAD_SETS_DIR)
            .join(version);
        if !set_dir.is_dir() {
            return Err(WorkloadError::VersionNotRecognized {
                version: version.to_string(),
            }
            .into());
        }

        let mut manifests = BTreeMap::new();
        for entry in fs::read_dir(&set_dir)
            .with_context(|| format!("failed to read workload set: {}", set_dir.display()))?
        {
            let path = entry?.path();
            let is_set_file = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.to_ascii_lowercase().ends_with(".workloadset.json"));
            if !is_set_file {
                continue;
            }
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let entries: BTreeMap<String, String> = serde_json::from_str(&raw)
                .with_context(|| format!("failed parsing workload set file: {}", path.display()))?;
            for (id, pin) in entries {
                let (manifest_version, manifest_band) = parse_version_band(&pin)
                    .with_context(|| format!("invalid entry for '{id}' in {}", path.display()))?;
                manifests.insert(ManifestId::new(id), (manifest_version, manifest_band));
            }
        }
        Ok(manifests)
    }

    fn load(
        &self,
        selected: BTreeMap<ManifestId, (String, FeatureBand)>,
        workload_set_version: Option<String>,
    ) -> Result<ManifestDirectoryResolver> {
        let mut manifests = Vec::with_capacity(selected.len());
        for (id, (version, band)) in selected {
            let path = self.manifest_dir(&id, &version, &band).join(WORKLOAD_MANIFEST_FILE);
            let document = ManifestDocument::read(&path)?;
            manifests.push((
                ManifestInfo {
                    id,
                    version,
                    feature_band: band,
                },
                document,
            ));
        }
        tracing::debug!(
            count = manifests.len(),
            workload_set = ?workload_set_version,
            "loaded workload manifests"
        );
        Ok(ManifestDirectoryResolver {
            workload_root: self.workload_root.clone(),
            host_rid: self.host_rid.clone(),
            manifests,
            workload_set_version,
        })
    }
}

impl ResolverFactory for ManifestDirectoryResolverFactory {
    fn create(&self, selection: &ResolverSelection) -> Result<Box<dyn WorkloadResolver>> {
        let resolver = match selection {
            ResolverSelection::Default => self.load(self.newest_manifests()?, None)?,
            ResolverSelection::WorkloadSet(version) => {
                let manifests = self.workload_set_manifests(version)?;
                self.load(manifests, Some(version.clone()))?
            }
            ResolverSelection::Manifests(pins) => self.load(pins.clone(), None)?,
        };
        Ok(Box::new(resolver))
    }
}

pub struct ManifestDirectoryResolver {
    workload_root: PathBuf,
    host_rid: String,
    manifests: Vec<(ManifestInfo, ManifestDocument)>,
    workload_set_version: Option<String>,
}

impl ManifestDirectoryResolver {
    fn workload_packs(&self, workload: &str) -> Option<(&[String], &[String])> {
        self.manifests.iter().find_map(|(_, document)| {
            document
                .workloads
                .get(workload)
                .map(|definition| (definition.packs.as_slice(), definition.extends.as_slice()))
        })
    }

    fn pack_info(&self, pack_id: &str) -> Result<Option<PackInfo>> {
        for (manifest, document) in &self.manifests {
            let Some(definition) = document.packs.get(pack_id) else {
                continue;
            };
            let Some(resolved) = definition.resolved_package_id(pack_id, &self.host_rid) else {
                tracing::debug!(pack = pack_id, rid = %self.host_rid, "pack has no alias for host");
                return Ok(None);
            };
            let kind = definition
                .pack_kind()
                .with_context(|| format!("invalid pack '{pack_id}' in manifest {}", manifest.id))?;
            let mut info = PackInfo::new(
                &self.workload_root,
                PackId::new(resolved),
                definition.version.clone(),
                kind,
            );
            info.resolved_package_id = resolved.to_string();
            return Ok(Some(info));
        }
        Ok(None)
    }
}

impl WorkloadResolver for ManifestDirectoryResolver {
    fn packs_for_workloads(&self, workloads: &[WorkloadId]) -> Result<Vec<PackInfo>> {
        let mut visited = BTreeSet::new();
        let mut pack_ids = BTreeSet::new();
        let mut queue = workloads
            .iter()
            .map(|id| id.as_str().to_string())
            .collect::<VecDeque<_>>();

        while let Some(workload) = queue.pop_front() {
            if !visited.insert(workload.clone()) {
                continue;
            }
            let (packs, extends) = self
                .workload_packs(&workload)
                .ok_or_else(|| WorkloadError::WorkloadNotRecognized {
                    workload: workload.clone(),
                })?;
            pack_ids.extend(packs.iter().cloned());
            queue.extend(extends.iter().cloned());
        }

        let mut resolved = Vec::new();
        for pack_id in pack_ids {
            if let Some(info) = self.pack_info(&pack_id)? {
                if !resolved.contains(&info) {
                    resolved.push(info);
                }
            }
        }
        Ok(resolved)
    }

    fn manifests(&self) -> Result<Vec<ManifestInfo>> {
        Ok(self.manifests.iter().map(|(info, _)| info.clone()).collect())
    }

    fn workload_set_version(&self) -> Option<String> {
        self.workload_set_version.clone()
    }

    fn is_known_workload(&self, workload: &WorkloadId) -> bool {
        self.workload_packs(workload.as_str()).is_some()
    }
}

fn read_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", dir.display()));
        }
    };

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        if entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false) {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn dir_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(ToString::to_string)
}
