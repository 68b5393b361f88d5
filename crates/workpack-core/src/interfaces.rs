use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::band::FeatureBand;
use crate::component::{ManifestId, ManifestInfo, PackInfo, WorkloadId};

/// Materializes versioned packages on the local machine.
pub trait PackageFetcher {
    /// Downloads `package_id@version` into `dest_dir` and returns the archive path.
    ///
    /// Network failures should surface as [`crate::WorkloadError::Transient`]
    /// so callers can retry them.
    fn download(&self, package_id: &str, version: &str, dest_dir: &Path) -> Result<PathBuf>;

    /// Unpacks a downloaded archive into `dest`.
    fn extract(&self, archive: &Path, dest: &Path) -> Result<()>;
}

/// Answers what a set of workloads needs under one manifest selection.
pub trait WorkloadResolver {
    fn packs_for_workloads(&self, workloads: &[WorkloadId]) -> Result<Vec<PackInfo>>;

    fn manifests(&self) -> Result<Vec<ManifestInfo>>;

    /// The workload set this resolver was built from, if any.
    fn workload_set_version(&self) -> Option<String>;

    fn is_known_workload(&self, workload: &WorkloadId) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverSelection {
    /// Whatever manifests are newest on disk for the current band.
    Default,
    WorkloadSet(String),
    Manifests(BTreeMap<ManifestId, (String, FeatureBand)>),
}

pub trait ResolverFactory {
    fn create(&self, selection: &ResolverSelection) -> Result<Box<dyn WorkloadResolver>>;
}
