use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use workpack_core::{FeatureBand, ManifestId, ManifestVersionUpdate, PackInfo, ResolverFactory};

use crate::gc::GcReport;
use crate::install_state::{InstallState, InstallStateUpdate};
use crate::workload_records::WorkloadRecordStore;
use crate::Transaction;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_SUCCESS_REBOOT_REQUIRED: i32 = 3010;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallerKind {
    FileBased,
    OsPackage,
}

impl InstallerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FileBased => "file-based",
            Self::OsPackage => "os-package",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    Windows,
    Other,
}

impl HostOs {
    pub fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Other
        }
    }
}

/// Native installer packages are only used on Windows, and only for a band
/// whose SDK was itself installed that way.
pub fn select_installer_kind(os: HostOs, msi_marker_present: bool) -> InstallerKind {
    match (os, msi_marker_present) {
        (HostOs::Windows, true) => InstallerKind::OsPackage,
        _ => InstallerKind::FileBased,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkloadDownload {
    pub package_id: String,
    pub version: String,
}

/// Contract shared by the file-based and native-package backends.
pub trait Installer {
    fn kind(&self) -> InstallerKind;

    fn feature_band(&self) -> &FeatureBand;

    fn install_packs<'a>(
        &'a self,
        tx: &mut Transaction<'a>,
        packs: &[PackInfo],
        band: &FeatureBand,
        offline_cache: Option<&Path>,
    ) -> Result<()>;

    fn repair_packs(
        &self,
        packs: &[PackInfo],
        band: &FeatureBand,
        offline_cache: Option<&Path>,
    ) -> Result<()>;

    fn install_manifest<'a>(
        &'a self,
        tx: &mut Transaction<'a>,
        update: &ManifestVersionUpdate,
        offline_cache: Option<&Path>,
    ) -> Result<()>;

    fn install_workload_set<'a>(
        &'a self,
        tx: &mut Transaction<'a>,
        version: &str,
        offline_cache: Option<&Path>,
    ) -> Result<()>;

    fn garbage_collect(
        &self,
        factory: &dyn ResolverFactory,
        offline_cache: Option<&Path>,
        clean_all: bool,
    ) -> Result<GcReport>;

    /// Packages that installing `packs` would fetch.
    fn downloads(
        &self,
        packs: &[PackInfo],
        band: &FeatureBand,
        include_installed: bool,
    ) -> Result<Vec<WorkloadDownload>>;

    fn record_store(&self) -> &dyn WorkloadRecordStore;

    fn install_state(&self) -> Result<InstallState>;

    fn update_install_state(&self, update: &InstallStateUpdate) -> Result<()>;

    fn record_global_json_pin(&self, global_json: &Path, version: &str) -> Result<()>;

    fn global_json_pins(&self) -> Result<BTreeMap<PathBuf, String>>;

    fn shutdown(&self) -> Result<()>;

    fn exit_code(&self) -> i32;

    fn adjust_workload_set(&self, version: Option<&str>) -> Result<()> {
        self.update_install_state(&InstallStateUpdate::WorkloadSet {
            version: version.map(ToString::to_string),
        })
    }

    fn save_manifest_versions(
        &self,
        pins: &BTreeMap<ManifestId, (String, FeatureBand)>,
    ) -> Result<()> {
        self.update_install_state(&InstallStateUpdate::manifest_versions(pins))
    }

    fn remove_manifests_from_install_state(&self) -> Result<()> {
        self.update_install_state(&InstallStateUpdate::RemoveManifests)
    }

    fn update_install_mode(&self, use_workload_sets: bool) -> Result<()> {
        self.update_install_state(&InstallStateUpdate::InstallMode { use_workload_sets })
    }

    fn pinned_workload_sets(&self) -> Result<BTreeSet<String>> {
        Ok(self.global_json_pins()?.into_values().collect())
    }
}
