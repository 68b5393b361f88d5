use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use workpack_core::{FeatureBand, HostArch, ManifestId};

/// Paths of everything the installer reads and writes.
///
/// `dotnet_root` holds the SDKs and the machine-wide markers. Workload
/// content and records live under `workload_root`, which is the dotnet root
/// itself unless the band was switched to user-local installs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadLayout {
    dotnet_root: PathBuf,
    workload_root: PathBuf,
    temp_root: PathBuf,
}

impl WorkloadLayout {
    pub fn new(dotnet_root: impl Into<PathBuf>) -> Self {
        let dotnet_root = dotnet_root.into();
        Self {
            workload_root: dotnet_root.clone(),
            temp_root: std::env::temp_dir().join("workpack"),
            dotnet_root,
        }
    }

    /// Picks the workload root for `band`: the user profile directory when
    /// the band carries a `userlocal` marker, the dotnet root otherwise.
    pub fn resolve(
        dotnet_root: impl Into<PathBuf>,
        user_profile_dir: Option<&Path>,
        band: &FeatureBand,
    ) -> Self {
        let layout = Self::new(dotnet_root);
        match user_profile_dir {
            Some(user_dir) if layout.user_local_marker_path(band).exists() => {
                layout.with_workload_root(user_dir)
            }
            _ => layout,
        }
    }

    pub fn with_workload_root(mut self, workload_root: impl Into<PathBuf>) -> Self {
        self.workload_root = workload_root.into();
        self
    }

    pub fn with_temp_root(mut self, temp_root: impl Into<PathBuf>) -> Self {
        self.temp_root = temp_root.into();
        self
    }

    pub fn dotnet_root(&self) -> &Path {
        &self.dotnet_root
    }

    pub fn workload_root(&self) -> &Path {
        &self.workload_root
    }

    pub fn is_user_local(&self) -> bool {
        self.workload_root != self.dotnet_root
    }

    pub fn sdk_dir(&self) -> PathBuf {
        self.dotnet_root.join("sdk")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.temp_root.clone()
    }

    fn band_marker_dir(&self, band: &FeatureBand) -> PathBuf {
        self.dotnet_root
            .join("metadata")
            .join("workloads")
            .join(band.to_string())
    }

    pub fn user_local_marker_path(&self, band: &FeatureBand) -> PathBuf {
        self.band_marker_dir(band).join("userlocal")
    }

    pub fn msi_marker_path(&self, band: &FeatureBand) -> PathBuf {
        self.band_marker_dir(band).join("installertype").join("msi")
    }

    /// Machine-wide store for native installer payloads.
    pub fn package_cache_dir(&self) -> PathBuf {
        match std::env::var_os("ProgramData") {
            Some(program_data) if cfg!(windows) => {
                PathBuf::from(program_data).join("dotnet").join("workloads")
            }
            _ => self.dotnet_root.join("metadata").join("workloads").join("packages"),
        }
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.workload_root.join("metadata").join("workloads")
    }

    pub fn band_metadata_dir(&self, band: &FeatureBand) -> PathBuf {
        self.metadata_dir().join(band.to_string())
    }

    pub fn installed_packs_dir(&self) -> PathBuf {
        self.metadata_dir().join("InstalledPacks").join("v1")
    }

    pub fn pack_record_path(&self, pack_id: &str, version: &str, band: &FeatureBand) -> PathBuf {
        self.installed_packs_dir()
            .join(pack_id)
            .join(version)
            .join(band.to_string())
    }

    pub fn installed_manifests_dir(&self) -> PathBuf {
        self.metadata_dir().join("InstalledManifests").join("v1")
    }

    pub fn manifest_record_path(
        &self,
        manifest_id: &ManifestId,
        version: &str,
        manifest_band: &FeatureBand,
        referencing_band: &FeatureBand,
    ) -> PathBuf {
        self.installed_manifests_dir()
            .join(manifest_id.as_str())
            .join(version)
            .join(manifest_band.to_string())
            .join(referencing_band.to_string())
    }

    pub fn installed_workload_sets_dir(&self) -> PathBuf {
        self.metadata_dir().join("InstalledWorkloadSets").join("v1")
    }

    pub fn workload_set_record_path(
        &self,
        version: &str,
        set_band: &FeatureBand,
        referencing_band: &FeatureBand,
    ) -> PathBuf {
        self.installed_workload_sets_dir()
            .join(version)
            .join(set_band.to_string())
            .join(referencing_band.to_string())
    }

    pub fn workload_records_dir(&self, band: &FeatureBand) -> PathBuf {
        self.band_metadata_dir(band).join("InstalledWorkloads")
    }

    pub fn install_state_dir(&self, band: &FeatureBand) -> PathBuf {
        self.band_metadata_dir(band).join("InstallState")
    }

    pub fn install_state_path(&self, band: &FeatureBand) -> PathBuf {
        self.install_state_dir(band).join("default.json")
    }

    pub fn global_json_pins_path(&self, band: &FeatureBand) -> PathBuf {
        self.install_state_dir(band).join("globaljsonworkloadsets.json")
    }

    pub fn history_dir(&self, arch: HostArch, band: &FeatureBand) -> PathBuf {
        self.metadata_dir()
            .join(arch.as_str())
            .join(band.to_string())
            .join("history")
    }

    pub fn manifests_dir(&self, band: &FeatureBand) -> PathBuf {
        self.workload_root
            .join("sdk-manifests")
            .join(band.to_string())
    }

    pub fn manifest_install_dir(
        &self,
        manifest_id: &ManifestId,
        version: &str,
        band: &FeatureBand,
    ) -> PathBuf {
        self.manifests_dir(band).join(manifest_id.as_str()).join(version)
    }

    pub fn workload_set_install_dir(&self, version: &str, band: &FeatureBand) -> PathBuf {
        self.manifests_dir(band).join("workloadsets").join(version)
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.metadata_dir(),
            self.installed_packs_dir(),
            self.installed_manifests_dir(),
            self.installed_workload_sets_dir(),
            self.tmp_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_dotnet_root() -> Result<PathBuf> {
    if let Ok(root) = std::env::var("DOTNET_ROOT") {
        return Ok(PathBuf::from(root));
    }

    if cfg!(windows) {
        let program_files = std::env::var("ProgramFiles")
            .context("ProgramFiles is not set; cannot resolve dotnet root")?;
        return Ok(PathBuf::from(program_files).join("dotnet"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve dotnet root")?;
    Ok(PathBuf::from(home).join(".dotnet"))
}

pub fn default_user_profile_dir() -> Result<PathBuf> {
    if cfg!(windows) {
        let profile = std::env::var("USERPROFILE")
            .context("USERPROFILE is not set; cannot resolve user profile directory")?;
        return Ok(PathBuf::from(profile).join(".dotnet"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve user profile directory")?;
    Ok(PathBuf::from(home).join(".dotnet"))
}
