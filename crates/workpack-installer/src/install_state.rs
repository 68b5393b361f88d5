use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use workpack_core::{
    format_version_band, parse_version_band, FeatureBand, ManifestId, ResolverSelection,
};

use crate::fs_utils::{read_json_file, write_json_file};
use crate::WorkloadLayout;

/// Per-band pin file read before every install and garbage collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_workload_sets: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifests: Option<BTreeMap<String, String>>,
}

impl InstallState {
    pub fn manifest_pins(&self) -> Result<BTreeMap<ManifestId, (String, FeatureBand)>> {
        let mut pins = BTreeMap::new();
        for (id, raw) in self.manifests.iter().flatten() {
            let pin = parse_version_band(raw)
                .with_context(|| format!("invalid pinned version for manifest '{id}'"))?;
            pins.insert(ManifestId::new(id.as_str()), pin);
        }
        Ok(pins)
    }

    /// A pinned workload set wins over pinned manifests, which win over
    /// whatever is newest on disk.
    pub fn resolver_selection(&self) -> Result<ResolverSelection> {
        if let Some(version) = &self.workload_version {
            return Ok(ResolverSelection::WorkloadSet(version.clone()));
        }
        let pins = self.manifest_pins()?;
        if pins.is_empty() {
            Ok(ResolverSelection::Default)
        } else {
            Ok(ResolverSelection::Manifests(pins))
        }
    }

    /// Automatic manifest updates are skipped while anything is pinned.
    pub fn has_pins(&self) -> bool {
        self.workload_version.is_some()
            || self.manifests.as_ref().is_some_and(|manifests| !manifests.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "kebab-case")]
pub enum InstallStateUpdate {
    WorkloadSet { version: Option<String> },
    ManifestVersions { manifests: BTreeMap<String, String> },
    RemoveManifests,
    InstallMode { use_workload_sets: bool },
}

impl InstallStateUpdate {
    pub fn manifest_versions(pins: &BTreeMap<ManifestId, (String, FeatureBand)>) -> Self {
        Self::ManifestVersions {
            manifests: pins
                .iter()
                .map(|(id, (version, band))| (id.to_string(), format_version_band(version, band)))
                .collect(),
        }
    }

    /// Applies the change in memory and reports whether anything changed.
    pub fn apply(&self, state: &mut InstallState) -> bool {
        match self {
            Self::WorkloadSet { version } => {
                replace_if_changed(&mut state.workload_version, version.clone())
            }
            Self::ManifestVersions { manifests } => {
                replace_if_changed(&mut state.manifests, Some(manifests.clone()))
            }
            Self::RemoveManifests => replace_if_changed(&mut state.manifests, None),
            Self::InstallMode { use_workload_sets } => {
                replace_if_changed(&mut state.use_workload_sets, Some(*use_workload_sets))
            }
        }
    }
}

fn replace_if_changed<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

pub fn read_install_state(layout: &WorkloadLayout, band: &FeatureBand) -> Result<InstallState> {
    Ok(read_json_file(&layout.install_state_path(band))?.unwrap_or_default())
}

pub fn write_install_state(
    layout: &WorkloadLayout,
    band: &FeatureBand,
    state: &InstallState,
) -> Result<()> {
    write_json_file(&layout.install_state_path(band), state)
}

/// Reads, updates and rewrites the install state. The file is left alone
/// when the update changes nothing.
pub fn update_install_state(
    layout: &WorkloadLayout,
    band: &FeatureBand,
    update: &InstallStateUpdate,
) -> Result<bool> {
    let mut state = read_install_state(layout, band)?;
    if !update.apply(&mut state) {
        return Ok(false);
    }
    write_install_state(layout, band, &state)?;
    tracing::debug!(%band, ?update, "updated install state");
    Ok(true)
}

#[derive(Debug, Default, Deserialize)]
struct GlobalJson {
    #[serde(default)]
    sdk: Option<GlobalJsonSdk>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GlobalJsonSdk {
    #[serde(default)]
    workload_version: Option<String>,
}

/// The workload set version a global.json pins, if any.
pub fn read_global_json_workload_version(path: &Path) -> Result<Option<String>> {
    let global_json: Option<GlobalJson> = read_json_file(path)?;
    Ok(global_json
        .and_then(|global_json| global_json.sdk)
        .and_then(|sdk| sdk.workload_version))
}

pub fn record_global_json_pin(
    layout: &WorkloadLayout,
    band: &FeatureBand,
    global_json: &Path,
    version: &str,
) -> Result<()> {
    let path = layout.global_json_pins_path(band);
    let mut pins: BTreeMap<String, String> = read_json_file(&path)?.unwrap_or_default();
    pins.insert(global_json.display().to_string(), version.to_string());
    write_json_file(&path, &pins)
}

/// Workload sets pinned by global.json files, keyed by global.json path.
///
/// Entries whose global.json is gone or now names a different version are
/// pruned from the pin file.
pub fn global_json_pins(
    layout: &WorkloadLayout,
    band: &FeatureBand,
) -> Result<BTreeMap<PathBuf, String>> {
    let path = layout.global_json_pins_path(band);
    let recorded: BTreeMap<String, String> = read_json_file(&path)?.unwrap_or_default();

    let mut live = BTreeMap::new();
    for (global_json, version) in &recorded {
        let global_json_path = PathBuf::from(global_json);
        let current = match read_global_json_workload_version(&global_json_path) {
            Ok(current) => current,
            Err(err) => {
                tracing::debug!(%err, path = %global_json_path.display(), "ignoring unreadable global.json");
                None
            }
        };
        if current.as_deref() == Some(version.as_str()) {
            live.insert(global_json.clone(), version.clone());
        }
    }

    if live.len() != recorded.len() {
        tracing::debug!(
            pruned = recorded.len() - live.len(),
            "pruning stale global.json workload set pins"
        );
        write_json_file(&path, &live)?;
    }

    Ok(live
        .into_iter()
        .map(|(global_json, version)| (PathBuf::from(global_json), version))
        .collect())
}
