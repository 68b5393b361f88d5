use std::collections::BTreeSet;
use std::fs;
use std::io;

use anyhow::{Context, Result};
use semver::Version;
use workpack_core::FeatureBand;

use crate::WorkloadLayout;

/// SDK versions installed under `{dotnet_root}/sdk`, newest last.
pub fn installed_sdk_versions(layout: &WorkloadLayout) -> Result<Vec<Version>> {
    let dir = layout.sdk_dir();
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", dir.display()));
        }
    };

    let mut versions = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        if !entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false) {
            continue;
        }
        if let Some(version) = entry
            .file_name()
            .to_str()
            .and_then(|name| Version::parse(name).ok())
        {
            versions.push(version);
        }
    }
    versions.sort();
    Ok(versions)
}

/// Feature bands with at least one SDK on disk. The current band always
/// counts as installed, even in a dotnet root that holds no SDK folders.
pub fn installed_feature_bands(
    layout: &WorkloadLayout,
    current: &FeatureBand,
) -> Result<BTreeSet<FeatureBand>> {
    let mut bands = installed_sdk_versions(layout)?
        .iter()
        .map(FeatureBand::from_version)
        .collect::<BTreeSet<_>>();
    bands.insert(current.clone());
    Ok(bands)
}
