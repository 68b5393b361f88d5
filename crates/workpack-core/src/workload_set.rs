use anyhow::{anyhow, Result};

use crate::band::FeatureBand;
use crate::component::ManifestId;
use crate::host::HostArch;

/// Converts a workload set version into the version of the package that
/// carries it, along with the feature band the set belongs to.
///
/// `9.0.100` ships as package `9.100.0`, `9.0.101.2` as `9.101.2`, and a
/// prerelease label is carried over unchanged.
pub fn workload_set_version_to_package_version(version: &str) -> Result<(String, FeatureBand)> {
    let (core, prerelease) = match version.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (version, None),
    };
    let sections = core.split('.').collect::<Vec<_>>();
    if !(3..=4).contains(&sections.len()) || sections.iter().any(|part| part.parse::<u64>().is_err())
    {
        return Err(anyhow!("invalid workload set version '{version}'"));
    }

    let fourth = sections.get(3).copied().unwrap_or("0");
    let suffix = prerelease.map(|pre| format!("-{pre}")).unwrap_or_default();
    let package_version = format!("{}.{}.{}{}", sections[0], sections[2], fourth, suffix);
    let band = FeatureBand::parse(&format!("{}.{}.{}{}", sections[0], sections[1], sections[2], suffix))?;
    Ok((package_version, band))
}

/// Inverse of [`workload_set_version_to_package_version`].
pub fn workload_set_package_version_to_version(band: &FeatureBand, package_version: &str) -> Result<String> {
    let (core, prerelease) = match package_version.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (package_version, None),
    };
    let sections = core.split('.').collect::<Vec<_>>();
    if sections.len() != 3 {
        return Err(anyhow!("invalid workload set package version '{package_version}'"));
    }

    let mut version = format!("{}.{}.{}", sections[0], band.minor(), sections[1]);
    if sections[2] != "0" {
        version.push('.');
        version.push_str(sections[2]);
    }
    if let Some(pre) = prerelease {
        version.push('-');
        version.push_str(pre);
    }
    Ok(version)
}

pub fn workload_set_package_id(band: &FeatureBand) -> String {
    format!("Microsoft.NET.Workloads.{band}")
}

pub fn manifest_package_id(manifest: &ManifestId, band: &FeatureBand) -> String {
    format!("{manifest}.Manifest-{band}")
}

/// Package id of the native installer wrapping `package_id` for a host architecture.
pub fn msi_package_id(package_id: &str, arch: HostArch) -> String {
    format!("{package_id}.Msi.{arch}")
}
