mod band;
mod component;
mod error;
mod host;
mod interfaces;
mod workload_set;

pub use band::FeatureBand;
pub use component::{
    format_version_band, pack_install_path, parse_version_band, ComponentIdentity, ComponentKind, ManifestId, ManifestInfo,
    ManifestVersionUpdate, PackId, PackInfo, PackKind, WorkloadId,
};
pub use error::{ErrorCategory, WorkloadError};
pub use host::HostArch;
pub use interfaces::{PackageFetcher, ResolverFactory, ResolverSelection, WorkloadResolver};
pub use workload_set::{
    manifest_package_id, msi_package_id, workload_set_package_id,
    workload_set_package_version_to_version, workload_set_version_to_package_version,
};

#[cfg(test)]
mod tests;
