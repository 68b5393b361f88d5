mod document;
mod resolve;
mod select;

pub use document::{ManifestDocument, PackDefinition, WorkloadDefinition};
pub use resolve::{default_host_rid, ManifestDirectoryResolver, ManifestDirectoryResolverFactory};
pub use select::{compare_versions, select_newest_version};

pub const WORKLOAD_MANIFEST_FILE: &str = "WorkloadManifest.json";
pub const WORKLOAD_SETS_DIR: &str = "workloadsets";
