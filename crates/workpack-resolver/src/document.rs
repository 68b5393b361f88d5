use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use workpack_core::PackKind;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestDocument {
    pub version: String,
    #[serde(default)]
    pub workloads: BTreeMap<String, WorkloadDefinition>,
    #[serde(default)]
    pub packs: BTreeMap<String, PackDefinition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkloadDefinition {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub packs: Vec<String>,
    #[serde(default)]
    pub extends: Vec<String>,
    #[serde(default)]
    pub platforms: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackDefinition {
    pub kind: String,
    pub version: String,
    /// Per-RID replacement pack ids.
    #[serde(default, rename = "alias-to")]
    pub alias_to: BTreeMap<String, String>,
}

impl PackDefinition {
    pub fn pack_kind(&self) -> Result<PackKind> {
        PackKind::parse(&self.kind)
    }

    /// The package that actually gets downloaded for `host_rid`, or `None`
    /// when the pack is aliased and has no entry for this host.
    pub fn resolved_package_id<'a>(&'a self, pack_id: &'a str, host_rid: &str) -> Option<&'a str> {
        if self.alias_to.is_empty() {
            return Some(pack_id);
        }
        self.alias_to.get(host_rid).map(String::as_str)
    }
}

impl ManifestDocument {
    pub fn from_json_str(input: &str) -> Result<Self> {
        let document: Self =
            serde_json::from_str(input).context("failed to parse workload manifest")?;
        for (workload, definition) in &document.workloads {
            if definition.extends.iter().any(|base| base == workload) {
                return Err(anyhow!("workload '{workload}' extends itself"));
            }
        }
        Ok(document)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read workload manifest: {}", path.display()))?;
        Self::from_json_str(&raw)
            .with_context(|| format!("failed parsing workload manifest: {}", path.display()))
    }
}
