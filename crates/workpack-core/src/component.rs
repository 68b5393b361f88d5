use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::band::FeatureBand;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Name of a workload, e.g. `wasm-tools`.
    WorkloadId
);
string_id!(PackId);
string_id!(ManifestId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentKind {
    WorkloadSet,
    Manifest,
    Pack,
}

impl ComponentKind {
    /// Garbage collection order: workload sets pin manifests, manifests describe packs.
    pub const COLLECTION_ORDER: [ComponentKind; 3] = [
        ComponentKind::WorkloadSet,
        ComponentKind::Manifest,
        ComponentKind::Pack,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkloadSet => "workload-set",
            Self::Manifest => "manifest",
            Self::Pack => "pack",
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "workload-set" => Ok(Self::WorkloadSet),
            "manifest" => Ok(Self::Manifest),
            "pack" => Ok(Self::Pack),
            _ => Err(anyhow!("invalid component kind: {value}")),
        }
    }
}

/// The installable unit the reference count is kept for.
///
/// Packs are identified by id and version alone. Manifests and workload sets
/// are published per feature band, so their band is part of the identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentIdentity {
    pub kind: ComponentKind,
    pub id: String,
    pub version: String,
    pub feature_band: Option<FeatureBand>,
}

impl ComponentIdentity {
    pub fn pack(id: &PackId, version: &str) -> Self {
        Self {
            kind: ComponentKind::Pack,
            id: id.to_string(),
            version: version.to_string(),
            feature_band: None,
        }
    }

    pub fn manifest(id: &ManifestId, version: &str, band: &FeatureBand) -> Self {
        Self {
            kind: ComponentKind::Manifest,
            id: id.to_string(),
            version: version.to_string(),
            feature_band: Some(band.clone()),
        }
    }

    pub fn workload_set(version: &str, band: &FeatureBand) -> Self {
        Self {
            kind: ComponentKind::WorkloadSet,
            id: version.to_string(),
            version: version.to_string(),
            feature_band: Some(band.clone()),
        }
    }
}

impl fmt::Display for ComponentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, &self.feature_band) {
            (ComponentKind::WorkloadSet, _) => write!(f, "workload set {}", self.version),
            (kind, Some(band)) => write!(f, "{} {}@{}/{}", kind.as_str(), self.id, self.version, band),
            (kind, None) => write!(f, "{} {}@{}", kind.as_str(), self.id, self.version),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackKind {
    Sdk,
    Framework,
    Library,
    Template,
    Tool,
}

impl PackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sdk => "sdk",
            Self::Framework => "framework",
            Self::Library => "library",
            Self::Template => "template",
            Self::Tool => "tool",
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "sdk" => Ok(Self::Sdk),
            "framework" => Ok(Self::Framework),
            "library" => Ok(Self::Library),
            "template" => Ok(Self::Template),
            "tool" => Ok(Self::Tool),
            _ => Err(anyhow!("invalid pack kind: {value}")),
        }
    }

    /// Library and template packs are kept as the downloaded package file.
    pub fn is_single_file(self) -> bool {
        matches!(self, Self::Library | Self::Template)
    }
}

/// Where a pack lives under a workload root.
pub fn pack_install_path(workload_root: &Path, id: &PackId, version: &str, kind: PackKind) -> PathBuf {
    let file_name = format!(
        "{}.{}.nupkg",
        id.as_str().to_ascii_lowercase(),
        version.to_ascii_lowercase()
    );
    match kind {
        PackKind::Library => workload_root.join("library-packs").join(file_name),
        PackKind::Template => workload_root.join("template-packs").join(file_name),
        _ => workload_root.join("packs").join(id.as_str()).join(version),
    }
}

/// A pack as resolved for installation. Serialized into the pack's
/// installation record so it can be deleted without a resolver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackInfo {
    pub id: PackId,
    pub version: String,
    pub kind: PackKind,
    pub path: PathBuf,
    pub resolved_package_id: String,
}

impl PackInfo {
    pub fn new(workload_root: &Path, id: PackId, version: impl Into<String>, kind: PackKind) -> Self {
        let version = version.into();
        let path = pack_install_path(workload_root, &id, &version, kind);
        Self {
            resolved_package_id: id.to_string(),
            id,
            version,
            kind,
            path,
        }
    }

    pub fn identity(&self) -> ComponentIdentity {
        ComponentIdentity::pack(&self.id, &self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestInfo {
    pub id: ManifestId,
    pub version: String,
    pub feature_band: FeatureBand,
}

impl ManifestInfo {
    pub fn identity(&self) -> ComponentIdentity {
        ComponentIdentity::manifest(&self.id, &self.version, &self.feature_band)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestVersionUpdate {
    pub manifest_id: ManifestId,
    pub existing_version: Option<String>,
    pub existing_feature_band: Option<FeatureBand>,
    pub new_version: String,
    pub new_feature_band: FeatureBand,
}

impl ManifestVersionUpdate {
    pub fn target(&self) -> ManifestInfo {
        ManifestInfo {
            id: self.manifest_id.clone(),
            version: self.new_version.clone(),
            feature_band: self.new_feature_band.clone(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.existing_version.as_deref() == Some(self.new_version.as_str())
            && self.existing_feature_band.as_ref() == Some(&self.new_feature_band)
    }
}

/// Formats the `version/band` pair used by workload sets and install state.
pub fn format_version_band(version: &str, band: &FeatureBand) -> String {
    format!("{version}/{band}")
}

pub fn parse_version_band(raw: &str) -> anyhow::Result<(String, FeatureBand)> {
    let (version, band) = raw
        .trim()
        .split_once('/')
        .ok_or_else(|| anyhow!("expected 'version/band', found '{raw}'"))?;
    if version.is_empty() {
        return Err(anyhow!("expected 'version/band', found '{raw}'"));
    }
    Ok((version.to_string(), FeatureBand::parse(band)?))
}
