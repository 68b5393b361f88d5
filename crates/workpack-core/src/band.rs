use std::fmt;
use std::str::FromStr;

use anyhow::Context;
use semver::Version;
use serde::{Deserialize, Serialize};

/// A release line of the SDK, such as `8.0.100` or `9.0.100-preview.3`.
///
/// Any SDK version maps onto its band by rounding the patch number down to the
/// nearest hundred. Prerelease labels keep their first two dot-separated parts,
/// except for daily-build labels (`dev`, `ci`, `rtm`) which collapse onto the
/// release band.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeatureBand {
    major: u64,
    minor: u64,
    patch: u64,
    prerelease: Option<String>,
}

impl FeatureBand {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch: patch / 100 * 100,
            prerelease: None,
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        let trimmed = value.trim();
        let version = Version::parse(trimmed)
            .with_context(|| format!("invalid SDK version '{trimmed}'"))?;
        Ok(Self::from_version(&version))
    }

    pub fn from_version(version: &Version) -> Self {
        let mut band = Self::new(version.major, version.minor, version.patch);
        let pre = version.pre.as_str();
        if !pre.is_empty() && !is_daily_build_label(pre) {
            band.prerelease = Some(pre.split('.').take(2).collect::<Vec<_>>().join("."));
        }
        band
    }

    pub fn major(&self) -> u64 {
        self.major
    }

    pub fn minor(&self) -> u64 {
        self.minor
    }

    pub fn patch(&self) -> u64 {
        self.patch
    }

    pub fn prerelease(&self) -> Option<&str> {
        self.prerelease.as_deref()
    }

    /// The band without any prerelease label.
    pub fn release_band(&self) -> Self {
        Self::new(self.major, self.minor, self.patch)
    }
}

fn is_daily_build_label(pre: &str) -> bool {
    pre.contains("dev") || pre.contains("ci") || pre.contains("rtm")
}

impl fmt::Display for FeatureBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.prerelease {
            write!(f, "-{pre}")?;
        }
        Ok(())
    }
}

impl FromStr for FeatureBand {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FeatureBand {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FeatureBand> for String {
    fn from(band: FeatureBand) -> Self {
        band.to_string()
    }
}
