use std::collections::BTreeSet;
use std::fs;
use std::io;

use anyhow::{Context, Result};
use workpack_core::{FeatureBand, WorkloadId};

use crate::fs_utils::{delete_empty_parents, remove_file_if_exists};
use crate::WorkloadLayout;

/// Which workloads each feature band has installed.
pub trait WorkloadRecordStore {
    fn installed_workloads(&self, band: &FeatureBand) -> Result<BTreeSet<WorkloadId>>;

    fn feature_bands_with_records(&self) -> Result<BTreeSet<FeatureBand>>;

    fn write_workload_record(&self, workload: &WorkloadId, band: &FeatureBand) -> Result<()>;

    fn delete_workload_record(&self, workload: &WorkloadId, band: &FeatureBand) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileWorkloadRecordStore {
    layout: WorkloadLayout,
}

impl FileWorkloadRecordStore {
    pub fn new(layout: WorkloadLayout) -> Self {
        Self { layout }
    }
}

impl WorkloadRecordStore for FileWorkloadRecordStore {
    fn installed_workloads(&self, band: &FeatureBand) -> Result<BTreeSet<WorkloadId>> {
        let dir = self.layout.workload_records_dir(band);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", dir.display()));
            }
        };

        let mut workloads = BTreeSet::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
            if let Some(name) = entry.file_name().to_str() {
                workloads.insert(WorkloadId::new(name));
            }
        }
        Ok(workloads)
    }

    fn feature_bands_with_records(&self) -> Result<BTreeSet<FeatureBand>> {
        let dir = self.layout.metadata_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", dir.display()));
            }
        };

        let mut bands = BTreeSet::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
            let Some(name) = entry.file_name().to_str().map(ToString::to_string) else {
                continue;
            };
            let Ok(band) = FeatureBand::parse(&name) else {
                continue;
            };
            if !self.installed_workloads(&band)?.is_empty() {
                bands.insert(band);
            }
        }
        Ok(bands)
    }

    fn write_workload_record(&self, workload: &WorkloadId, band: &FeatureBand) -> Result<()> {
        let dir = self.layout.workload_records_dir(band);
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(workload.as_str());
        fs::write(&path, b"")
            .with_context(|| format!("failed to write workload record {}", path.display()))
    }

    fn delete_workload_record(&self, workload: &WorkloadId, band: &FeatureBand) -> Result<()> {
        let dir = self.layout.workload_records_dir(band);
        let path = dir.join(workload.as_str());
        remove_file_if_exists(&path)
            .with_context(|| format!("failed to delete workload record {}", path.display()))?;
        delete_empty_parents(&dir, &self.layout.band_metadata_dir(band))
    }
}
