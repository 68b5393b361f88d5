use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use workpack_core::{FeatureBand, HostArch};

use crate::fs_utils::{read_json_file, write_json_file};
use crate::install_state::InstallState;
use crate::WorkloadLayout;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadHistoryRecord {
    pub timestamp_unix: u64,
    pub command_name: String,
    #[serde(default)]
    pub workload_arguments: Vec<String>,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub state_before: InstallState,
    pub state_after: InstallState,
}

pub fn write_history_record(
    layout: &WorkloadLayout,
    arch: HostArch,
    band: &FeatureBand,
    record: &WorkloadHistoryRecord,
) -> Result<PathBuf> {
    let path = layout.history_dir(arch, band).join(format!(
        "{}_{}.json",
        record.timestamp_unix,
        record.command_name.replace(char::is_whitespace, "-")
    ));
    write_json_file(&path, record)?;
    Ok(path)
}

/// History records for a band, oldest first.
pub fn read_history_records(
    layout: &WorkloadLayout,
    arch: HostArch,
    band: &FeatureBand,
) -> Result<Vec<WorkloadHistoryRecord>> {
    let dir = layout.history_dir(arch, band);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", dir.display()));
        }
    };

    let mut records = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("failed to read entry in {}", dir.display()))?
            .path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        match read_json_file::<WorkloadHistoryRecord>(&path) {
            Ok(Some(record)) => records.push(record),
            Ok(None) => {}
            Err(err) => tracing::warn!(%err, path = %path.display(), "skipping unreadable history record"),
        }
    }
    records.sort_by_key(|record| record.timestamp_unix);
    Ok(records)
}
