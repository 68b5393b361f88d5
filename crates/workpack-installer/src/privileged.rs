//! Operations that change machine-wide state and therefore need elevation.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Result;
use workpack_core::{FeatureBand, WorkloadId};

use crate::install_state::{self, InstallStateUpdate};
use crate::package_cache::{CachedPayload, PackageCache};
use crate::package_db::PackageDatabase;
use crate::process::{run_command, run_command_stdout};
use crate::workload_records::{FileWorkloadRecordStore, WorkloadRecordStore};
use crate::WorkloadLayout;

pub trait PrivilegedOps {
    fn install_package(&self, package_path: &Path, log_path: &Path) -> Result<i32>;

    fn repair_package(&self, package_path: &Path, log_path: &Path) -> Result<i32>;

    fn uninstall_package(&self, product_code: &str, log_path: &Path) -> Result<i32>;

    fn add_dependent(&self, provider_key: &str, dependent: &str) -> Result<()>;

    fn remove_dependent(&self, provider_key: &str, dependent: &str) -> Result<()>;

    fn cache_payload(&self, package_id: &str, version: &str, staged_dir: &Path) -> Result<CachedPayload>;

    fn remove_cached_payload(&self, package_id: &str, version: &str) -> Result<()>;

    fn update_install_state(&self, band: &FeatureBand, update: &InstallStateUpdate) -> Result<()>;

    fn record_global_json_pin(&self, band: &FeatureBand, global_json: &Path, version: &str) -> Result<()>;

    fn global_json_pins(&self, band: &FeatureBand) -> Result<BTreeMap<PathBuf, String>>;

    fn write_workload_record(&self, workload: &WorkloadId, band: &FeatureBand) -> Result<()>;

    fn delete_workload_record(&self, workload: &WorkloadId, band: &FeatureBand) -> Result<()>;

    fn shutdown(&self) -> Result<()>;
}

/// Performs privileged operations in this process, which must already be
/// elevated. The elevated server wraps one of these.
pub struct LocalPrivilegedOps {
    layout: WorkloadLayout,
    database: Box<dyn PackageDatabase>,
    cache: PackageCache,
    records: FileWorkloadRecordStore,
    agent: Box<dyn UpdateAgent>,
    agent_paused: Cell<bool>,
}

impl LocalPrivilegedOps {
    /// Pauses the update agent until [`PrivilegedOps::shutdown`].
    pub fn new(
        layout: WorkloadLayout,
        database: Box<dyn PackageDatabase>,
        cache: PackageCache,
        agent: Box<dyn UpdateAgent>,
    ) -> Self {
        let paused = match agent.pause() {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "failed to pause the update agent");
                false
            }
        };
        Self {
            records: FileWorkloadRecordStore::new(layout.clone()),
            layout,
            database,
            cache,
            agent,
            agent_paused: Cell::new(paused),
        }
    }

    pub fn cache(&self) -> &PackageCache {
        &self.cache
    }
}

impl PrivilegedOps for LocalPrivilegedOps {
    fn install_package(&self, package_path: &Path, log_path: &Path) -> Result<i32> {
        let package_path = self.cache.verify_in_cache(package_path)?;
        tracing::info!(package = %package_path.display(), "installing package");
        self.database.install(&package_path, log_path)
    }

    fn repair_package(&self, package_path: &Path, log_path: &Path) -> Result<i32> {
        let package_path = self.cache.verify_in_cache(package_path)?;
        tracing::info!(package = %package_path.display(), "repairing package");
        self.database.repair(&package_path, log_path)
    }

    fn uninstall_package(&self, product_code: &str, log_path: &Path) -> Result<i32> {
        tracing::info!(product_code, "uninstalling package");
        self.database.uninstall(product_code, log_path)
    }

    fn add_dependent(&self, provider_key: &str, dependent: &str) -> Result<()> {
        if self
            .database
            .dependents(provider_key)?
            .iter()
            .any(|existing| existing.eq_ignore_ascii_case(dependent))
        {
            return Ok(());
        }
        tracing::debug!(provider_key, dependent, "adding dependent");
        self.database.add_dependent(provider_key, dependent)
    }

    fn remove_dependent(&self, provider_key: &str, dependent: &str) -> Result<()> {
        if !self
            .database
            .dependents(provider_key)?
            .iter()
            .any(|existing| existing.eq_ignore_ascii_case(dependent))
        {
            return Ok(());
        }
        tracing::debug!(provider_key, dependent, "removing dependent");
        self.database.remove_dependent(provider_key, dependent)
    }

    fn cache_payload(&self, package_id: &str, version: &str, staged_dir: &Path) -> Result<CachedPayload> {
        self.cache.cache_payload(package_id, version, staged_dir)
    }

    fn remove_cached_payload(&self, package_id: &str, version: &str) -> Result<()> {
        self.cache.remove_payload(package_id, version)
    }

    fn update_install_state(&self, band: &FeatureBand, update: &InstallStateUpdate) -> Result<()> {
        install_state::update_install_state(&self.layout, band, update).map(|_| ())
    }

    fn record_global_json_pin(&self, band: &FeatureBand, global_json: &Path, version: &str) -> Result<()> {
        install_state::record_global_json_pin(&self.layout, band, global_json, version)
    }

    fn global_json_pins(&self, band: &FeatureBand) -> Result<BTreeMap<PathBuf, String>> {
        install_state::global_json_pins(&self.layout, band)
    }

    fn write_workload_record(&self, workload: &WorkloadId, band: &FeatureBand) -> Result<()> {
        self.records.write_workload_record(workload, band)
    }

    fn delete_workload_record(&self, workload: &WorkloadId, band: &FeatureBand) -> Result<()> {
        self.records.delete_workload_record(workload, band)
    }

    fn shutdown(&self) -> Result<()> {
        if self.agent_paused.replace(false) {
            self.agent.resume()?;
        }
        Ok(())
    }
}

/// A background service that must not run installs concurrently with ours.
pub trait UpdateAgent {
    fn pause(&self) -> Result<()>;

    fn resume(&self) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct NoopUpdateAgent;

impl UpdateAgent for NoopUpdateAgent {
    fn pause(&self) -> Result<()> {
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        Ok(())
    }
}

const WINDOWS_UPDATE_SERVICE: &str = "wuauserv";

/// Stops the Windows Update service while we hold the installer, and starts
/// it again only if it was running before.
#[derive(Debug, Default)]
pub struct WindowsUpdateAgent {
    stopped: Cell<bool>,
}

impl UpdateAgent for WindowsUpdateAgent {
    fn pause(&self) -> Result<()> {
        let status = run_command_stdout(
            Command::new("sc").arg("query").arg(WINDOWS_UPDATE_SERVICE),
            "failed to query the update service",
        )?;
        if !status.contains("RUNNING") {
            return Ok(());
        }
        run_command(
            Command::new("sc").arg("stop").arg(WINDOWS_UPDATE_SERVICE),
            "failed to stop the update service",
        )?;
        self.stopped.set(true);
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        if !self.stopped.replace(false) {
            return Ok(());
        }
        run_command(
            Command::new("sc").arg("start").arg(WINDOWS_UPDATE_SERVICE),
            "failed to start the update service",
        )
    }
}

pub fn default_update_agent() -> Box<dyn UpdateAgent> {
    if cfg!(windows) {
        Box::new(WindowsUpdateAgent::default())
    } else {
        Box::new(NoopUpdateAgent)
    }
}

/// Whether this process can change machine-wide state directly.
pub fn is_elevated() -> bool {
    if cfg!(windows) {
        return Command::new("net")
            .arg("session")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false);
    }
    Command::new("id")
        .arg("-u")
        .output()
        .map(|output| String::from_utf8_lossy(&output.stdout).trim() == "0")
        .unwrap_or(false)
}
