//! Installer backend that wraps every component in a native OS package and
//! reference-counts it through dependents on the package's provider key.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use workpack_core::{
    manifest_package_id, msi_package_id, workload_set_package_id,
    workload_set_package_version_to_version, workload_set_version_to_package_version,
    ComponentIdentity, ComponentKind, FeatureBand, HostArch, ManifestId, ManifestVersionUpdate,
    PackId, PackInfo, PackageFetcher, ResolverFactory, WorkloadError, WorkloadId,
};

use crate::fetch::acquire_package;
use crate::fs_utils::{current_unix_timestamp, make_tmp_dir, remove_dir_all_if_exists};
use crate::gc::{collect_garbage, compute_keep_set, GcReport, KeepSet, ReferenceLedger};
use crate::install_state::{self, InstallState, InstallStateUpdate};
use crate::installer::{
    Installer, InstallerKind, WorkloadDownload, EXIT_SUCCESS, EXIT_SUCCESS_REBOOT_REQUIRED,
};
use crate::package_cache::{CachedPayload, PackageCache};
use crate::package_db::PackageDatabase;
use crate::privileged::PrivilegedOps;
use crate::sdk::installed_feature_bands;
use crate::workload_records::{FileWorkloadRecordStore, WorkloadRecordStore};
use crate::{Reporter, Transaction, WorkloadLayout};

pub const DEFAULT_DEPENDENT_PREFIX: &str = "Microsoft.NET.Sdk";
pub const EXIT_SUCCESS_REBOOT_INITIATED: i32 = 1641;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectState {
    Absent,
    Present { version: String },
    /// Detection itself failed.
    Unknown { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageAction {
    Install,
    Repair,
    Uninstall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannedAction {
    None,
    Install,
    Repair,
    Uninstall,
}

impl PlannedAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Install => "install",
            Self::Repair => "repair",
            Self::Uninstall => "uninstall",
        }
    }
}

/// Decides what to run for `component` given its detected state.
///
/// Only one version of a product can be installed at a time, so a present
/// product at any other version is an error rather than something to fix up.
pub fn plan_package(
    component: &str,
    state: &DetectState,
    requested: PackageAction,
    target_version: &str,
) -> Result<PlannedAction, WorkloadError> {
    match state {
        DetectState::Unknown { message } => Err(WorkloadError::DetectionFailed {
            component: component.to_string(),
            message: message.clone(),
        }),
        DetectState::Absent => Ok(match requested {
            PackageAction::Install | PackageAction::Repair => PlannedAction::Install,
            PackageAction::Uninstall => PlannedAction::None,
        }),
        DetectState::Present { version } => match compare_product_versions(version, target_version) {
            Ordering::Equal => Ok(match requested {
                PackageAction::Install => PlannedAction::None,
                PackageAction::Repair => PlannedAction::Repair,
                PackageAction::Uninstall => PlannedAction::Uninstall,
            }),
            Ordering::Less => Err(WorkloadError::VersionSkew {
                component: component.to_string(),
                installed: version.clone(),
                requested: target_version.to_string(),
            }),
            Ordering::Greater => Err(WorkloadError::Downgrade {
                component: component.to_string(),
                installed: version.clone(),
                requested: target_version.to_string(),
            }),
        },
    }
}

/// Compares dotted product versions numerically; missing parts count as zero.
pub fn compare_product_versions(left: &str, right: &str) -> Ordering {
    let left_parts = left.split('.').collect::<Vec<_>>();
    let right_parts = right.split('.').collect::<Vec<_>>();
    for index in 0..left_parts.len().max(right_parts.len()) {
        let a = left_parts.get(index).copied().unwrap_or("0");
        let b = right_parts.get(index).copied().unwrap_or("0");
        let ordering = match (a.parse::<u64>(), b.parse::<u64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            _ => a.cmp(b),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    RebootRequired,
    Failed,
}

pub fn classify_exit_code(code: i32) -> ExitOutcome {
    match code {
        EXIT_SUCCESS => ExitOutcome::Success,
        EXIT_SUCCESS_REBOOT_REQUIRED | EXIT_SUCCESS_REBOOT_INITIATED => ExitOutcome::RebootRequired,
        _ => ExitOutcome::Failed,
    }
}

pub fn dependent_token(prefix: &str, band: &FeatureBand, arch: HostArch) -> String {
    format!("{prefix},{band},{arch}")
}

/// The feature band a dependent token was registered for, when the token is
/// one of ours for `arch`.
pub fn parse_dependent_token(token: &str, prefix: &str, arch: HostArch) -> Option<FeatureBand> {
    let parts = token.split(',').collect::<Vec<_>>();
    let [token_prefix, band, token_arch] = parts.as_slice() else {
        return None;
    };
    if !token_prefix.eq_ignore_ascii_case(prefix) || !token_arch.eq_ignore_ascii_case(arch.as_str()) {
        return None;
    }
    FeatureBand::parse(band).ok()
}

/// Maps a native package id back to the component it carries.
pub fn component_for_package(package_id: &str, version: &str, arch: HostArch) -> Option<ComponentIdentity> {
    let suffix = format!(".msi.{arch}");
    let lower = package_id.to_ascii_lowercase();
    if !lower.ends_with(&suffix) {
        return None;
    }
    let base = &package_id[..package_id.len() - suffix.len()];

    if let Some(band) = base.strip_prefix("Microsoft.NET.Workloads.") {
        let band = FeatureBand::parse(band).ok()?;
        let set_version = workload_set_package_version_to_version(&band, version).ok()?;
        return Some(ComponentIdentity::workload_set(&set_version, &band));
    }
    if let Some((id, band)) = base.rsplit_once(".Manifest-") {
        let band = FeatureBand::parse(band).ok()?;
        return Some(ComponentIdentity::manifest(&ManifestId::new(id), version, &band));
    }
    Some(ComponentIdentity::pack(&PackId::new(base), version))
}

/// Workload records are readable by anyone but written by the elevated side.
pub struct PrivilegedRecordStore {
    files: FileWorkloadRecordStore,
    ops: Rc<dyn PrivilegedOps>,
}

impl WorkloadRecordStore for PrivilegedRecordStore {
    fn installed_workloads(&self, band: &FeatureBand) -> Result<BTreeSet<WorkloadId>> {
        self.files.installed_workloads(band)
    }

    fn feature_bands_with_records(&self) -> Result<BTreeSet<FeatureBand>> {
        self.files.feature_bands_with_records()
    }

    fn write_workload_record(&self, workload: &WorkloadId, band: &FeatureBand) -> Result<()> {
        self.ops.write_workload_record(workload, band)
    }

    fn delete_workload_record(&self, workload: &WorkloadId, band: &FeatureBand) -> Result<()> {
        self.ops.delete_workload_record(workload, band)
    }
}

/// Shared between an install step and its rollback: the payload that was
/// used and whether our dependent was already registered before the step.
type InstalledPayload = Rc<RefCell<Option<(CachedPayload, bool)>>>;

pub struct OsPackageInstaller {
    layout: WorkloadLayout,
    band: FeatureBand,
    arch: HostArch,
    fetcher: Box<dyn PackageFetcher>,
    database: Box<dyn PackageDatabase>,
    cache: PackageCache,
    ops: Rc<dyn PrivilegedOps>,
    records: PrivilegedRecordStore,
    reporter: Reporter,
    dependent_prefix: String,
    log_dir: PathBuf,
    reboot_required: Cell<bool>,
    reboot_reported: Cell<bool>,
}

impl OsPackageInstaller {
    pub fn new(
        layout: WorkloadLayout,
        band: FeatureBand,
        arch: HostArch,
        fetcher: Box<dyn PackageFetcher>,
        database: Box<dyn PackageDatabase>,
        ops: Rc<dyn PrivilegedOps>,
        reporter: Reporter,
    ) -> Self {
        Self {
            records: PrivilegedRecordStore {
                files: FileWorkloadRecordStore::new(layout.clone()),
                ops: Rc::clone(&ops),
            },
            cache: PackageCache::new(layout.package_cache_dir()),
            log_dir: layout.tmp_dir(),
            layout,
            band,
            arch,
            fetcher,
            database,
            ops,
            reporter,
            dependent_prefix: DEFAULT_DEPENDENT_PREFIX.to_string(),
            reboot_required: Cell::new(false),
            reboot_reported: Cell::new(false),
        }
    }

    pub fn with_package_cache(mut self, cache: PackageCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_dependent_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.dependent_prefix = prefix.into();
        self
    }

    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = log_dir.into();
        self
    }

    pub fn reboot_required(&self) -> bool {
        self.reboot_required.get()
    }

    fn token(&self, band: &FeatureBand) -> String {
        dependent_token(&self.dependent_prefix, band, self.arch)
    }

    fn log_path(&self, package_id: &str, action: PlannedAction) -> Result<PathBuf> {
        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("failed to create {}", self.log_dir.display()))?;
        Ok(self.log_dir.join(format!(
            "workpack_{}_{package_id}_{}.log",
            current_unix_timestamp()?,
            action.as_str()
        )))
    }

    /// Returns the cached payload, fetching and caching it first if needed.
    fn acquire_payload(
        &self,
        package_id: &str,
        version: &str,
        offline_cache: Option<&Path>,
        workdir: &Path,
    ) -> Result<CachedPayload> {
        if let Some(payload) = self.cache.read_payload(package_id, version)? {
            tracing::debug!(package = package_id, version, "using cached payload");
            return Ok(payload);
        }
        let acquired = acquire_package(
            self.fetcher.as_ref(),
            offline_cache,
            package_id,
            version,
            &workdir.join("download"),
        )?;
        let extract_dir = workdir.join("extract");
        self.fetcher
            .extract(&acquired.path, &extract_dir)
            .with_context(|| format!("failed to extract {package_id}@{version}"))?;
        self.ops.cache_payload(package_id, version, &extract_dir)
    }

    fn detect(&self, payload: &CachedPayload) -> DetectState {
        match self.database.installed_version(&payload.manifest.product_code) {
            Ok(None) => DetectState::Absent,
            Ok(Some(version)) => DetectState::Present { version },
            Err(err) => DetectState::Unknown {
                message: format!("{err:#}"),
            },
        }
    }

    fn execute(&self, component: &str, payload: &CachedPayload, action: PlannedAction) -> Result<()> {
        if action == PlannedAction::None {
            return Ok(());
        }
        let log_path = self.log_path(&payload.package_id, action)?;
        let _activity = self.reporter.activity(&format!("{} {component}", action.as_str()));
        tracing::info!(component, action = action.as_str(), log = %log_path.display(), "executing package");
        let code = match action {
            PlannedAction::Install => self.ops.install_package(&payload.package_path, &log_path)?,
            PlannedAction::Repair => self.ops.repair_package(&payload.package_path, &log_path)?,
            PlannedAction::Uninstall => self
                .ops
                .uninstall_package(&payload.manifest.product_code, &log_path)?,
            PlannedAction::None => return Ok(()),
        };

        match classify_exit_code(code) {
            ExitOutcome::Success => Ok(()),
            ExitOutcome::RebootRequired => {
                self.reboot_required.set(true);
                if !self.reboot_reported.replace(true) {
                    self.reporter
                        .warning("A restart is required to complete the installation.");
                }
                Ok(())
            }
            ExitOutcome::Failed => Err(WorkloadError::InstallerFailed {
                operation: format!("{} of {component}", action.as_str()),
                code,
            }
            .into()),
        }
    }

    fn has_dependent(&self, payload: &CachedPayload, token: &str) -> Result<bool> {
        Ok(self
            .database
            .dependents(&payload.manifest.provider_key_name)?
            .iter()
            .any(|dependent| dependent.eq_ignore_ascii_case(token)))
    }

    fn install_component<'a>(
        &'a self,
        tx: &mut Transaction<'a>,
        component: String,
        package_id: String,
        version: String,
        band: FeatureBand,
        offline_cache: Option<&Path>,
    ) -> Result<()> {
        let workdir = make_tmp_dir(&self.layout, "msi")?;
        let installed: InstalledPayload = Rc::default();
        let rollback_installed = Rc::clone(&installed);
        let (rollback_component, rollback_band) = (component.clone(), band.clone());
        let cleanup_workdir = workdir.clone();

        tx.run(
            format!("install {component}"),
            |_| {
                let payload = self.acquire_payload(&package_id, &version, offline_cache, &workdir)?;
                let token = self.token(&band);
                let dependent_existed = self.has_dependent(&payload, &token)?;
                *installed.borrow_mut() = Some((payload.clone(), dependent_existed));

                let state = self.detect(&payload);
                let planned = plan_package(
                    &component,
                    &state,
                    PackageAction::Install,
                    &payload.manifest.product_version,
                )?;
                if planned == PlannedAction::None {
                    self.reporter.line(format!("{component} is already installed"));
                } else {
                    self.reporter.line(format!("Installing {component}"));
                }
                self.execute(&component, &payload, planned)?;
                self.ops
                    .add_dependent(&payload.manifest.provider_key_name, &token)
            },
            move || {
                let Some((payload, dependent_existed)) = rollback_installed.borrow().clone() else {
                    return Ok(());
                };
                if dependent_existed {
                    return Ok(());
                }
                self.roll_back_install(&rollback_component, &payload, &rollback_band)
            },
            move || {
                remove_dir_all_if_exists(&cleanup_workdir)
                    .with_context(|| format!("failed to remove {}", cleanup_workdir.display()))
            },
        )
    }

    /// Drops this band's dependent and uninstalls the product if nothing
    /// else depends on it. Safe to repeat.
    fn roll_back_install(&self, component: &str, payload: &CachedPayload, band: &FeatureBand) -> Result<()> {
        let state = self.detect(payload);
        let planned = match plan_package(
            component,
            &state,
            PackageAction::Uninstall,
            &payload.manifest.product_version,
        ) {
            Ok(planned) => planned,
            // Another version is installed; this step never touched it.
            Err(WorkloadError::Downgrade { .. } | WorkloadError::VersionSkew { .. }) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if planned != PlannedAction::Uninstall {
            return Ok(());
        }

        let provider_key = &payload.manifest.provider_key_name;
        self.ops.remove_dependent(provider_key, &self.token(band))?;
        let remaining = self.database.dependents(provider_key)?;
        if !remaining.is_empty() {
            self.reporter.verbose(format!(
                "Keeping {component}; it is still required by {}",
                remaining.join(", ")
            ));
            return Ok(());
        }
        self.reporter
            .verbose(format!("Rolling back installation of {component}"));
        self.execute(component, payload, PlannedAction::Uninstall)
    }

    fn pack_package(&self, pack: &PackInfo) -> (String, String) {
        (
            format!("workload pack {} {}", pack.id, pack.version),
            msi_package_id(&pack.resolved_package_id, self.arch),
        )
    }

    fn garbage_collect_with_keep_set(&self, keep: &KeepSet, clean_all: bool) -> Result<GcReport> {
        let installed_bands = installed_feature_bands(&self.layout, &self.band)?;
        let ledger = OsLedger {
            installer: self,
            payloads: RefCell::new(HashMap::new()),
        };
        collect_garbage(&ledger, keep, &self.band, &installed_bands, clean_all, &self.reporter)
    }
}

impl Installer for OsPackageInstaller {
    fn kind(&self) -> InstallerKind {
        InstallerKind::OsPackage
    }

    fn feature_band(&self) -> &FeatureBand {
        &self.band
    }

    fn install_packs<'a>(
        &'a self,
        tx: &mut Transaction<'a>,
        packs: &[PackInfo],
        band: &FeatureBand,
        offline_cache: Option<&Path>,
    ) -> Result<()> {
        for pack in packs {
            let (component, package_id) = self.pack_package(pack);
            self.install_component(
                tx,
                component,
                package_id,
                pack.version.clone(),
                band.clone(),
                offline_cache,
            )?;
        }
        Ok(())
    }

    fn repair_packs(
        &self,
        packs: &[PackInfo],
        band: &FeatureBand,
        offline_cache: Option<&Path>,
    ) -> Result<()> {
        for pack in packs {
            let (component, package_id) = self.pack_package(pack);
            let workdir = make_tmp_dir(&self.layout, "msi")?;
            let repaired = (|| {
                let payload = self.acquire_payload(&package_id, &pack.version, offline_cache, &workdir)?;
                let planned = plan_package(
                    &component,
                    &self.detect(&payload),
                    PackageAction::Repair,
                    &payload.manifest.product_version,
                )?;
                self.reporter.line(format!("Repairing {component}"));
                self.execute(&component, &payload, planned)?;
                self.ops
                    .add_dependent(&payload.manifest.provider_key_name, &self.token(band))
            })();
            remove_dir_all_if_exists(&workdir)
                .with_context(|| format!("failed to remove {}", workdir.display()))?;
            repaired?;
        }
        Ok(())
    }

    fn install_manifest<'a>(
        &'a self,
        tx: &mut Transaction<'a>,
        update: &ManifestVersionUpdate,
        offline_cache: Option<&Path>,
    ) -> Result<()> {
        let manifest = update.target();
        self.install_component(
            tx,
            format!("workload manifest {} {}", manifest.id, manifest.version),
            msi_package_id(&manifest_package_id(&manifest.id, &manifest.feature_band), self.arch),
            manifest.version,
            self.band.clone(),
            offline_cache,
        )
    }

    fn install_workload_set<'a>(
        &'a self,
        tx: &mut Transaction<'a>,
        version: &str,
        offline_cache: Option<&Path>,
    ) -> Result<()> {
        let (package_version, set_band) = workload_set_version_to_package_version(version)?;
        self.install_component(
            tx,
            format!("workload set {version}"),
            msi_package_id(&workload_set_package_id(&set_band), self.arch),
            package_version,
            self.band.clone(),
            offline_cache,
        )
    }

    fn garbage_collect(
        &self,
        factory: &dyn ResolverFactory,
        _offline_cache: Option<&Path>,
        clean_all: bool,
    ) -> Result<GcReport> {
        let keep = if clean_all {
            KeepSet::default()
        } else {
            compute_keep_set(
                factory,
                &self.install_state()?,
                &self.records.installed_workloads(&self.band)?,
                &self.pinned_workload_sets()?,
                &self.reporter,
            )?
        };

        let report = self.garbage_collect_with_keep_set(&keep, clean_all)?;

        if clean_all {
            for workload in self.records.installed_workloads(&self.band)? {
                self.records.delete_workload_record(&workload, &self.band)?;
            }
        }
        Ok(report)
    }

    fn downloads(
        &self,
        packs: &[PackInfo],
        _band: &FeatureBand,
        include_installed: bool,
    ) -> Result<Vec<WorkloadDownload>> {
        let mut downloads = Vec::new();
        for pack in packs {
            let (_, package_id) = self.pack_package(pack);
            if !include_installed {
                if let Some(payload) = self.cache.read_payload(&package_id, &pack.version)? {
                    if matches!(self.detect(&payload), DetectState::Present { .. }) {
                        continue;
                    }
                }
            }
            downloads.push(WorkloadDownload {
                package_id,
                version: pack.version.clone(),
            });
        }
        Ok(downloads)
    }

    fn record_store(&self) -> &dyn WorkloadRecordStore {
        &self.records
    }

    fn install_state(&self) -> Result<InstallState> {
        install_state::read_install_state(&self.layout, &self.band)
    }

    fn update_install_state(&self, update: &InstallStateUpdate) -> Result<()> {
        self.ops.update_install_state(&self.band, update)
    }

    fn record_global_json_pin(&self, global_json: &Path, version: &str) -> Result<()> {
        self.ops.record_global_json_pin(&self.band, global_json, version)
    }

    fn global_json_pins(&self) -> Result<BTreeMap<PathBuf, String>> {
        self.ops.global_json_pins(&self.band)
    }

    fn shutdown(&self) -> Result<()> {
        self.ops.shutdown()
    }

    fn exit_code(&self) -> i32 {
        if self.reboot_required.get() {
            EXIT_SUCCESS_REBOOT_REQUIRED
        } else {
            EXIT_SUCCESS
        }
    }
}

/// Reference counts kept as dependents on each cached payload's provider key.
struct OsLedger<'i> {
    installer: &'i OsPackageInstaller,
    payloads: RefCell<HashMap<ComponentIdentity, CachedPayload>>,
}

impl OsLedger<'_> {
    fn payload(&self, component: &ComponentIdentity) -> Result<CachedPayload> {
        self.payloads
            .borrow()
            .get(component)
            .cloned()
            .ok_or_else(|| anyhow!("no cached payload describes {component}"))
    }
}

impl ReferenceLedger for OsLedger<'_> {
    fn components(&self, kind: ComponentKind) -> Result<Vec<(ComponentIdentity, Vec<FeatureBand>)>> {
        let installer = self.installer;
        let mut components = Vec::new();
        for (package_id, version) in installer.cache.entries()? {
            let Some(component) = component_for_package(&package_id, &version, installer.arch) else {
                continue;
            };
            if component.kind != kind {
                continue;
            }
            let payload = match installer.cache.read_payload(&package_id, &version) {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(package = %package_id, %version, error = %format!("{err:#}"), "skipping unreadable cached payload");
                    continue;
                }
            };
            match installer.detect(&payload) {
                DetectState::Present { .. } => {}
                DetectState::Absent => continue,
                DetectState::Unknown { message } => {
                    return Err(WorkloadError::DetectionFailed {
                        component: component.to_string(),
                        message,
                    }
                    .into());
                }
            }

            let bands = installer
                .database
                .dependents(&payload.manifest.provider_key_name)?
                .iter()
                .filter_map(|token| {
                    parse_dependent_token(token, &installer.dependent_prefix, installer.arch)
                })
                .collect::<Vec<_>>();
            self.payloads.borrow_mut().insert(component.clone(), payload);
            components.push((component, bands));
        }
        Ok(components)
    }

    fn drop_reference(&self, component: &ComponentIdentity, band: &FeatureBand) -> Result<()> {
        let payload = self.payload(component)?;
        self.installer
            .ops
            .remove_dependent(&payload.manifest.provider_key_name, &self.installer.token(band))
    }

    fn remaining_references(&self, component: &ComponentIdentity) -> Result<usize> {
        let payload = self.payload(component)?;
        Ok(self
            .installer
            .database
            .dependents(&payload.manifest.provider_key_name)?
            .len())
    }

    fn delete_payload(&self, component: &ComponentIdentity) -> Result<()> {
        let installer = self.installer;
        let payload = self.payload(component)?;
        let label = component.to_string();
        let planned = plan_package(
            &label,
            &installer.detect(&payload),
            PackageAction::Uninstall,
            &payload.manifest.product_version,
        )?;
        installer.execute(&label, &payload, planned)?;
        installer
            .ops
            .remove_cached_payload(&payload.package_id, &payload.version)
    }
}
