use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use workpack_core::{
    manifest_package_id, workload_set_package_id, workload_set_version_to_package_version,
    ComponentIdentity, ComponentKind, FeatureBand, ManifestId, ManifestVersionUpdate,
    PackageFetcher, PackId, PackInfo, ResolverFactory,
};

use crate::component_records::{
    delete_manifest_record, delete_pack_record, delete_workload_set_record,
    manifest_record_exists, pack_record_bands, pack_record_exists, read_manifest_records,
    read_pack_record, read_pack_records, read_workload_set_records, write_manifest_record,
    write_pack_record, write_workload_set_record, workload_set_record_exists,
};
use crate::fetch::acquire_package;
use crate::fs_utils::{
    delete_empty_parents, make_tmp_dir, move_path, remove_dir_all_if_exists,
    remove_file_if_exists,
};
use crate::gc::{collect_garbage, compute_keep_set, GcReport, KeepSet, ReferenceLedger};
use crate::install_state::{self, InstallState, InstallStateUpdate};
use crate::installer::{Installer, InstallerKind, WorkloadDownload, EXIT_SUCCESS};
use crate::sdk::installed_feature_bands;
use crate::workload_records::{FileWorkloadRecordStore, WorkloadRecordStore};
use crate::{Reporter, Transaction, WorkloadLayout};

/// Installs workloads by extracting packages straight into the workload root.
pub struct FileBasedInstaller {
    layout: WorkloadLayout,
    band: FeatureBand,
    fetcher: Box<dyn PackageFetcher>,
    records: FileWorkloadRecordStore,
    reporter: Reporter,
}

impl FileBasedInstaller {
    pub fn new(
        layout: WorkloadLayout,
        band: FeatureBand,
        fetcher: Box<dyn PackageFetcher>,
        reporter: Reporter,
    ) -> Self {
        Self {
            records: FileWorkloadRecordStore::new(layout.clone()),
            layout,
            band,
            fetcher,
            reporter,
        }
    }

    pub fn layout(&self) -> &WorkloadLayout {
        &self.layout
    }

    fn place_pack(&self, pack: &PackInfo, offline_cache: Option<&Path>, workdir: &Path) -> Result<()> {
        let acquired = acquire_package(
            self.fetcher.as_ref(),
            offline_cache,
            &pack.resolved_package_id,
            &pack.version,
            &workdir.join("download"),
        )?;

        if pack.kind.is_single_file() {
            let staged = workdir.join("staged.nupkg");
            fs::copy(&acquired.path, &staged).with_context(|| {
                format!("failed to copy {} to {}", acquired.path.display(), staged.display())
            })?;
            return move_path(&staged, &pack.path);
        }

        let extract_dir = workdir.join("extract");
        self.fetcher
            .extract(&acquired.path, &extract_dir)
            .with_context(|| format!("failed to extract {}@{}", pack.id, pack.version))?;
        move_path(&extract_dir, &pack.path)
    }

    /// Only a payload this step placed is deleted; a pack that was already
    /// on disk stays, with or without records.
    fn roll_back_pack_install(
        &self,
        pack: &PackInfo,
        band: &FeatureBand,
        record_existed: bool,
        placed: bool,
    ) -> Result<()> {
        if !record_existed {
            delete_pack_record(&self.layout, &pack.id, &pack.version, band)?;
        }
        if placed
            && pack_record_bands(&self.layout, &pack.id, &pack.version)?.is_empty()
            && pack.path.exists()
        {
            self.reporter
                .verbose(format!("Rolling back installation of workload pack {} {}", pack.id, pack.version));
            delete_pack_payload(&self.layout, pack)?;
        }
        Ok(())
    }

    /// Places an extracted package at `target_dir`, moving any existing
    /// directory aside first so rollback can restore it untouched. `then`
    /// runs as a nested step once the payload is in place.
    fn install_package_dir<'a>(
        &'a self,
        tx: &mut Transaction<'a>,
        label: String,
        package_id: String,
        version: String,
        target_dir: PathBuf,
        offline_cache: Option<&Path>,
        then: impl FnOnce(&mut Transaction<'a>) -> Result<()>,
    ) -> Result<()> {
        let workdir = make_tmp_dir(&self.layout, "package")?;
        let backup_dir = workdir.join("backup");
        let target_existed = target_dir.exists();
        let offline_cache = offline_cache.map(Path::to_path_buf);

        let rollback_target = target_dir.clone();
        let rollback_backup = backup_dir.clone();
        let cleanup_workdir = workdir.clone();
        tx.run(
            label,
            |tx| {
                let acquired = acquire_package(
                    self.fetcher.as_ref(),
                    offline_cache.as_deref(),
                    &package_id,
                    &version,
                    &workdir.join("download"),
                )?;
                if target_existed {
                    move_path(&target_dir, &backup_dir)?;
                }
                let extract_dir = workdir.join("extract");
                self.fetcher
                    .extract(&acquired.path, &extract_dir)
                    .with_context(|| format!("failed to extract {package_id}@{version}"))?;
                let data_dir = extract_dir.join("data");
                let source = if data_dir.is_dir() { data_dir } else { extract_dir };
                move_path(&source, &target_dir)?;
                then(tx)
            },
            move || {
                if rollback_backup.exists() {
                    remove_dir_all_if_exists(&rollback_target).with_context(|| {
                        format!("failed to remove {}", rollback_target.display())
                    })?;
                    move_path(&rollback_backup, &rollback_target)?;
                } else if !target_existed {
                    remove_dir_all_if_exists(&rollback_target).with_context(|| {
                        format!("failed to remove {}", rollback_target.display())
                    })?;
                }
                Ok(())
            },
            move || {
                remove_dir_all_if_exists(&cleanup_workdir)
                    .with_context(|| format!("failed to remove {}", cleanup_workdir.display()))
            },
        )
    }

    fn garbage_collect_with_keep_set(&self, keep: &KeepSet, clean_all: bool) -> Result<GcReport> {
        let installed_bands = installed_feature_bands(&self.layout, &self.band)?;
        self.reporter.verbose(format!(
            "Garbage collecting for SDK feature bands {}",
            installed_bands
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" ")
        ));

        let ledger = FileLedger {
            layout: &self.layout,
            dropped_packs: RefCell::new(HashMap::new()),
        };
        collect_garbage(&ledger, keep, &self.band, &installed_bands, clean_all, &self.reporter)
    }
}

impl Installer for FileBasedInstaller {
    fn kind(&self) -> InstallerKind {
        InstallerKind::FileBased
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
            let record_existed = pack_record_exists(&self.layout, &pack.id, &pack.version, band);
            let workdir = make_tmp_dir(&self.layout, "pack")?;
            let rollback_pack = pack.clone();
            let rollback_band = band.clone();
            let cleanup_workdir = workdir.clone();
            let placed = Rc::new(Cell::new(false));
            let rollback_placed = Rc::clone(&placed);
            tx.run(
                format!("install pack {}@{}", pack.id, pack.version),
                |_| {
                    if pack.path.exists() {
                        self.reporter.line(format!(
                            "Workload pack {} version {} is already installed",
                            pack.id, pack.version
                        ));
                    } else {
                        self.reporter
                            .line(format!("Installing workload pack {} version {}", pack.id, pack.version));
                        self.place_pack(pack, offline_cache, &workdir)?;
                        placed.set(true);
                    }
                    write_pack_record(&self.layout, pack, band)?;
                    Ok(())
                },
                move || {
                    self.roll_back_pack_install(
                        &rollback_pack,
                        &rollback_band,
                        record_existed,
                        rollback_placed.get(),
                    )
                },
                move || {
                    remove_dir_all_if_exists(&cleanup_workdir)
                        .with_context(|| format!("failed to remove {}", cleanup_workdir.display()))
                },
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
        Transaction::execute(&self.reporter, |tx| {
            self.install_packs(tx, packs, band, offline_cache)
        })
    }

    fn install_manifest<'a>(
        &'a self,
        tx: &mut Transaction<'a>,
        update: &ManifestVersionUpdate,
        offline_cache: Option<&Path>,
    ) -> Result<()> {
        let manifest = update.target();
        self.reporter.line(format!(
            "Installing workload manifest {} version {}",
            manifest.id, manifest.version
        ));
        let target_dir = self
            .layout
            .manifest_install_dir(&manifest.id, &manifest.version, &manifest.feature_band);
        let package_id = manifest_package_id(&manifest.id, &manifest.feature_band);
        let referencing = self.band.clone();

        self.install_package_dir(
            tx,
            format!("install manifest {}@{}", manifest.id, manifest.version),
            package_id,
            manifest.version.clone(),
            target_dir,
            offline_cache,
            move |tx| {
                let record_existed = manifest_record_exists(
                    &self.layout,
                    &manifest.id,
                    &manifest.version,
                    &manifest.feature_band,
                    &referencing,
                );
                let rollback_manifest = manifest.clone();
                let rollback_band = referencing.clone();
                tx.run_with_rollback(
                    format!("record manifest {}@{}", manifest.id, manifest.version),
                    |_| {
                        write_manifest_record(
                            &self.layout,
                            &manifest.id,
                            &manifest.version,
                            &manifest.feature_band,
                            &referencing,
                        )
                        .map(|_| ())
                    },
                    move || {
                        if record_existed {
                            return Ok(());
                        }
                        delete_manifest_record(
                            &self.layout,
                            &rollback_manifest.id,
                            &rollback_manifest.version,
                            &rollback_manifest.feature_band,
                            &rollback_band,
                        )
                    },
                )
            },
        )
    }

    fn install_workload_set<'a>(
        &'a self,
        tx: &mut Transaction<'a>,
        version: &str,
        offline_cache: Option<&Path>,
    ) -> Result<()> {
        let (package_version, set_band) = workload_set_version_to_package_version(version)?;
        self.reporter
            .line(format!("Installing workload set version {version}"));
        let target_dir = self.layout.workload_set_install_dir(version, &set_band);
        let referencing = self.band.clone();
        let version = version.to_string();

        self.install_package_dir(
            tx,
            format!("install workload set {version}"),
            workload_set_package_id(&set_band),
            package_version,
            target_dir,
            offline_cache,
            move |tx| {
                let record_existed =
                    workload_set_record_exists(&self.layout, &version, &set_band, &referencing);
                let (rollback_version, rollback_set_band, rollback_band) =
                    (version.clone(), set_band.clone(), referencing.clone());
                tx.run_with_rollback(
                    format!("record workload set {version}"),
                    |_| {
                        write_workload_set_record(&self.layout, &version, &set_band, &referencing)
                            .map(|_| ())
                    },
                    move || {
                        if record_existed {
                            return Ok(());
                        }
                        delete_workload_set_record(
                            &self.layout,
                            &rollback_version,
                            &rollback_set_band,
                            &rollback_band,
                        )
                    },
                )
            },
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
        Ok(packs
            .iter()
            .filter(|pack| include_installed || !pack.path.exists())
            .map(|pack| WorkloadDownload {
                package_id: pack.resolved_package_id.clone(),
                version: pack.version.clone(),
            })
            .collect())
    }

    fn record_store(&self) -> &dyn WorkloadRecordStore {
        &self.records
    }

    fn install_state(&self) -> Result<InstallState> {
        install_state::read_install_state(&self.layout, &self.band)
    }

    fn update_install_state(&self, update: &InstallStateUpdate) -> Result<()> {
        install_state::update_install_state(&self.layout, &self.band, update).map(|_| ())
    }

    fn record_global_json_pin(&self, global_json: &Path, version: &str) -> Result<()> {
        install_state::record_global_json_pin(&self.layout, &self.band, global_json, version)
    }

    fn global_json_pins(&self) -> Result<BTreeMap<PathBuf, String>> {
        install_state::global_json_pins(&self.layout, &self.band)
    }

    fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    fn exit_code(&self) -> i32 {
        EXIT_SUCCESS
    }
}

pub(crate) fn delete_pack_payload(layout: &WorkloadLayout, pack: &PackInfo) -> Result<()> {
    if pack.kind.is_single_file() {
        remove_file_if_exists(&pack.path)
            .with_context(|| format!("failed to delete {}", pack.path.display()))?;
        return Ok(());
    }

    remove_dir_all_if_exists(&pack.path)
        .with_context(|| format!("failed to delete {}", pack.path.display()))?;
    if let Some(parent) = pack.path.parent() {
        delete_empty_parents(parent, &layout.workload_root().join("packs"))?;
    }
    Ok(())
}

/// Reference counts backed by the on-disk record tree.
struct FileLedger<'l> {
    layout: &'l WorkloadLayout,
    /// Pack records are read before deletion; the last one tells GC how to
    /// delete the payload.
    dropped_packs: RefCell<HashMap<ComponentIdentity, PackInfo>>,
}

impl FileLedger<'_> {
    fn component_band<'c>(component: &'c ComponentIdentity) -> Result<&'c FeatureBand> {
        component
            .feature_band
            .as_ref()
            .ok_or_else(|| anyhow!("{component} has no feature band"))
    }
}

impl ReferenceLedger for FileLedger<'_> {
    fn components(&self, kind: ComponentKind) -> Result<Vec<(ComponentIdentity, Vec<FeatureBand>)>> {
        Ok(match kind {
            ComponentKind::WorkloadSet => read_workload_set_records(self.layout)?
                .into_iter()
                .map(|((version, set_band), bands)| {
                    (ComponentIdentity::workload_set(&version, &set_band), bands)
                })
                .collect(),
            ComponentKind::Manifest => read_manifest_records(self.layout)?
                .into_iter()
                .map(|((id, version, manifest_band), bands)| {
                    (ComponentIdentity::manifest(&id, &version, &manifest_band), bands)
                })
                .collect(),
            ComponentKind::Pack => read_pack_records(self.layout)?
                .into_iter()
                .map(|((id, version), bands)| (ComponentIdentity::pack(&id, &version), bands))
                .collect(),
        })
    }

    fn drop_reference(&self, component: &ComponentIdentity, band: &FeatureBand) -> Result<()> {
        match component.kind {
            ComponentKind::WorkloadSet => delete_workload_set_record(
                self.layout,
                &component.version,
                Self::component_band(component)?,
                band,
            ),
            ComponentKind::Manifest => delete_manifest_record(
                self.layout,
                &ManifestId::new(component.id.as_str()),
                &component.version,
                Self::component_band(component)?,
                band,
            ),
            ComponentKind::Pack => {
                let pack_id = PackId::new(component.id.as_str());
                if let Some(info) = read_pack_record(self.layout, &pack_id, &component.version, band)? {
                    self.dropped_packs.borrow_mut().insert(component.clone(), info);
                }
                delete_pack_record(self.layout, &pack_id, &component.version, band)
            }
        }
    }

    fn remaining_references(&self, component: &ComponentIdentity) -> Result<usize> {
        let count = match component.kind {
            ComponentKind::WorkloadSet => {
                let set_band = Self::component_band(component)?;
                read_workload_set_records(self.layout)?
                    .get(&(component.version.clone(), set_band.clone()))
                    .map_or(0, Vec::len)
            }
            ComponentKind::Manifest => {
                let manifest_band = Self::component_band(component)?;
                read_manifest_records(self.layout)?
                    .get(&(
                        ManifestId::new(component.id.as_str()),
                        component.version.clone(),
                        manifest_band.clone(),
                    ))
                    .map_or(0, Vec::len)
            }
            ComponentKind::Pack => {
                pack_record_bands(self.layout, &PackId::new(component.id.as_str()), &component.version)?
                    .len()
            }
        };
        Ok(count)
    }

    fn delete_payload(&self, component: &ComponentIdentity) -> Result<()> {
        match component.kind {
            ComponentKind::WorkloadSet => {
                let set_band = Self::component_band(component)?;
                let dir = self.layout.workload_set_install_dir(&component.version, set_band);
                // Sets outside the workload root are not ours to delete.
                if dir.exists() {
                    remove_dir_all_if_exists(&dir)
                        .with_context(|| format!("failed to delete {}", dir.display()))?;
                    if let Some(parent) = dir.parent() {
                        delete_empty_parents(parent, &self.layout.manifests_dir(set_band))?;
                    }
                }
                Ok(())
            }
            ComponentKind::Manifest => {
                let manifest_band = Self::component_band(component)?;
                let id = ManifestId::new(component.id.as_str());
                let dir = self
                    .layout
                    .manifest_install_dir(&id, &component.version, manifest_band);
                remove_dir_all_if_exists(&dir)
                    .with_context(|| format!("failed to delete {}", dir.display()))?;
                if let Some(parent) = dir.parent() {
                    delete_empty_parents(parent, &self.layout.manifests_dir(manifest_band))?;
                }
                Ok(())
            }
            ComponentKind::Pack => {
                let info = self
                    .dropped_packs
                    .borrow()
                    .get(component)
                    .cloned()
                    .ok_or_else(|| anyhow!("no installation record describes {component}"))?;
                delete_pack_payload(self.layout, &info)
            }
        }
    }
}
