//! Top-level workload commands. Each runs its mutations inside one
//! transaction, then garbage collects on a best-effort basis.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::Result;
use workpack_core::{
    FeatureBand, HostArch, ManifestId, ManifestVersionUpdate, ResolverFactory, WorkloadError,
    WorkloadId,
};

use crate::fs_utils::current_unix_timestamp;
use crate::gc::GcReport;
use crate::history::{write_history_record, WorkloadHistoryRecord};
use crate::install_state::InstallStateUpdate;
use crate::installer::{Installer, WorkloadDownload};
use crate::{Reporter, Transaction, WorkloadLayout};

/// Everything a command needs, borrowed for its duration.
#[derive(Clone, Copy)]
pub struct WorkloadContext<'c> {
    pub installer: &'c dyn Installer,
    pub factory: &'c dyn ResolverFactory,
    pub layout: &'c WorkloadLayout,
    pub arch: HostArch,
    pub reporter: &'c Reporter,
    pub offline_cache: Option<&'c Path>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateRequest {
    pub workload_set_version: Option<String>,
    pub manifest_pins: Option<BTreeMap<ManifestId, (String, FeatureBand)>>,
}

pub fn install_workloads(
    ctx: &WorkloadContext<'_>,
    workloads: &[WorkloadId],
    workload_set_version: Option<&str>,
) -> Result<i32> {
    run_recorded(ctx, "install", workloads, || {
        let band = ctx.installer.feature_band().clone();
        Transaction::execute(ctx.reporter, |tx| {
            if let Some(version) = workload_set_version {
                pin_workload_set(ctx, tx, version)?;
            }
            install_resolved_packs(ctx, tx, workloads)?;
            record_workloads(ctx, tx, workloads, &band)
        })?;
        ctx.reporter.line(format!(
            "Successfully installed workload(s) {}.",
            join_workloads(workloads)
        ));
        collect_after_success(ctx);
        Ok(())
    })
}

pub fn update_workloads(ctx: &WorkloadContext<'_>, request: &UpdateRequest) -> Result<i32> {
    let installer = ctx.installer;
    let workloads = installer
        .record_store()
        .installed_workloads(installer.feature_band())?
        .into_iter()
        .collect::<Vec<_>>();
    run_recorded(ctx, "update", &workloads, || {
        Transaction::execute(ctx.reporter, |tx| {
            if let Some(version) = &request.workload_set_version {
                pin_workload_set(ctx, tx, version)?;
            } else if let Some(pins) = &request.manifest_pins {
                install_manifest_pins(ctx, tx, pins)?;
            } else if installer.install_state()?.has_pins() {
                ctx.reporter
                    .verbose("Skipping manifest update; the install state pins workload versions.");
            }
            install_resolved_packs(ctx, tx, &workloads)
        })?;
        ctx.reporter.line("Successfully updated workload(s).");
        collect_after_success(ctx);
        Ok(())
    })
}

pub fn repair_workloads(ctx: &WorkloadContext<'_>) -> Result<i32> {
    let installer = ctx.installer;
    let band = installer.feature_band();
    let workloads = installer
        .record_store()
        .installed_workloads(band)?
        .into_iter()
        .collect::<Vec<_>>();
    run_recorded(ctx, "repair", &workloads, || {
        if workloads.is_empty() {
            ctx.reporter.line("No workloads are installed; nothing to repair.");
            return Ok(());
        }
        let resolver = ctx.factory.create(&installer.install_state()?.resolver_selection()?)?;
        let packs = resolver.packs_for_workloads(&workloads)?;
        installer.repair_packs(&packs, band, ctx.offline_cache)?;
        ctx.reporter.line(format!(
            "Successfully repaired workload(s) {}.",
            join_workloads(&workloads)
        ));
        Ok(())
    })
}

pub fn uninstall_workloads(ctx: &WorkloadContext<'_>, workloads: &[WorkloadId]) -> Result<i32> {
    run_recorded(ctx, "uninstall", workloads, || {
        let installer = ctx.installer;
        let band = installer.feature_band();
        let installed = installer.record_store().installed_workloads(band)?;
        if let Some(missing) = workloads.iter().find(|workload| !installed.contains(*workload)) {
            return Err(WorkloadError::WorkloadNotRecognized {
                workload: missing.to_string(),
            }
            .into());
        }

        for workload in workloads {
            ctx.reporter.line(format!("Uninstalling workload {workload}"));
            installer.record_store().delete_workload_record(workload, band)?;
        }
        collect_after_success(ctx);
        ctx.reporter.line(format!(
            "Successfully uninstalled workload(s) {}.",
            join_workloads(workloads)
        ));
        Ok(())
    })
}

/// Explicit garbage collection. Unlike the pass after an install, failures
/// are returned to the caller.
pub fn collect_workload_garbage(ctx: &WorkloadContext<'_>, clean_all: bool) -> Result<GcReport> {
    let report = ctx
        .installer
        .garbage_collect(ctx.factory, ctx.offline_cache, clean_all)?;
    tracing::info!(
        dropped = report.dropped.len(),
        deleted = report.deleted.len(),
        clean_all,
        "garbage collection finished"
    );
    Ok(report)
}

pub fn installed_workloads(ctx: &WorkloadContext<'_>) -> Result<BTreeSet<WorkloadId>> {
    ctx.installer
        .record_store()
        .installed_workloads(ctx.installer.feature_band())
}

/// Packages an install of `workloads` would fetch, without installing them.
pub fn workload_downloads(
    ctx: &WorkloadContext<'_>,
    workloads: &[WorkloadId],
    include_installed: bool,
) -> Result<Vec<WorkloadDownload>> {
    let installer = ctx.installer;
    let resolver = ctx.factory.create(&installer.install_state()?.resolver_selection()?)?;
    let packs = resolver.packs_for_workloads(workloads)?;
    installer.downloads(&packs, installer.feature_band(), include_installed)
}

/// Records that `global_json` pins `version`, so garbage collection keeps
/// that workload set for as long as the file says so.
pub fn pin_global_json_workload_set(
    ctx: &WorkloadContext<'_>,
    global_json: &Path,
    version: &str,
) -> Result<()> {
    tracing::debug!(path = %global_json.display(), version, "recording global.json workload set");
    ctx.installer.record_global_json_pin(global_json, version)
}

/// Nearest `global.json` at or above `start`.
pub fn find_global_json(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join("global.json"))
        .find(|candidate| candidate.is_file())
}

fn pin_workload_set<'a>(ctx: &WorkloadContext<'a>, tx: &mut Transaction<'a>, version: &str) -> Result<()> {
    let installer = ctx.installer;
    installer.install_workload_set(tx, version, ctx.offline_cache)?;
    let previous = installer.install_state()?.workload_version;
    tx.run_with_rollback(
        format!("pin workload set {version}"),
        |_| installer.adjust_workload_set(Some(version)),
        move || installer.adjust_workload_set(previous.as_deref()),
    )
}

fn install_manifest_pins<'a>(
    ctx: &WorkloadContext<'a>,
    tx: &mut Transaction<'a>,
    pins: &BTreeMap<ManifestId, (String, FeatureBand)>,
) -> Result<()> {
    let installer = ctx.installer;
    let state = installer.install_state()?;
    let current = ctx
        .factory
        .create(&state.resolver_selection()?)?
        .manifests()?
        .into_iter()
        .map(|manifest| (manifest.id.clone(), manifest))
        .collect::<BTreeMap<_, _>>();

    for (id, (version, band)) in pins {
        let existing = current.get(id);
        let update = ManifestVersionUpdate {
            manifest_id: id.clone(),
            existing_version: existing.map(|manifest| manifest.version.clone()),
            existing_feature_band: existing.map(|manifest| manifest.feature_band.clone()),
            new_version: version.clone(),
            new_feature_band: band.clone(),
        };
        if update.is_noop() {
            continue;
        }
        installer.install_manifest(tx, &update, ctx.offline_cache)?;
    }

    let previous = state.manifests;
    tx.run_with_rollback(
        "pin manifest versions",
        |_| installer.save_manifest_versions(pins),
        move || match &previous {
            Some(manifests) => installer.update_install_state(&InstallStateUpdate::ManifestVersions {
                manifests: manifests.clone(),
            }),
            None => installer.remove_manifests_from_install_state(),
        },
    )
}

fn install_resolved_packs<'a>(
    ctx: &WorkloadContext<'a>,
    tx: &mut Transaction<'a>,
    workloads: &[WorkloadId],
) -> Result<()> {
    let installer = ctx.installer;
    let resolver = ctx.factory.create(&installer.install_state()?.resolver_selection()?)?;
    let packs = resolver.packs_for_workloads(workloads)?;
    tracing::debug!(packs = packs.len(), "resolved workload packs");
    installer.install_packs(tx, &packs, installer.feature_band(), ctx.offline_cache)
}

fn record_workloads<'a>(
    ctx: &WorkloadContext<'a>,
    tx: &mut Transaction<'a>,
    workloads: &[WorkloadId],
    band: &FeatureBand,
) -> Result<()> {
    let installer = ctx.installer;
    let installed = installer.record_store().installed_workloads(band)?;
    for workload in workloads {
        let existed = installed.contains(workload);
        let (rollback_workload, rollback_band) = (workload.clone(), band.clone());
        tx.run_with_rollback(
            format!("record workload {workload}"),
            |_| installer.record_store().write_workload_record(workload, band),
            move || {
                if existed {
                    return Ok(());
                }
                installer
                    .record_store()
                    .delete_workload_record(&rollback_workload, &rollback_band)
            },
        )?;
    }
    Ok(())
}

fn collect_after_success(ctx: &WorkloadContext<'_>) {
    if let Err(err) = ctx
        .installer
        .garbage_collect(ctx.factory, ctx.offline_cache, false)
    {
        tracing::warn!(error = %format!("{err:#}"), "garbage collection failed");
        ctx.reporter
            .warning(format!("Workload garbage collection failed: {err:#}"));
    }
}

/// Runs a command and appends a history record describing it.
fn run_recorded(
    ctx: &WorkloadContext<'_>,
    command_name: &str,
    workloads: &[WorkloadId],
    body: impl FnOnce() -> Result<()>,
) -> Result<i32> {
    let installer = ctx.installer;
    let state_before = installer.install_state().unwrap_or_default();
    let outcome = body();

    let record = WorkloadHistoryRecord {
        timestamp_unix: current_unix_timestamp().unwrap_or_default(),
        command_name: command_name.to_string(),
        workload_arguments: workloads.iter().map(ToString::to_string).collect(),
        succeeded: outcome.is_ok(),
        error_message: outcome.as_ref().err().map(|err| format!("{err:#}")),
        state_before,
        state_after: installer.install_state().unwrap_or_default(),
    };
    if let Err(err) = write_history_record(ctx.layout, ctx.arch, installer.feature_band(), &record) {
        tracing::warn!(error = %format!("{err:#}"), "failed to write workload history");
    }

    outcome.map(|()| installer.exit_code())
}

fn join_workloads(workloads: &[WorkloadId]) -> String {
    workloads
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
