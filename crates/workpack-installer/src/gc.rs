//! Cross-band reference-counted garbage collection.
//!
//! Only the current band's resolver is available, so references held by
//! other installed bands are always kept. A component's payload is deleted
//! only once its last reference has been dropped.

use std::collections::BTreeSet;

use anyhow::Result;
use workpack_core::{
    ComponentIdentity, ComponentKind, FeatureBand, ManifestId, PackId, ResolverFactory,
    ResolverSelection, WorkloadId, WorkloadResolver,
};

use crate::install_state::InstallState;
use crate::Reporter;

/// Components the current band must retain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeepSet {
    pub workload_sets: BTreeSet<String>,
    pub manifests: BTreeSet<(ManifestId, String, FeatureBand)>,
    pub packs: BTreeSet<(PackId, String)>,
}

impl KeepSet {
    pub fn contains(&self, component: &ComponentIdentity) -> bool {
        match component.kind {
            ComponentKind::WorkloadSet => self.workload_sets.contains(&component.version),
            ComponentKind::Manifest => component.feature_band.as_ref().is_some_and(|band| {
                self.manifests.contains(&(
                    ManifestId::new(component.id.as_str()),
                    component.version.clone(),
                    band.clone(),
                ))
            }),
            ComponentKind::Pack => self
                .packs
                .contains(&(PackId::new(component.id.as_str()), component.version.clone())),
        }
    }

    fn add_resolved(&mut self, resolver: &dyn WorkloadResolver, workloads: &[WorkloadId]) -> Result<()> {
        if let Some(version) = resolver.workload_set_version() {
            self.workload_sets.insert(version);
        }
        for manifest in resolver.manifests()? {
            self.manifests
                .insert((manifest.id, manifest.version, manifest.feature_band));
        }
        for pack in resolver.packs_for_workloads(workloads)? {
            // Native packages are named after the aliased package id.
            if pack.resolved_package_id != pack.id.as_str() {
                self.packs
                    .insert((PackId::new(pack.resolved_package_id.as_str()), pack.version.clone()));
            }
            self.packs.insert((pack.id, pack.version));
        }
        Ok(())
    }
}

/// Builds the keep-set from the band's install state, its installed
/// workloads, and the workload sets global.json files pin.
pub fn compute_keep_set(
    factory: &dyn ResolverFactory,
    install_state: &InstallState,
    installed_workloads: &BTreeSet<WorkloadId>,
    pinned_workload_sets: &BTreeSet<String>,
    reporter: &Reporter,
) -> Result<KeepSet> {
    let workloads = installed_workloads.iter().cloned().collect::<Vec<_>>();
    let mut keep = KeepSet::default();

    let selection = install_state.resolver_selection()?;
    let resolver = factory.create(&selection)?;
    keep.add_resolved(resolver.as_ref(), &workloads)?;

    for version in pinned_workload_sets {
        keep.workload_sets.insert(version.clone());
        let pinned = factory
            .create(&ResolverSelection::WorkloadSet(version.clone()))
            .and_then(|resolver| keep.add_resolved(resolver.as_ref(), &workloads));
        if let Err(err) = pinned {
            reporter.verbose(format!(
                "Could not resolve workload set {version} pinned by global.json: {err:#}"
            ));
        }
    }

    tracing::debug!(
        workload_sets = keep.workload_sets.len(),
        manifests = keep.manifests.len(),
        packs = keep.packs.len(),
        "computed keep-set"
    );
    Ok(keep)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    BandNotInstalled,
    NotInKeepSet,
    CleanAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Drop(DropReason),
}

/// Decides one reference from `referencing` to a component.
pub fn judge_reference(
    referencing: &FeatureBand,
    current: &FeatureBand,
    installed_bands: &BTreeSet<FeatureBand>,
    in_keep_set: bool,
    clean_all: bool,
) -> Verdict {
    if referencing == current {
        if clean_all {
            Verdict::Drop(DropReason::CleanAll)
        } else if in_keep_set {
            Verdict::Keep
        } else {
            Verdict::Drop(DropReason::NotInKeepSet)
        }
    } else if !installed_bands.contains(referencing) {
        Verdict::Drop(DropReason::BandNotInstalled)
    } else {
        Verdict::Keep
    }
}

/// Reference counts as a backend stores them.
pub trait ReferenceLedger {
    fn components(&self, kind: ComponentKind) -> Result<Vec<(ComponentIdentity, Vec<FeatureBand>)>>;

    fn drop_reference(&self, component: &ComponentIdentity, band: &FeatureBand) -> Result<()>;

    fn remaining_references(&self, component: &ComponentIdentity) -> Result<usize>;

    fn delete_payload(&self, component: &ComponentIdentity) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub dropped: Vec<(ComponentIdentity, FeatureBand)>,
    pub deleted: Vec<ComponentIdentity>,
}

pub fn collect_garbage(
    ledger: &dyn ReferenceLedger,
    keep: &KeepSet,
    current: &FeatureBand,
    installed_bands: &BTreeSet<FeatureBand>,
    clean_all: bool,
    reporter: &Reporter,
) -> Result<GcReport> {
    let mut report = GcReport::default();
    for kind in ComponentKind::COLLECTION_ORDER {
        for (component, bands) in ledger.components(kind)? {
            let in_keep_set = keep.contains(&component);
            let to_drop = bands
                .iter()
                .filter_map(|band| {
                    match judge_reference(band, current, installed_bands, in_keep_set, clean_all) {
                        Verdict::Keep => None,
                        Verdict::Drop(reason) => Some((band, reason)),
                    }
                })
                .collect::<Vec<_>>();
            if to_drop.is_empty() {
                continue;
            }

            for (band, reason) in to_drop {
                tracing::debug!(%component, %band, ?reason, "dropping reference");
                ledger.drop_reference(&component, band)?;
                report.dropped.push((component.clone(), band.clone()));
            }

            if ledger.remaining_references(&component)? == 0 {
                reporter.line(format!("Deleting {component}"));
                ledger.delete_payload(&component)?;
                report.deleted.push(component);
            }
        }
    }
    Ok(report)
}
