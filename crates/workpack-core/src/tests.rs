use std::path::Path;

use crate::*;

#[test]
fn feature_band_rounds_patch_down_to_hundreds() {
    let band = FeatureBand::parse("8.0.204").expect("must parse");
    assert_eq!(band.to_string(), "8.0.200");
    assert_eq!(band, FeatureBand::parse("8.0.299").expect("must parse"));
    assert_ne!(band, FeatureBand::parse("8.0.100").expect("must parse"));
}

#[test]
fn feature_band_keeps_first_two_prerelease_parts() {
    let band = FeatureBand::parse("9.0.100-preview.3.24204.13").expect("must parse");
    assert_eq!(band.to_string(), "9.0.100-preview.3");
    assert_eq!(band.prerelease(), Some("preview.3"));
    assert_eq!(band.release_band().to_string(), "9.0.100");
}

#[test]
fn feature_band_drops_daily_build_labels() {
    for version in ["9.0.100-dev", "9.0.100-ci", "9.0.100-rtm.24512.1"] {
        let band = FeatureBand::parse(version).expect("must parse");
        assert_eq!(band.to_string(), "9.0.100", "version {version}");
    }
}

#[test]
fn feature_band_rejects_garbage() {
    assert!(FeatureBand::parse("not-a-version").is_err());
    assert!(FeatureBand::parse("8.0").is_err());
}

#[test]
fn feature_band_serializes_as_string() {
    let band = FeatureBand::parse("8.0.100").expect("must parse");
    let raw = serde_json::to_string(&band).expect("must serialize");
    assert_eq!(raw, "\"8.0.100\"");
    let parsed: FeatureBand = serde_json::from_str(&raw).expect("must deserialize");
    assert_eq!(parsed, band);
}

#[test]
fn workload_set_versions_map_to_package_versions() {
    let (package, band) = workload_set_version_to_package_version("9.0.100").expect("must convert");
    assert_eq!(package, "9.100.0");
    assert_eq!(band.to_string(), "9.0.100");

    let (package, band) = workload_set_version_to_package_version("9.0.101.2").expect("must convert");
    assert_eq!(package, "9.101.2");
    assert_eq!(band.to_string(), "9.0.100");

    let (package, band) =
        workload_set_version_to_package_version("9.0.100-preview.2").expect("must convert");
    assert_eq!(package, "9.100.0-preview.2");
    assert_eq!(band.to_string(), "9.0.100-preview.2");
}

#[test]
fn workload_set_package_versions_map_back() {
    let band = FeatureBand::parse("9.0.100").expect("must parse");
    assert_eq!(
        workload_set_package_version_to_version(&band, "9.100.0").expect("must convert"),
        "9.0.100"
    );
    assert_eq!(
        workload_set_package_version_to_version(&band, "9.101.2").expect("must convert"),
        "9.0.101.2"
    );
}

#[test]
fn workload_set_version_rejects_malformed_input() {
    assert!(workload_set_version_to_package_version("9.0").is_err());
    assert!(workload_set_version_to_package_version("9.x.100").is_err());
}

#[test]
fn package_ids_follow_naming_convention() {
    let band = FeatureBand::parse("8.0.100").expect("must parse");
    assert_eq!(workload_set_package_id(&band), "Microsoft.NET.Workloads.8.0.100");
    assert_eq!(
        manifest_package_id(&ManifestId::new("microsoft.net.sdk.android"), &band),
        "microsoft.net.sdk.android.Manifest-8.0.100"
    );
    assert_eq!(
        msi_package_id("Microsoft.Android.Sdk", HostArch::Arm64),
        "Microsoft.Android.Sdk.Msi.arm64"
    );
}

#[test]
fn pack_paths_depend_on_kind() {
    let root = Path::new("/dotnet");
    let sdk = PackInfo::new(root, PackId::new("Microsoft.Android.Sdk"), "34.0.1", PackKind::Sdk);
    assert_eq!(sdk.path, root.join("packs").join("Microsoft.Android.Sdk").join("34.0.1"));
    assert!(!sdk.kind.is_single_file());

    let template = PackInfo::new(
        root,
        PackId::new("Microsoft.Android.Templates"),
        "34.0.1",
        PackKind::Template,
    );
    assert_eq!(
        template.path,
        root.join("template-packs").join("microsoft.android.templates.34.0.1.nupkg")
    );
    assert!(template.kind.is_single_file());
}

#[test]
fn pack_info_round_trips_through_json() {
    let pack = PackInfo::new(
        Path::new("/dotnet"),
        PackId::new("Microsoft.NET.Runtime.MonoTargets.Sdk"),
        "8.0.5",
        PackKind::Framework,
    );
    let raw = serde_json::to_string(&pack).expect("must serialize");
    assert!(raw.contains("\"resolvedPackageId\""));
    let parsed: PackInfo = serde_json::from_str(&raw).expect("must deserialize");
    assert_eq!(parsed, pack);
}

#[test]
fn errors_are_categorized() {
    let skew = WorkloadError::VersionSkew {
        component: "pack".to_string(),
        installed: "1.0.0".to_string(),
        requested: "2.0.0".to_string(),
    };
    assert_eq!(skew.category(), ErrorCategory::Integrity);

    let missing = WorkloadError::CacheMissingPackage {
        package_id: "p".to_string(),
        version: "1.0".to_string(),
        cache: "/cache".into(),
    };
    assert_eq!(missing.category(), ErrorCategory::UserRecoverable);

    let wrapped = anyhow::Error::new(missing.clone()).context("failed to install pack p");
    assert_eq!(WorkloadError::find(&wrapped), Some(&missing));
}

#[test]
fn host_arch_maps_rust_names() {
    assert_eq!(HostArch::from_rust_arch("x86_64"), Some(HostArch::X64));
    assert_eq!(HostArch::from_rust_arch("aarch64"), Some(HostArch::Arm64));
    assert_eq!(HostArch::from_rust_arch("riscv64"), None);
}

#[test]
fn manifest_update_noop_detection() {
    let band = FeatureBand::parse("8.0.100").expect("must parse");
    let update = ManifestVersionUpdate {
        manifest_id: ManifestId::new("m"),
        existing_version: Some("1.0.0".to_string()),
        existing_feature_band: Some(band.clone()),
        new_version: "1.0.0".to_string(),
        new_feature_band: band,
    };
    assert!(update.is_noop());
}

#[test]
fn version_band_pairs_parse() {
    let (version, band) = parse_version_band("8.0.5/8.0.100").expect("must parse");
    assert_eq!(version, "8.0.5");
    assert_eq!(band.to_string(), "8.0.100");
    assert_eq!(format_version_band(&version, &band), "8.0.5/8.0.100");
    assert!(parse_version_band("8.0.5").is_err());
}
