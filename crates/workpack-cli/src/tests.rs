use std::ffi::OsString;
use std::fs;

use workpack_installer::ReportSink;

use super::*;
use crate::config::WorkpackConfig;
use crate::dispatch::elevated_server_args;

fn settings_for(dotnet_root: &Path) -> Settings {
    Settings::resolve(
        Overrides {
            dotnet_root: Some(dotnet_root.to_path_buf()),
            ..Overrides::default()
        },
        WorkpackConfig {
            user_profile_dir: Some(dotnet_root.join("profile")),
            temp_dir: Some(dotnet_root.join("tmp")),
            ..WorkpackConfig::default()
        },
    )
    .expect("settings must resolve")
}

#[test]
fn install_parses_workloads_and_version() {
    let cli = Cli::try_parse_from([
        "workpack",
        "install",
        "wasm-tools",
        "maui-android",
        "--version",
        "8.0.100",
        "--offline-cache",
        "/tmp/cache",
    ])
    .expect("command must parse");

    match cli.command {
        Commands::Install {
            workloads,
            version,
            offline_cache,
        } => {
            assert_eq!(workloads, vec!["wasm-tools", "maui-android"]);
            assert_eq!(version.as_deref(), Some("8.0.100"));
            assert_eq!(offline_cache, Some(PathBuf::from("/tmp/cache")));
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn install_requires_a_workload() {
    let err = Cli::try_parse_from(["workpack", "install"]).expect_err("must require a workload");
    assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
}

#[test]
fn global_flags_are_accepted_after_the_subcommand() {
    let cli = Cli::try_parse_from([
        "workpack",
        "list",
        "--dotnet-root",
        "/opt/dotnet",
        "--sdk-version",
        "8.0.204",
        "--source",
        "/feeds/a",
        "--source",
        "/feeds/b",
        "-v",
    ])
    .expect("command must parse");

    assert!(matches!(cli.command, Commands::List));
    assert_eq!(cli.dotnet_root, Some(PathBuf::from("/opt/dotnet")));
    assert_eq!(cli.sdk_version.as_deref(), Some("8.0.204"));
    assert_eq!(cli.sources, vec![PathBuf::from("/feeds/a"), PathBuf::from("/feeds/b")]);
    assert!(cli.verbose);
}

#[test]
fn update_rejects_a_version_together_with_manifest_pins() {
    let err = Cli::try_parse_from([
        "workpack",
        "update",
        "--version",
        "8.0.100",
        "--manifest",
        "microsoft.net.workload.mono.toolchain@8.0.3/8.0.100",
    ])
    .expect_err("options must conflict");
    assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
}

#[test]
fn clean_is_an_alias_for_gc() {
    let cli = Cli::try_parse_from(["workpack", "clean", "--all"]).expect("command must parse");
    assert!(matches!(cli.command, Commands::Gc { all: true }));
}

#[test]
fn config_accepts_update_modes() {
    let cli = Cli::try_parse_from(["workpack", "config", "--update-mode", "workload-set"])
        .expect("command must parse");
    assert!(matches!(
        cli.command,
        Commands::Config {
            update_mode: Some(UpdateMode::WorkloadSet)
        }
    ));
}

#[test]
fn manifest_pins_parse_id_version_and_band() {
    let pins = parse_manifest_pins(&[
        "microsoft.net.workload.mono.toolchain@8.0.3/8.0.100".to_string(),
        "microsoft.net.sdk.android@34.0.43/8.0.100".to_string(),
    ])
    .expect("pins must parse")
    .expect("pins must be present");

    assert_eq!(
        pins.get(&ManifestId::new("microsoft.net.sdk.android")),
        Some(&(
            "34.0.43".to_string(),
            FeatureBand::parse("8.0.100").expect("must parse band")
        ))
    );
    assert_eq!(pins.len(), 2);
}

#[test]
fn manifest_pins_are_absent_when_none_are_given() {
    assert!(parse_manifest_pins(&[]).expect("must parse").is_none());
}

#[test]
fn manifest_pin_without_an_id_is_rejected() {
    let err = parse_manifest_pins(&["8.0.3/8.0.100".to_string()]).expect_err("pin must be rejected");
    assert!(err.to_string().contains("id@version/band"));
}

#[test]
fn config_resolves_relative_paths_against_its_directory() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    let path = dir.path().join("workpack.toml");
    fs::write(
        &path,
        r#"
package_feeds = ["feeds/local", "/srv/feed"]
package_cache_dir = "cache"
dependent_prefix = "Contoso.Workloads"
elevation_command = ["sudo", "-n"]
"#,
    )
    .expect("must write config");

    let config = WorkpackConfig::load(&path).expect("config must load");
    assert_eq!(
        config.package_feeds,
        vec![dir.path().join("feeds/local"), PathBuf::from("/srv/feed")]
    );
    assert_eq!(config.package_cache_dir, Some(dir.path().join("cache")));
    assert_eq!(config.dependent_prefix.as_deref(), Some("Contoso.Workloads"));
    assert_eq!(config.elevation_command, vec!["sudo", "-n"]);
    assert_eq!(config.dotnet_root, None);
}

#[test]
fn config_rejects_unknown_keys() {
    let err = WorkpackConfig::parse("feeds = []").expect_err("unknown key must fail");
    assert!(format!("{err:#}").contains("failed to parse workpack config"));
}

#[test]
fn config_path_prefers_flag_then_environment_then_dotnet_root() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    let root_config = dir.path().join(config::CONFIG_FILE_NAME);

    assert_eq!(config_path(None, None, Some(dir.path())), None);

    fs::write(&root_config, "").expect("must write config");
    assert_eq!(config_path(None, None, Some(dir.path())), Some(root_config.clone()));
    assert_eq!(
        config_path(None, Some(PathBuf::from("/etc/workpack.toml")), Some(dir.path())),
        Some(PathBuf::from("/etc/workpack.toml"))
    );
    assert_eq!(
        config_path(
            Some(Path::new("/home/user/workpack.toml")),
            Some(PathBuf::from("/etc/workpack.toml")),
            Some(dir.path())
        ),
        Some(PathBuf::from("/home/user/workpack.toml"))
    );
}

#[test]
fn flags_override_configured_values() {
    let config = WorkpackConfig {
        dotnet_root: Some(PathBuf::from("/configured/dotnet")),
        package_feeds: vec![PathBuf::from("/configured/feed")],
        ..WorkpackConfig::default()
    };
    let settings = Settings::resolve(
        Overrides {
            dotnet_root: Some(PathBuf::from("/flag/dotnet")),
            config_path: None,
            package_feeds: vec![PathBuf::from("/flag/feed")],
        },
        config.clone(),
    )
    .expect("settings must resolve");
    assert_eq!(settings.dotnet_root, PathBuf::from("/flag/dotnet"));
    assert_eq!(settings.package_feeds, vec![PathBuf::from("/flag/feed")]);
    assert_eq!(settings.dependent_prefix, workpack_installer::DEFAULT_DEPENDENT_PREFIX);

    let settings = Settings::resolve(Overrides::default(), config).expect("settings must resolve");
    assert_eq!(settings.dotnet_root, PathBuf::from("/configured/dotnet"));
    assert_eq!(settings.package_feeds, vec![PathBuf::from("/configured/feed")]);
}

#[test]
fn target_uses_the_newest_installed_sdk_band() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    for sdk in ["8.0.100", "8.0.204", "7.0.410"] {
        fs::create_dir_all(dir.path().join("sdk").join(sdk)).expect("must create sdk dir");
    }
    let settings = settings_for(dir.path());

    let target = Target::resolve(&settings, None).expect("target must resolve");
    assert_eq!(target.band, FeatureBand::parse("8.0.200").expect("must parse band"));
    assert_eq!(target.layout.workload_root(), dir.path());

    let pinned = Target::resolve(&settings, Some("8.0.100")).expect("target must resolve");
    assert_eq!(pinned.band, FeatureBand::parse("8.0.100").expect("must parse band"));
}

#[test]
fn target_without_any_sdk_asks_for_a_version() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    let err = Target::resolve(&settings_for(dir.path()), None).expect_err("must fail without SDKs");
    assert!(err.to_string().contains("--sdk-version"));
}

#[test]
fn session_lists_nothing_on_a_fresh_root() {
    let dir = tempfile::tempdir().expect("must create tempdir");
    fs::create_dir_all(dir.path().join("sdk").join("8.0.100")).expect("must create sdk dir");
    let settings = settings_for(dir.path());
    let target = Target::resolve(&settings, None).expect("target must resolve");
    let (reporter, _report) = Reporter::buffered();

    let session = Session::open(settings, target, reporter).expect("session must open");
    assert_eq!(session.installer.kind(), InstallerKind::FileBased);
    assert!(installed_workloads(&session.context(None))
        .expect("must list workloads")
        .is_empty());
}

#[test]
fn elevated_server_args_carry_root_and_config() {
    let mut settings = settings_for(Path::new("/opt/dotnet"));
    settings.config_path = Some(PathBuf::from("/etc/workpack.toml"));

    let args = elevated_server_args(&settings);
    assert_eq!(
        args,
        vec![
            "--dotnet-root",
            "/opt/dotnet",
            "--config",
            "/etc/workpack.toml",
            "elevated-server"
        ]
    );
    let cli = Cli::try_parse_from(std::iter::once(OsString::from("workpack")).chain(args))
        .expect("server command must parse");
    assert!(matches!(cli.command, Commands::ElevatedServer));
}

#[test]
fn setup_log_path_names_the_command() {
    let path = setup_log_path(Path::new("/var/log/workpack"), "install");
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .expect("log path must have a file name");
    assert!(name.starts_with("workpack_"));
    assert!(name.ends_with("_install.log"));
    assert_eq!(path.parent(), Some(Path::new("/var/log/workpack")));
}

#[test]
fn user_recoverable_errors_render_as_one_line() {
    let err = anyhow::Error::from(WorkloadError::WorkloadNotRecognized {
        workload: "contoso".to_string(),
    })
    .context("failed to install workloads");
    let rendered = render_error(&err);
    assert!(!rendered.contains("failed to install workloads"));
    assert!(rendered.contains("contoso"));

    let err = anyhow!("disk full").context("failed to move pack");
    assert_eq!(render_error(&err), "failed to move pack: disk full");
}

#[test]
fn render_status_line_plain_is_unadorned() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "removed Contoso.Pack 1.0"),
        "removed Contoso.Pack 1.0"
    );
}

#[test]
fn render_status_line_rich_includes_ascii_badge() {
    assert_eq!(
        render_status_line(OutputStyle::Rich, "warn", "garbage collection failed"),
        "[WARN] garbage collection failed"
    );
}

#[test]
fn terminal_sink_hides_verbose_lines_unless_asked() {
    let quiet = TerminalSink::new(OutputStyle::Plain, false);
    assert_eq!(quiet.format_line(workpack_installer::ReportLevel::Verbose, "detail"), None);
    assert_eq!(
        quiet.format_line(workpack_installer::ReportLevel::Warning, "careful"),
        Some("careful".to_string())
    );

    let chatty = TerminalSink::new(OutputStyle::Plain, true);
    assert_eq!(
        chatty.format_line(workpack_installer::ReportLevel::Verbose, "detail"),
        Some("detail".to_string())
    );
    chatty.begin_activity("Installing Contoso.Pack");
    chatty.end_activity();
}

#[test]
fn completions_script_names_the_binary() {
    let mut script = Vec::new();
    write_completions_script(CliCompletionShell::Bash, &mut script).expect("must write completions");
    let script = String::from_utf8(script).expect("script must be utf-8");
    assert!(script.contains("workpack"));
    assert!(script.contains("elevated-server") || script.contains("install"));
}
