mod completion;
mod config;
mod dispatch;
mod render;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};
use workpack_core::{parse_version_band, ErrorCategory, FeatureBand, ManifestId, WorkloadError, WorkloadId};
use workpack_installer::{
    collect_workload_garbage, default_dotnet_root, find_global_json, install_workloads, installed_workloads,
    pin_global_json_workload_set, read_global_json_workload_version, read_history_records,
    repair_workloads, uninstall_workloads, update_workloads, workload_downloads, InstallerKind,
    Reporter, UpdateRequest,
};

use crate::completion::{write_completions_script, CliCompletionShell};
use crate::config::{config_path, load_config, CONFIG_ENV};
use crate::dispatch::{run_elevated_server, setup_log_path, Overrides, Session, Settings, Target};
use crate::render::{
    current_output_style, print_section, print_status, render_status_line, OutputStyle, TerminalSink,
};

const LOG_ENV: &str = "WORKPACK_LOG";
const DEFAULT_LOG_FILTER: &str = "workpack=info";

#[derive(Parser, Debug)]
#[command(name = "workpack")]
#[command(about = "Install, update and remove SDK workloads", long_about = None)]
struct Cli {
    /// Dotnet installation to manage.
    #[arg(long, global = true)]
    dotnet_root: Option<PathBuf>,
    /// SDK version whose feature band the command acts on.
    #[arg(long, global = true)]
    sdk_version: Option<String>,
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Local package feed; repeatable. Replaces the configured feeds.
    #[arg(long = "source", global = true)]
    sources: Vec<PathBuf>,
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Install {
        #[arg(required = true)]
        workloads: Vec<String>,
        /// Workload set version to install and pin.
        #[arg(long)]
        version: Option<String>,
        #[arg(long)]
        offline_cache: Option<PathBuf>,
    },
    Update {
        #[arg(long, conflicts_with = "manifests")]
        version: Option<String>,
        /// Manifest pin as `id@version/band`; repeatable.
        #[arg(long = "manifest", value_name = "ID@VERSION/BAND")]
        manifests: Vec<String>,
        #[arg(long)]
        offline_cache: Option<PathBuf>,
    },
    Repair {
        #[arg(long)]
        offline_cache: Option<PathBuf>,
    },
    Uninstall {
        #[arg(required = true)]
        workloads: Vec<String>,
    },
    /// Delete workload content no installed band still references.
    #[command(alias = "clean")]
    Gc {
        /// Also drop every reference held by the current band.
        #[arg(long)]
        all: bool,
    },
    List,
    History,
    /// Print the packages an install would fetch.
    Download {
        #[arg(required = true)]
        workloads: Vec<String>,
        #[arg(long)]
        include_installed: bool,
    },
    Config {
        #[arg(long)]
        update_mode: Option<UpdateMode>,
    },
    #[command(hide = true)]
    ElevatedServer,
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum UpdateMode {
    WorkloadSet,
    Manifests,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Install { .. } => "install",
            Commands::Update { .. } => "update",
            Commands::Repair { .. } => "repair",
            Commands::Uninstall { .. } => "uninstall",
            Commands::Gc { .. } => "gc",
            Commands::List => "list",
            Commands::History => "history",
            Commands::Download { .. } => "download",
            Commands::Config { .. } => "config",
            Commands::ElevatedServer => "elevated-server",
            Commands::Completions { .. } => "completions",
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let style = current_output_style();
    let code = match run_cli(cli, style) {
        Ok(code) => code,
        Err(err) => {
            tracing::debug!(error = %format!("{err:#}"), "command failed");
            eprintln!("{}", render_status_line(style, "err", &render_error(&err)));
            1
        }
    };
    std::process::exit(code);
}

fn run_cli(cli: Cli, style: OutputStyle) -> Result<i32> {
    if let Commands::Completions { shell } = cli.command {
        write_completions_script(shell, &mut io::stdout().lock())?;
        return Ok(0);
    }

    let default_root = cli
        .dotnet_root
        .clone()
        .or_else(|| default_dotnet_root().ok());
    let config_path = config_path(
        cli.config.as_deref(),
        std::env::var_os(CONFIG_ENV).map(PathBuf::from),
        default_root.as_deref(),
    );
    let config = load_config(config_path.as_deref())?;
    let settings = Settings::resolve(
        Overrides {
            dotnet_root: cli.dotnet_root.clone(),
            config_path,
            package_feeds: cli.sources.clone(),
        },
        config,
    )?;

    if let Commands::ElevatedServer = cli.command {
        let log_file = cli
            .log_file
            .clone()
            .unwrap_or_else(|| setup_log_path(&settings.log_dir(), cli.command.name()));
        init_tracing(Some(&log_file))?;
        run_elevated_server(&settings)?;
        return Ok(0);
    }

    let target = Target::resolve(&settings, cli.sdk_version.as_deref())?;
    let log_file = cli.log_file.clone().or_else(|| {
        (target.kind == InstallerKind::OsPackage)
            .then(|| setup_log_path(&settings.log_dir(), cli.command.name()))
    });
    init_tracing(log_file.as_deref())?;

    let reporter = Reporter::new(Arc::new(TerminalSink::new(style, cli.verbose)));
    let session = Session::open(settings, target, reporter)?;
    run_command(&session, cli.command, style)
}

fn run_command(session: &Session, command: Commands, style: OutputStyle) -> Result<i32> {
    match command {
        Commands::Install {
            workloads,
            version,
            offline_cache,
        } => {
            let ctx = session.context(offline_cache.as_deref());
            let workloads = parse_workloads(&workloads);
            let global_json_pin = match version {
                Some(_) => None,
                None => global_json_workload_set()?,
            };
            let version = version.or_else(|| global_json_pin.as_ref().map(|(_, version)| version.clone()));
            let code = install_workloads(&ctx, &workloads, version.as_deref())?;
            if let Some((global_json, version)) = &global_json_pin {
                pin_global_json_workload_set(&ctx, global_json, version)?;
            }
            Ok(code)
        }
        Commands::Update {
            version,
            manifests,
            offline_cache,
        } => {
            let request = UpdateRequest {
                workload_set_version: version,
                manifest_pins: parse_manifest_pins(&manifests)?,
            };
            update_workloads(&session.context(offline_cache.as_deref()), &request)
        }
        Commands::Repair { offline_cache } => repair_workloads(&session.context(offline_cache.as_deref())),
        Commands::Uninstall { workloads } => {
            uninstall_workloads(&session.context(None), &parse_workloads(&workloads))
        }
        Commands::Gc { all } => {
            let report = collect_workload_garbage(&session.context(None), all)?;
            for component in &report.deleted {
                print_status(style, "ok", &format!("removed {component}"));
            }
            if report.deleted.is_empty() {
                print_status(style, "ok", "nothing to collect");
            }
            Ok(session.installer.exit_code())
        }
        Commands::List => {
            let ctx = session.context(None);
            print_section(style, &format!("Installed workloads ({})", session.target.band));
            let workloads = installed_workloads(&ctx)?;
            if workloads.is_empty() {
                println!("No workloads are installed.");
            }
            for workload in workloads {
                println!("{workload}");
            }
            if let Some(version) = session.installer.install_state()?.workload_version {
                println!("Workload set: {version}");
            }
            Ok(0)
        }
        Commands::History => {
            let target = &session.target;
            let records = read_history_records(&target.layout, target.arch, &target.band)?;
            print_section(style, &format!("Workload history ({})", target.band));
            for record in records {
                let status = if record.succeeded { "ok" } else { "err" };
                let line = format!(
                    "{} {} {}",
                    record.timestamp_unix,
                    record.command_name,
                    record.workload_arguments.join(" ")
                );
                print_status(style, status, line.trim_end());
            }
            Ok(0)
        }
        Commands::Download {
            workloads,
            include_installed,
        } => {
            let downloads =
                workload_downloads(&session.context(None), &parse_workloads(&workloads), include_installed)?;
            for download in downloads {
                println!("{} {}", download.package_id, download.version);
            }
            Ok(0)
        }
        Commands::Config { update_mode } => {
            if let Some(mode) = update_mode {
                session
                    .installer
                    .update_install_mode(mode == UpdateMode::WorkloadSet)?;
            }
            let use_workload_sets = session
                .installer
                .install_state()?
                .use_workload_sets
                .unwrap_or(false);
            let mode = if use_workload_sets { "workload-set" } else { "manifests" };
            println!("update mode: {mode}");
            Ok(0)
        }
        Commands::ElevatedServer | Commands::Completions { .. } => {
            Err(anyhow!("'{}' does not run against a workload session", command.name()))
        }
    }
}

fn parse_workloads(raw: &[String]) -> Vec<WorkloadId> {
    raw.iter().map(|id| WorkloadId::new(id.trim())).collect()
}

/// `id@version/band` pins; `None` when no pin was given.
fn parse_manifest_pins(raw: &[String]) -> Result<Option<BTreeMap<ManifestId, (String, FeatureBand)>>> {
    if raw.is_empty() {
        return Ok(None);
    }
    let mut pins = BTreeMap::new();
    for pin in raw {
        let (id, version_band) = pin
            .split_once('@')
            .ok_or_else(|| anyhow!("manifest pin '{pin}' must look like id@version/band"))?;
        let parsed = parse_version_band(version_band)
            .with_context(|| format!("invalid manifest pin '{pin}'"))?;
        pins.insert(ManifestId::new(id.trim()), parsed);
    }
    Ok(Some(pins))
}

/// The workload set pinned by the nearest global.json, with that file's path.
fn global_json_workload_set() -> Result<Option<(PathBuf, String)>> {
    let cwd = std::env::current_dir().context("failed to read the current directory")?;
    let Some(global_json) = find_global_json(&cwd) else {
        return Ok(None);
    };
    Ok(read_global_json_workload_version(&global_json)?.map(|version| (global_json, version)))
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

/// User-recoverable failures print as one line; anything else shows the
/// whole context chain.
fn render_error(err: &anyhow::Error) -> String {
    match WorkloadError::find(err) {
        Some(workload_err) if workload_err.category() == ErrorCategory::UserRecoverable => {
            workload_err.to_string()
        }
        _ => format!("{err:#}"),
    }
}

#[cfg(test)]
mod tests;
