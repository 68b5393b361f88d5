//! Wires configuration into a layout, a resolver factory and the installer
//! backend that owns the band.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use workpack_core::{FeatureBand, HostArch};
use workpack_installer::{
    default_dotnet_root, default_update_agent, default_user_profile_dir, elevated_server_command,
    installed_sdk_versions, is_elevated, select_installer_kind, ChildProcessTransport,
    DispatchClient, ElevatedServer, FileBasedInstaller, HostOs, Installer, InstallerKind,
    LocalFeedFetcher, LocalPrivilegedOps, OsPackageInstaller, PackageCache, PrivilegedOps,
    Reporter, WindowsInstallerDatabase, WorkloadContext, WorkloadLayout, DEFAULT_DEPENDENT_PREFIX,
};
use workpack_resolver::ManifestDirectoryResolverFactory;

use crate::config::WorkpackConfig;

/// Flags that override config values.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub dotnet_root: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub package_feeds: Vec<PathBuf>,
}

/// Effective settings after merging flags over the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub dotnet_root: PathBuf,
    pub user_profile_dir: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub package_feeds: Vec<PathBuf>,
    pub package_cache_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub dependent_prefix: String,
    pub elevation_command: Vec<String>,
    pub config_path: Option<PathBuf>,
}

impl Settings {
    pub fn resolve(overrides: Overrides, config: WorkpackConfig) -> Result<Self> {
        let dotnet_root = match overrides.dotnet_root.or(config.dotnet_root) {
            Some(root) => root,
            None => default_dotnet_root()?,
        };
        let package_feeds = if overrides.package_feeds.is_empty() {
            config.package_feeds
        } else {
            overrides.package_feeds
        };
        Ok(Self {
            dotnet_root,
            user_profile_dir: config
                .user_profile_dir
                .or_else(|| default_user_profile_dir().ok()),
            temp_dir: config.temp_dir,
            package_feeds,
            package_cache_dir: config.package_cache_dir,
            log_dir: config.log_dir,
            dependent_prefix: config
                .dependent_prefix
                .unwrap_or_else(|| DEFAULT_DEPENDENT_PREFIX.to_string()),
            elevation_command: config.elevation_command,
            config_path: overrides.config_path,
        })
    }

    fn base_layout(&self) -> WorkloadLayout {
        let layout = WorkloadLayout::new(&self.dotnet_root);
        match &self.temp_dir {
            Some(temp_dir) => layout.with_temp_root(temp_dir),
            None => layout,
        }
    }

    fn package_cache(&self, layout: &WorkloadLayout) -> PackageCache {
        PackageCache::new(
            self.package_cache_dir
                .clone()
                .unwrap_or_else(|| layout.package_cache_dir()),
        )
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.base_layout().tmp_dir().join("logs"))
    }
}

/// The band a command acts on and where its workload content lives.
#[derive(Debug, Clone)]
pub struct Target {
    pub band: FeatureBand,
    pub arch: HostArch,
    pub layout: WorkloadLayout,
    pub kind: InstallerKind,
}

impl Target {
    pub fn resolve(settings: &Settings, sdk_version: Option<&str>) -> Result<Self> {
        let band = match sdk_version {
            Some(version) => FeatureBand::parse(version)?,
            None => newest_sdk_band(&settings.base_layout())?,
        };
        let arch = HostArch::current()
            .ok_or_else(|| anyhow!("unsupported host architecture '{}'", std::env::consts::ARCH))?;

        let mut layout =
            WorkloadLayout::resolve(&settings.dotnet_root, settings.user_profile_dir.as_deref(), &band);
        if let Some(temp_dir) = &settings.temp_dir {
            layout = layout.with_temp_root(temp_dir);
        }
        let kind = select_installer_kind(HostOs::current(), layout.msi_marker_path(&band).exists());
        tracing::debug!(
            %band,
            %arch,
            backend = kind.as_str(),
            workload_root = %layout.workload_root().display(),
            "resolved workload target"
        );
        Ok(Self {
            band,
            arch,
            layout,
            kind,
        })
    }
}

fn newest_sdk_band(layout: &WorkloadLayout) -> Result<FeatureBand> {
    installed_sdk_versions(layout)?
        .last()
        .map(FeatureBand::from_version)
        .ok_or_else(|| {
            anyhow!(
                "no SDK found under {}; pass --sdk-version",
                layout.sdk_dir().display()
            )
        })
}

/// Everything one command needs. Dropping it shuts the installer down.
pub struct Session {
    pub settings: Settings,
    pub target: Target,
    pub factory: ManifestDirectoryResolverFactory,
    pub reporter: Reporter,
    pub installer: Box<dyn Installer>,
}

impl Session {
    pub fn open(settings: Settings, target: Target, reporter: Reporter) -> Result<Self> {
        target.layout.ensure_base_dirs()?;
        let factory =
            ManifestDirectoryResolverFactory::new(target.layout.workload_root(), target.band.clone());
        let installer = build_installer(&settings, &target, &reporter)?;
        Ok(Self {
            settings,
            target,
            factory,
            reporter,
            installer,
        })
    }

    pub fn context<'c>(&'c self, offline_cache: Option<&'c Path>) -> WorkloadContext<'c> {
        WorkloadContext {
            installer: self.installer.as_ref(),
            factory: &self.factory,
            layout: &self.target.layout,
            arch: self.target.arch,
            reporter: &self.reporter,
            offline_cache,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(err) = self.installer.shutdown() {
            tracing::warn!(error = %format!("{err:#}"), "failed to shut down installer");
        }
    }
}

fn build_installer(settings: &Settings, target: &Target, reporter: &Reporter) -> Result<Box<dyn Installer>> {
    let fetcher = Box::new(LocalFeedFetcher::new(settings.package_feeds.clone()));
    match target.kind {
        InstallerKind::FileBased => Ok(Box::new(FileBasedInstaller::new(
            target.layout.clone(),
            target.band.clone(),
            fetcher,
            reporter.clone(),
        ))),
        InstallerKind::OsPackage => {
            let cache = settings.package_cache(&target.layout);
            let ops: Rc<dyn PrivilegedOps> = if is_elevated() {
                tracing::debug!("running privileged operations in process");
                Rc::new(LocalPrivilegedOps::new(
                    target.layout.clone(),
                    Box::new(WindowsInstallerDatabase),
                    cache.clone(),
                    default_update_agent(),
                ))
            } else {
                Rc::new(DispatchClient::new(spawn_elevated_server(settings)?))
            };
            let installer = OsPackageInstaller::new(
                target.layout.clone(),
                target.band.clone(),
                target.arch,
                fetcher,
                Box::new(WindowsInstallerDatabase),
                ops,
                reporter.clone(),
            )
            .with_package_cache(cache)
            .with_dependent_prefix(settings.dependent_prefix.as_str())
            .with_log_dir(settings.log_dir());
            Ok(Box::new(installer))
        }
    }
}

/// Arguments that make the elevated server see the same dotnet root and
/// config as this process.
pub fn elevated_server_args(settings: &Settings) -> Vec<OsString> {
    let mut args = vec![
        OsString::from("--dotnet-root"),
        settings.dotnet_root.clone().into_os_string(),
    ];
    if let Some(config_path) = &settings.config_path {
        args.push(OsString::from("--config"));
        args.push(config_path.clone().into_os_string());
    }
    args.push(OsString::from("elevated-server"));
    args
}

fn spawn_elevated_server(settings: &Settings) -> Result<ChildProcessTransport> {
    let program = std::env::current_exe().context("failed to locate the workpack executable")?;
    let command = elevated_server_command(
        &settings.elevation_command,
        &program,
        &elevated_server_args(settings),
    );
    tracing::info!(program = %program.display(), "starting elevated server");
    ChildProcessTransport::spawn(command)
}

/// Serves privileged requests from stdin until shutdown or end of input.
pub fn run_elevated_server(settings: &Settings) -> Result<()> {
    let layout = settings.base_layout();
    layout.ensure_base_dirs()?;
    let ops = LocalPrivilegedOps::new(
        layout.clone(),
        Box::new(WindowsInstallerDatabase),
        settings.package_cache(&layout),
        default_update_agent(),
    );
    let server = ElevatedServer::new(ops);
    server.serve(io::stdin().lock(), io::stdout().lock())
}

/// `{log_dir}/workpack_{timestamp}_{command}.log`
pub fn setup_log_path(log_dir: &Path, command: &str) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    log_dir.join(format!("workpack_{timestamp}_{command}.log"))
}
