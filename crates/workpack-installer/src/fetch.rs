use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;

use anyhow::{Context, Result};
use workpack_core::{PackageFetcher, WorkloadError};

use crate::fs_utils::{is_transient_io_error, RetryPolicy};
use crate::process::run_command;

/// Fetches packages from plain folders of `.nupkg` files.
///
/// Both the flat layout (`{feed}/{id}.{version}.nupkg`) and the hierarchical
/// one (`{feed}/{id}/{version}/{id}.{version}.nupkg`, lowercased) are searched.
#[derive(Debug, Clone, Default)]
pub struct LocalFeedFetcher {
    feeds: Vec<PathBuf>,
}

impl LocalFeedFetcher {
    pub fn new(feeds: Vec<PathBuf>) -> Self {
        Self { feeds }
    }

    fn locate(&self, package_id: &str, version: &str) -> Option<PathBuf> {
        let lower_id = package_id.to_ascii_lowercase();
        let lower_version = version.to_ascii_lowercase();
        let lower_name = format!("{lower_id}.{lower_version}.nupkg");
        self.feeds.iter().find_map(|feed| {
            [
                feed.join(format!("{package_id}.{version}.nupkg")),
                feed.join(&lower_name),
                feed.join(&lower_id).join(&lower_version).join(&lower_name),
            ]
            .into_iter()
            .find(|candidate| candidate.is_file())
        })
    }
}

impl PackageFetcher for LocalFeedFetcher {
    fn download(&self, package_id: &str, version: &str, dest_dir: &Path) -> Result<PathBuf> {
        let source = self
            .locate(package_id, version)
            .ok_or_else(|| WorkloadError::PackageNotFound {
                package_id: package_id.to_string(),
                version: version.to_string(),
            })?;
        fs::create_dir_all(dest_dir)
            .with_context(|| format!("failed to create {}", dest_dir.display()))?;
        let dest = dest_dir.join(format!("{package_id}.{version}.nupkg"));
        if let Err(err) = fs::copy(&source, &dest) {
            if is_transient_io_error(&err) {
                return Err(WorkloadError::Transient {
                    operation: format!("download of {package_id}@{version}"),
                    message: err.to_string(),
                }
                .into());
            }
            return Err(err).with_context(|| {
                format!("failed to copy {} to {}", source.display(), dest.display())
            });
        }
        tracing::debug!(package = package_id, version, source = %source.display(), "fetched package from local feed");
        Ok(dest)
    }

    fn extract(&self, archive: &Path, dest: &Path) -> Result<()> {
        extract_zip(archive, dest)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredPackage {
    pub path: PathBuf,
    /// Offline cache entries belong to the user and are never cleaned up.
    pub from_offline_cache: bool,
}

/// Finds `package_id@version` in the offline cache, or downloads it.
pub fn acquire_package(
    fetcher: &dyn PackageFetcher,
    offline_cache: Option<&Path>,
    package_id: &str,
    version: &str,
    download_dir: &Path,
) -> Result<AcquiredPackage> {
    if let Some(cache) = offline_cache {
        let candidates = [
            cache.join(format!("{package_id}.{version}.nupkg")),
            cache.join(format!(
                "{}.{}.nupkg",
                package_id.to_ascii_lowercase(),
                version.to_ascii_lowercase()
            )),
        ];
        return candidates
            .into_iter()
            .find(|candidate| candidate.is_file())
            .map(|path| AcquiredPackage {
                path,
                from_offline_cache: true,
            })
            .ok_or_else(|| {
                WorkloadError::CacheMissingPackage {
                    package_id: package_id.to_string(),
                    version: version.to_string(),
                    cache: cache.to_path_buf(),
                }
                .into()
            });
    }

    let path = with_transient_retry(RetryPolicy::default(), "package download", || {
        fetcher.download(package_id, version, download_dir)
    })?;
    Ok(AcquiredPackage {
        path,
        from_offline_cache: false,
    })
}

/// Retries `op` while it fails with a transient [`WorkloadError`].
pub fn with_transient_retry<T>(
    policy: RetryPolicy,
    what: &str,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err)
                if attempt + 1 < policy.attempts
                    && WorkloadError::find(&err).is_some_and(WorkloadError::is_transient) =>
            {
                let delay = policy.delay_for(attempt);
                tracing::debug!(error = %format!("{err:#}"), attempt, "{what} failed transiently; retrying");
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

pub fn extract_zip(archive_path: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    if cfg!(windows) {
        let mut command = Command::new("powershell");
        command.arg("-NoProfile").arg("-Command").arg(format!(
            "Expand-Archive -LiteralPath '{}' -DestinationPath '{}' -Force",
            escape_ps_single_quote(archive_path),
            escape_ps_single_quote(dst)
        ));
        if run_command(&mut command, "failed to extract package with powershell").is_ok() {
            return Ok(());
        }
    }

    let mut unzip_command = Command::new("unzip");
    unzip_command.arg("-q").arg("-o").arg(archive_path).arg("-d").arg(dst);
    if run_command(&mut unzip_command, "failed to extract package with unzip").is_ok() {
        return Ok(());
    }

    run_command(
        Command::new("tar")
            .arg("-xf")
            .arg(archive_path)
            .arg("-C")
            .arg(dst),
        "failed to extract package with tar fallback",
    )
}

fn escape_ps_single_quote(path: &Path) -> String {
    let mut os = OsString::new();
    os.push(path.as_os_str());
    os.to_string_lossy().replace('\'', "''")
}
