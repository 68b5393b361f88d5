use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};

use crate::WorkloadLayout;

static TMP_DIR_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

pub fn remove_dir_all_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Walks up from `start` deleting empty directories, stopping at `stop_at`
/// (exclusive) or at the first directory that still has entries.
pub fn delete_empty_parents(start: &Path, stop_at: &Path) -> Result<()> {
    let mut current = Some(start);
    while let Some(dir) = current {
        if dir == stop_at || !dir.starts_with(stop_at) {
            break;
        }
        match fs::read_dir(dir) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                current = dir.parent();
                continue;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", dir.display()));
            }
        }
        fs::remove_dir(dir)
            .with_context(|| format!("failed to remove empty directory {}", dir.display()))?;
        current = dir.parent();
    }
    Ok(())
}

pub fn is_transient_io_error(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::PermissionDenied {
        return true;
    }
    let transient_codes: &[i32] = if cfg!(windows) {
        // access denied, sharing violation, lock violation
        &[5, 32, 33]
    } else {
        // EBUSY, ETXTBSY
        &[16, 26]
    };
    err.raw_os_error()
        .is_some_and(|code| transient_codes.contains(&code))
}

fn is_cross_device_error(err: &io::Error) -> bool {
    let code = if cfg!(windows) { 17 } else { 18 };
    err.raw_os_error() == Some(code)
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// policy runs out of attempts.
pub fn retry_on_transient_io<T>(
    policy: RetryPolicy,
    what: &str,
    mut op: impl FnMut() -> io::Result<T>,
) -> io::Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_transient_io_error(&err) && attempt + 1 < policy.attempts => {
                let delay = policy.delay_for(attempt);
                tracing::debug!(%err, attempt, delay_ms = delay.as_millis() as u64, "{what} hit a locked file; retrying");
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Moves a file or directory into place. Renames are retried while the
/// source or destination is locked; moves across volumes fall back to
/// copy-then-delete.
pub fn move_path(src: &Path, dst: &Path) -> Result<()> {
    move_path_with_policy(src, dst, RetryPolicy::default())
}

pub fn move_path_with_policy(src: &Path, dst: &Path, policy: RetryPolicy) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let renamed = retry_on_transient_io(policy, "move", || match fs::rename(src, dst) {
        Ok(()) => Ok(true),
        Err(err) if is_cross_device_error(&err) => Ok(false),
        Err(err) => Err(err),
    })
    .with_context(|| format!("failed to move {} to {}", src.display(), dst.display()))?;
    if renamed {
        return Ok(());
    }

    copy_into_place(src, dst)
}

/// Cross-volume move: copies into a sibling of `dst` on the destination
/// volume, then renames it into place. `dst` never holds a partial tree.
pub(crate) fn copy_into_place(src: &Path, dst: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(src)
        .with_context(|| format!("failed to stat {}", src.display()))?;
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let staging = sibling_staging_path(dst);
    let copied = if metadata.is_dir() {
        copy_dir_recursive(src, &staging)
    } else {
        fs::copy(src, &staging)
            .map(|_| ())
            .with_context(|| format!("failed to copy {} to {}", src.display(), staging.display()))
    };
    let placed = copied.and_then(|()| {
        fs::rename(&staging, dst).with_context(|| {
            format!("failed to move {} to {}", staging.display(), dst.display())
        })
    });

    if let Err(err) = placed {
        let cleanup = if metadata.is_dir() {
            remove_dir_all_if_exists(&staging)
        } else {
            remove_file_if_exists(&staging)
        };
        if let Err(cleanup_err) = cleanup {
            tracing::warn!(%cleanup_err, path = %staging.display(), "failed to remove partial copy");
        }
        return Err(err);
    }

    if metadata.is_dir() {
        fs::remove_dir_all(src)
            .with_context(|| format!("failed to cleanup moved dir: {}", src.display()))
    } else {
        fs::remove_file(src)
            .with_context(|| format!("failed to cleanup moved file: {}", src.display()))
    }
}

fn sibling_staging_path(dst: &Path) -> PathBuf {
    let name = dst
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "payload".to_string());
    dst.with_file_name(format!(
        ".{name}.partial-{}-{}",
        std::process::id(),
        TMP_DIR_SEQ.fetch_add(1, Ordering::Relaxed)
    ))
}

pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("failed to read {}", src.display()))? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let metadata = fs::symlink_metadata(&src_path)
            .with_context(|| format!("failed to stat {}", src_path.display()))?;
        if metadata.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
            continue;
        }

        #[cfg(unix)]
        if metadata.file_type().is_symlink() {
            let target = fs::read_link(&src_path)
                .with_context(|| format!("failed to read symlink {}", src_path.display()))?;
            std::os::unix::fs::symlink(&target, &dst_path).with_context(|| {
                format!(
                    "failed to create symlink {} -> {}",
                    dst_path.display(),
                    target.display()
                )
            })?;
            continue;
        }

        fs::copy(&src_path, &dst_path).with_context(|| {
            format!(
                "failed to copy {} to {}",
                src_path.display(),
                dst_path.display()
            )
        })?;
    }
    Ok(())
}

pub fn make_tmp_dir(layout: &WorkloadLayout, prefix: &str) -> Result<PathBuf> {
    let mut dir = layout.tmp_dir();
    dir.push(format!(
        "{}-{}-{}-{}",
        prefix,
        std::process::id(),
        current_unix_timestamp()?,
        TMP_DIR_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed creating tmp dir: {}", dir.display()))?;
    Ok(dir)
}

pub fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}

pub fn write_json_file<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let raw = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    fs::write(path, raw).with_context(|| format!("failed to write {}", path.display()))
}

pub fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|err| anyhow!("failed parsing {}: {err}", path.display()))
}
