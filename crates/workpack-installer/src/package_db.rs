use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};

use crate::process::{run_command, run_command_exit_code};

/// The OS package database: installed products and their dependents.
pub trait PackageDatabase {
    /// Installed version of a product, `None` when it is not installed.
    fn installed_version(&self, product_code: &str) -> Result<Option<String>>;

    fn install(&self, package_path: &Path, log_path: &Path) -> Result<i32>;

    fn repair(&self, package_path: &Path, log_path: &Path) -> Result<i32>;

    fn uninstall(&self, product_code: &str, log_path: &Path) -> Result<i32>;

    fn dependents(&self, provider_key: &str) -> Result<Vec<String>>;

    fn add_dependent(&self, provider_key: &str, dependent: &str) -> Result<()>;

    fn remove_dependent(&self, provider_key: &str, dependent: &str) -> Result<()>;
}

const UNINSTALL_KEY: &str = r"HKLM\SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall";
const DEPENDENCIES_KEY: &str = r"HKLM\SOFTWARE\Classes\Installer\Dependencies";
// reg.exe exits with 1 when the key does not exist.
const REG_KEY_NOT_FOUND: i32 = 1;

/// Windows Installer through `msiexec` and `reg`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsInstallerDatabase;

impl WindowsInstallerDatabase {
    fn msiexec(&self, args: &[&str], target: &std::ffi::OsStr, log_path: &Path) -> Result<i32> {
        let mut command = Command::new("msiexec");
        command
            .args(args)
            .arg(target)
            .arg("/qn")
            .arg("/norestart")
            .arg("/l*v")
            .arg(log_path)
            .arg("MSIFASTINSTALL=7");
        run_command_exit_code(&mut command, "failed to run msiexec")
    }

    fn query(&self, key: &str) -> Result<Option<Vec<RegKey>>> {
        let output = Command::new("reg")
            .arg("query")
            .arg(key)
            .output()
            .with_context(|| format!("failed to query registry key {key}"))?;
        if output.status.code() == Some(REG_KEY_NOT_FOUND) {
            return Ok(None);
        }
        if !output.status.success() {
            anyhow::bail!(
                "failed to query registry key {key}: status={} stderr='{}'",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(Some(parse_reg_query(&String::from_utf8_lossy(&output.stdout))))
    }
}

impl PackageDatabase for WindowsInstallerDatabase {
    fn installed_version(&self, product_code: &str) -> Result<Option<String>> {
        let key = format!(r"{UNINSTALL_KEY}\{product_code}");
        Ok(self
            .query(&key)?
            .and_then(|keys| keys.into_iter().next())
            .and_then(|key| key.values.get("DisplayVersion").cloned()))
    }

    fn install(&self, package_path: &Path, log_path: &Path) -> Result<i32> {
        self.msiexec(&["/i"], package_path.as_os_str(), log_path)
    }

    fn repair(&self, package_path: &Path, log_path: &Path) -> Result<i32> {
        self.msiexec(&["/fvomus"], package_path.as_os_str(), log_path)
    }

    fn uninstall(&self, product_code: &str, log_path: &Path) -> Result<i32> {
        self.msiexec(&["/x"], std::ffi::OsStr::new(product_code), log_path)
    }

    fn dependents(&self, provider_key: &str) -> Result<Vec<String>> {
        let key = format!(r"{DEPENDENCIES_KEY}\{provider_key}\Dependents");
        let Some(keys) = self.query(&key)? else {
            return Ok(Vec::new());
        };
        Ok(keys
            .iter()
            .filter(|entry| !entry.path.eq_ignore_ascii_case(&expand_hive(&key)))
            .filter_map(|entry| entry.path.rsplit('\\').next().map(ToString::to_string))
            .collect())
    }

    fn add_dependent(&self, provider_key: &str, dependent: &str) -> Result<()> {
        let key = format!(r"{DEPENDENCIES_KEY}\{provider_key}\Dependents\{dependent}");
        run_command(
            Command::new("reg").arg("add").arg(&key).arg("/f"),
            "failed to add dependent",
        )
    }

    fn remove_dependent(&self, provider_key: &str, dependent: &str) -> Result<()> {
        let key = format!(r"{DEPENDENCIES_KEY}\{provider_key}\Dependents\{dependent}");
        let code = run_command_exit_code(
            Command::new("reg").arg("delete").arg(&key).arg("/f"),
            "failed to remove dependent",
        )?;
        if code != 0 && code != REG_KEY_NOT_FOUND {
            anyhow::bail!("failed to remove dependent {dependent} from {provider_key}: reg exited with {code}");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegKey {
    pub path: String,
    pub values: BTreeMap<String, String>,
}

fn expand_hive(key: &str) -> String {
    match key.split_once('\\') {
        Some(("HKLM", rest)) => format!(r"HKEY_LOCAL_MACHINE\{rest}"),
        _ => key.to_string(),
    }
}

/// Parses the text `reg query` prints: a key path line followed by
/// indented `name    type    data` value lines.
pub fn parse_reg_query(output: &str) -> Vec<RegKey> {
    let mut keys: Vec<RegKey> = Vec::new();
    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with("HKEY_") {
            keys.push(RegKey {
                path: line.trim().to_string(),
                values: BTreeMap::new(),
            });
            continue;
        }
        let Some(current) = keys.last_mut() else {
            continue;
        };
        let mut parts = line.trim_start().splitn(3, "    ");
        let (Some(name), Some(kind)) = (parts.next(), parts.next()) else {
            continue;
        };
        if !kind.starts_with("REG_") {
            continue;
        }
        let data = parts.next().unwrap_or_default().trim().to_string();
        current.values.insert(name.trim().to_string(), data);
    }
    keys
}
