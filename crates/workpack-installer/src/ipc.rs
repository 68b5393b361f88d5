//! Line-delimited JSON protocol between an unelevated client and the
//! elevated server, which owns every machine-wide write.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use workpack_core::{FeatureBand, WorkloadError, WorkloadId};

use crate::install_state::InstallStateUpdate;
use crate::package_cache::CachedPayload;
use crate::privileged::PrivilegedOps;

pub const RESULT_SUCCESS: i32 = 0;
pub const RESULT_INSTALL_FAILURE: i32 = 1603;
pub const RESULT_INSTALL_PACKAGE_INVALID: i32 = 1620;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "kebab-case")]
pub enum PrivilegedRequest {
    InstallPackage { package_path: PathBuf, log_path: PathBuf },
    RepairPackage { package_path: PathBuf, log_path: PathBuf },
    UninstallPackage { product_code: String, log_path: PathBuf },
    AddDependent { provider_key: String, dependent: String },
    RemoveDependent { provider_key: String, dependent: String },
    CachePayload { package_id: String, version: String, staged_dir: PathBuf },
    RemoveCachedPayload { package_id: String, version: String },
    UpdateInstallState { band: FeatureBand, update: InstallStateUpdate },
    RecordGlobalJsonPin { band: FeatureBand, global_json: PathBuf, version: String },
    GetGlobalJsonPins { band: FeatureBand },
    WriteWorkloadRecord { workload: WorkloadId, band: FeatureBand },
    DeleteWorkloadRecord { workload: WorkloadId, band: FeatureBand },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivilegedResponse {
    pub result_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl PrivilegedResponse {
    pub fn success(payload: Option<Value>) -> Self {
        Self {
            result_code: RESULT_SUCCESS,
            message: None,
            payload,
        }
    }

    pub fn failure(err: &anyhow::Error) -> Self {
        let result_code = match WorkloadError::find(err) {
            Some(WorkloadError::InvalidPackage { .. }) => RESULT_INSTALL_PACKAGE_INVALID,
            Some(WorkloadError::ElevatedRequestFailed { code, .. }) => *code,
            _ => RESULT_INSTALL_FAILURE,
        };
        Self {
            result_code,
            message: Some(format!("{err:#}")),
            payload: None,
        }
    }
}

/// Serves requests against privileged operations held in this process.
pub struct ElevatedServer<O> {
    ops: O,
}

impl<O: PrivilegedOps> ElevatedServer<O> {
    pub fn new(ops: O) -> Self {
        Self { ops }
    }

    pub fn handle(&self, request: &PrivilegedRequest) -> PrivilegedResponse {
        match self.dispatch(request) {
            Ok(payload) => PrivilegedResponse::success(payload),
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "elevated request failed");
                PrivilegedResponse::failure(&err)
            }
        }
    }

    fn dispatch(&self, request: &PrivilegedRequest) -> Result<Option<Value>> {
        let ops = &self.ops;
        let payload = match request {
            PrivilegedRequest::InstallPackage { package_path, log_path } => {
                Some(Value::from(ops.install_package(package_path, log_path)?))
            }
            PrivilegedRequest::RepairPackage { package_path, log_path } => {
                Some(Value::from(ops.repair_package(package_path, log_path)?))
            }
            PrivilegedRequest::UninstallPackage { product_code, log_path } => {
                Some(Value::from(ops.uninstall_package(product_code, log_path)?))
            }
            PrivilegedRequest::AddDependent { provider_key, dependent } => {
                ops.add_dependent(provider_key, dependent)?;
                None
            }
            PrivilegedRequest::RemoveDependent { provider_key, dependent } => {
                ops.remove_dependent(provider_key, dependent)?;
                None
            }
            PrivilegedRequest::CachePayload { package_id, version, staged_dir } => {
                Some(serde_json::to_value(ops.cache_payload(package_id, version, staged_dir)?)?)
            }
            PrivilegedRequest::RemoveCachedPayload { package_id, version } => {
                ops.remove_cached_payload(package_id, version)?;
                None
            }
            PrivilegedRequest::UpdateInstallState { band, update } => {
                ops.update_install_state(band, update)?;
                None
            }
            PrivilegedRequest::RecordGlobalJsonPin { band, global_json, version } => {
                ops.record_global_json_pin(band, global_json, version)?;
                None
            }
            PrivilegedRequest::GetGlobalJsonPins { band } => {
                Some(serde_json::to_value(ops.global_json_pins(band)?)?)
            }
            PrivilegedRequest::WriteWorkloadRecord { workload, band } => {
                ops.write_workload_record(workload, band)?;
                None
            }
            PrivilegedRequest::DeleteWorkloadRecord { workload, band } => {
                ops.delete_workload_record(workload, band)?;
                None
            }
            PrivilegedRequest::Shutdown => {
                ops.shutdown()?;
                None
            }
        };
        Ok(payload)
    }

    /// Answers one request per line until `Shutdown` or end of input.
    pub fn serve(&self, input: impl BufRead, mut output: impl Write) -> Result<()> {
        for line in input.lines() {
            let line = line.context("failed to read request")?;
            if line.trim().is_empty() {
                continue;
            }
            let (response, stop) = match serde_json::from_str::<PrivilegedRequest>(&line) {
                Ok(request) => {
                    tracing::debug!(?request, "handling elevated request");
                    (self.handle(&request), request == PrivilegedRequest::Shutdown)
                }
                Err(err) => (
                    PrivilegedResponse {
                        result_code: RESULT_INSTALL_FAILURE,
                        message: Some(format!("malformed request: {err}")),
                        payload: None,
                    },
                    false,
                ),
            };
            serde_json::to_writer(&mut output, &response).context("failed to write response")?;
            output.write_all(b"\n").context("failed to write response")?;
            output.flush().context("failed to flush response")?;
            if stop {
                return Ok(());
            }
        }

        tracing::debug!("client disconnected without shutdown");
        self.ops.shutdown()
    }
}

pub trait Transport {
    fn round_trip(&mut self, request: &PrivilegedRequest) -> Result<PrivilegedResponse>;
}

/// Builds the command that starts the elevated server, prefixed by the
/// configured launcher (for example `sudo -n`).
pub fn elevated_server_command(launcher: &[String], program: &Path, args: &[OsString]) -> Command {
    let mut command = match launcher.split_first() {
        Some((first, rest)) => {
            let mut command = Command::new(first);
            command.args(rest).arg(program);
            command
        }
        None => Command::new(program),
    };
    command.args(args);
    command
}

/// Talks to an elevated server over a child process's stdin and stdout.
pub struct ChildProcessTransport {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl ChildProcessTransport {
    pub fn spawn(mut command: Command) -> Result<Self> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| WorkloadError::ElevatedServerUnavailable {
                message: format!("failed to start elevated server: {err}"),
            })?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("elevated server stdout was not captured"))?;
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }
}

impl Transport for ChildProcessTransport {
    fn round_trip(&mut self, request: &PrivilegedRequest) -> Result<PrivilegedResponse> {
        let unavailable = |message: String| WorkloadError::ElevatedServerUnavailable { message };
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| unavailable("connection already closed".to_string()))?;
        let mut line = serde_json::to_string(request).context("failed to encode request")?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .and_then(|()| stdin.flush())
            .map_err(|err| unavailable(err.to_string()))?;

        let mut reply = String::new();
        let read = self
            .stdout
            .read_line(&mut reply)
            .map_err(|err| unavailable(err.to_string()))?;
        if read == 0 {
            return Err(unavailable("server exited".to_string()).into());
        }
        serde_json::from_str(&reply).context("failed to decode elevated server response")
    }
}

impl Drop for ChildProcessTransport {
    fn drop(&mut self) {
        self.stdin.take();
        if let Err(err) = self.child.wait() {
            tracing::debug!(%err, "failed to wait for elevated server");
        }
    }
}

/// Forwards privileged operations to an elevated server. Failures come back
/// as the same [`WorkloadError`] variants local execution produces.
pub struct DispatchClient<T> {
    transport: RefCell<T>,
}

impl<T: Transport> DispatchClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport: RefCell::new(transport),
        }
    }

    fn send(&self, request: PrivilegedRequest) -> Result<Option<Value>> {
        let response = self.transport.borrow_mut().round_trip(&request)?;
        if response.result_code == RESULT_SUCCESS {
            return Ok(response.payload);
        }

        let message = response.message.unwrap_or_default();
        let err = match (&request, response.result_code) {
            (
                PrivilegedRequest::InstallPackage { package_path, .. }
                | PrivilegedRequest::RepairPackage { package_path, .. },
                RESULT_INSTALL_PACKAGE_INVALID,
            ) => WorkloadError::InvalidPackage {
                path: package_path.clone(),
            },
            (_, code) => WorkloadError::ElevatedRequestFailed { code, message },
        };
        Err(err.into())
    }

    fn send_for<R: DeserializeOwned>(&self, request: PrivilegedRequest) -> Result<R> {
        let payload = self
            .send(request)?
            .ok_or_else(|| anyhow!("elevated server returned no payload"))?;
        serde_json::from_value(payload).context("failed to decode elevated server payload")
    }
}

impl<T: Transport> PrivilegedOps for DispatchClient<T> {
    fn install_package(&self, package_path: &Path, log_path: &Path) -> Result<i32> {
        self.send_for(PrivilegedRequest::InstallPackage {
            package_path: package_path.to_path_buf(),
            log_path: log_path.to_path_buf(),
        })
    }

    fn repair_package(&self, package_path: &Path, log_path: &Path) -> Result<i32> {
        self.send_for(PrivilegedRequest::RepairPackage {
            package_path: package_path.to_path_buf(),
            log_path: log_path.to_path_buf(),
        })
    }

    fn uninstall_package(&self, product_code: &str, log_path: &Path) -> Result<i32> {
        self.send_for(PrivilegedRequest::UninstallPackage {
            product_code: product_code.to_string(),
            log_path: log_path.to_path_buf(),
        })
    }

    fn add_dependent(&self, provider_key: &str, dependent: &str) -> Result<()> {
        self.send(PrivilegedRequest::AddDependent {
            provider_key: provider_key.to_string(),
            dependent: dependent.to_string(),
        })
        .map(|_| ())
    }

    fn remove_dependent(&self, provider_key: &str, dependent: &str) -> Result<()> {
        self.send(PrivilegedRequest::RemoveDependent {
            provider_key: provider_key.to_string(),
            dependent: dependent.to_string(),
        })
        .map(|_| ())
    }

    fn cache_payload(&self, package_id: &str, version: &str, staged_dir: &Path) -> Result<CachedPayload> {
        self.send_for(PrivilegedRequest::CachePayload {
            package_id: package_id.to_string(),
            version: version.to_string(),
            staged_dir: staged_dir.to_path_buf(),
        })
    }

    fn remove_cached_payload(&self, package_id: &str, version: &str) -> Result<()> {
        self.send(PrivilegedRequest::RemoveCachedPayload {
            package_id: package_id.to_string(),
            version: version.to_string(),
        })
        .map(|_| ())
    }

    fn update_install_state(&self, band: &FeatureBand, update: &InstallStateUpdate) -> Result<()> {
        self.send(PrivilegedRequest::UpdateInstallState {
            band: band.clone(),
            update: update.clone(),
        })
        .map(|_| ())
    }

    fn record_global_json_pin(&self, band: &FeatureBand, global_json: &Path, version: &str) -> Result<()> {
        self.send(PrivilegedRequest::RecordGlobalJsonPin {
            band: band.clone(),
            global_json: global_json.to_path_buf(),
            version: version.to_string(),
        })
        .map(|_| ())
    }

    fn global_json_pins(&self, band: &FeatureBand) -> Result<BTreeMap<PathBuf, String>> {
        self.send_for(PrivilegedRequest::GetGlobalJsonPins { band: band.clone() })
    }

    fn write_workload_record(&self, workload: &WorkloadId, band: &FeatureBand) -> Result<()> {
        self.send(PrivilegedRequest::WriteWorkloadRecord {
            workload: workload.clone(),
            band: band.clone(),
        })
        .map(|_| ())
    }

    fn delete_workload_record(&self, workload: &WorkloadId, band: &FeatureBand) -> Result<()> {
        self.send(PrivilegedRequest::DeleteWorkloadRecord {
            workload: workload.clone(),
            band: band.clone(),
        })
        .map(|_| ())
    }

    fn shutdown(&self) -> Result<()> {
        self.send(PrivilegedRequest::Shutdown).map(|_| ())
    }
}
