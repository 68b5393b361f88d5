mod component_records;
mod fetch;
mod file_based;
mod fs_utils;
mod gc;
mod history;
mod install_state;
mod installer;
mod ipc;
mod layout;
mod operations;
mod os_package;
mod package_cache;
mod package_db;
mod privileged;
mod process;
mod report;
mod sdk;
mod transaction;
mod workload_records;

pub use component_records::{
    delete_manifest_record, delete_pack_record, delete_workload_set_record, manifest_record_exists,
    pack_record_bands, pack_record_exists, read_manifest_records, read_pack_record,
    read_pack_records, read_workload_set_records, workload_set_record_exists,
    write_manifest_record, write_pack_record, write_workload_set_record, ManifestRecords,
    PackRecords, WorkloadSetRecords,
};
pub use fetch::{acquire_package, extract_zip, with_transient_retry, AcquiredPackage, LocalFeedFetcher};
pub use file_based::FileBasedInstaller;
pub use fs_utils::{move_path, move_path_with_policy, RetryPolicy};
pub use gc::{
    collect_garbage, compute_keep_set, judge_reference, DropReason, GcReport, KeepSet,
    ReferenceLedger, Verdict,
};
pub use history::{read_history_records, write_history_record, WorkloadHistoryRecord};
pub use install_state::{
    global_json_pins, read_global_json_workload_version, read_install_state,
    record_global_json_pin, update_install_state, write_install_state, InstallState,
    InstallStateUpdate,
};
pub use installer::{
    select_installer_kind, HostOs, Installer, InstallerKind, WorkloadDownload, EXIT_SUCCESS,
    EXIT_SUCCESS_REBOOT_REQUIRED,
};
pub use ipc::{
    elevated_server_command, ChildProcessTransport, DispatchClient, ElevatedServer,
    PrivilegedRequest, PrivilegedResponse, Transport, RESULT_INSTALL_FAILURE,
    RESULT_INSTALL_PACKAGE_INVALID, RESULT_SUCCESS,
};
pub use layout::{default_dotnet_root, default_user_profile_dir, WorkloadLayout};
pub use operations::{
    collect_workload_garbage, find_global_json, install_workloads, installed_workloads,
    pin_global_json_workload_set, repair_workloads, uninstall_workloads, update_workloads,
    workload_downloads, UpdateRequest, WorkloadContext,
};
pub use os_package::{
    classify_exit_code, compare_product_versions, component_for_package, dependent_token,
    parse_dependent_token, plan_package, DetectState, ExitOutcome, OsPackageInstaller,
    PackageAction, PlannedAction, PrivilegedRecordStore, DEFAULT_DEPENDENT_PREFIX,
    EXIT_SUCCESS_REBOOT_INITIATED,
};
pub use package_cache::{CachedPayload, PackageCache, PayloadManifest, PAYLOAD_MANIFEST_FILE};
pub use package_db::{parse_reg_query, PackageDatabase, RegKey, WindowsInstallerDatabase};
pub use privileged::{
    default_update_agent, is_elevated, LocalPrivilegedOps, NoopUpdateAgent, PrivilegedOps,
    UpdateAgent, WindowsUpdateAgent,
};
pub use report::{ActivityGuard, BufferedReport, ReportLevel, ReportSink, Reporter};
pub use sdk::{installed_feature_bands, installed_sdk_versions};
pub use transaction::{Transaction, TransactionStatus};
pub use workload_records::{FileWorkloadRecordStore, WorkloadRecordStore};
