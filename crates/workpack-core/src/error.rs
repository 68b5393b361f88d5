use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Locked file or network hiccup. Retried with backoff where it happens.
    Transient,
    /// Something the user can fix: a missing package, an unknown version.
    UserRecoverable,
    /// Would break another feature band if forced. Never retried.
    Integrity,
    /// The native installer reported a failure code.
    Installer,
    /// The elevated server could not be reached or refused a request.
    Elevation,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkloadError {
    #[error("{operation} failed temporarily: {message}")]
    Transient { operation: String, message: String },

    #[error("package {package_id} version {version} was not found in offline cache {}", .cache.display())]
    CacheMissingPackage {
        package_id: String,
        version: String,
        cache: PathBuf,
    },

    #[error("package {package_id} version {version} was not found")]
    PackageNotFound { package_id: String, version: String },

    #[error("workload version {version} is not recognized")]
    VersionNotRecognized { version: String },

    #[error("workload '{workload}' is not recognized")]
    WorkloadNotRecognized { workload: String },

    #[error("cannot install {component} {requested}: version {installed} is already installed and downgrades are not supported")]
    Downgrade {
        component: String,
        installed: String,
        requested: String,
    },

    #[error("cannot install {component} {requested}: version {installed} is installed and side-by-side installs of this component are required")]
    VersionSkew {
        component: String,
        installed: String,
        requested: String,
    },

    #[error("failed to detect the install state of {component}: {message}")]
    DetectionFailed { component: String, message: String },

    #[error("{operation} failed with installer exit code {code}")]
    InstallerFailed { operation: String, code: i32 },

    #[error("package {} is not located in the package cache", .path.display())]
    InvalidPackage { path: PathBuf },

    #[error("elevated server is unavailable: {message}")]
    ElevatedServerUnavailable { message: String },

    #[error("elevated request failed with result code {code}: {message}")]
    ElevatedRequestFailed { code: i32, message: String },
}

impl WorkloadError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transient { .. } => ErrorCategory::Transient,
            Self::CacheMissingPackage { .. }
            | Self::PackageNotFound { .. }
            | Self::VersionNotRecognized { .. }
            | Self::WorkloadNotRecognized { .. } => ErrorCategory::UserRecoverable,
            Self::Downgrade { .. } | Self::VersionSkew { .. } | Self::DetectionFailed { .. } => {
                ErrorCategory::Integrity
            }
            Self::InstallerFailed { .. } | Self::InvalidPackage { .. } => ErrorCategory::Installer,
            Self::ElevatedServerUnavailable { .. } | Self::ElevatedRequestFailed { .. } => {
                ErrorCategory::Elevation
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Finds a classified error anywhere in an error chain.
    pub fn find(err: &anyhow::Error) -> Option<&WorkloadError> {
        err.chain().find_map(|cause| cause.downcast_ref::<WorkloadError>())
    }
}
