use std::path::PathBuf;
use thiserror::Error;

pub const EXIT_USAGE: u8 = 2;
pub const EXIT_PERMISSION_DENIED: u8 = 3;
pub const EXIT_INSUFFICIENT_SPACE: u8 = 4;
pub const EXIT_INSTALL_FAILED: u8 = 5;
pub const EXIT_USER_CANCELLED: u8 = 6;
pub const EXIT_ALREADY_RUNNING: u8 = 7;
pub const EXIT_DOWNGRADE: u8 = 8;

/// Pre-flight failures. Nothing on the machine has been touched when one of
/// these is returned.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("no write access to {path}: {source}")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("not enough free space on {path}: {required} bytes required, {available} available")]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },
    #[error("another setup run for {app_id} is in progress")]
    AlreadyRunning { app_id: String },
    #[error("installed version {installed} is newer than {incoming}")]
    Downgrade { installed: String, incoming: String },
    #[error("invalid package: {0}")]
    Package(String),
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("install failed while copying {path}: {cause:#}")]
    Copy { path: PathBuf, cause: anyhow::Error },
    #[error("install failed while writing registry key {key}: {cause:#}")]
    Registration { key: String, cause: anyhow::Error },
    #[error("install failed while saving uninstall record {path}: {cause:#}")]
    Commit { path: PathBuf, cause: anyhow::Error },
    #[error("uninstall record {path} is unreadable: {cause:#}")]
    Record { path: PathBuf, cause: anyhow::Error },
    #[error("setup was cancelled")]
    Cancelled,
}

impl InstallError {
    pub fn package(message: impl Into<String>) -> Self {
        InstallError::Validation(ValidationError::Package(message.into()))
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            InstallError::Validation(err) => match err {
                ValidationError::PermissionDenied { .. } => EXIT_PERMISSION_DENIED,
                ValidationError::InsufficientSpace { .. } => EXIT_INSUFFICIENT_SPACE,
                ValidationError::AlreadyRunning { .. } => EXIT_ALREADY_RUNNING,
                ValidationError::Downgrade { .. } => EXIT_DOWNGRADE,
                ValidationError::Package(_) => EXIT_USAGE,
            },
            InstallError::Copy { .. }
            | InstallError::Registration { .. }
            | InstallError::Commit { .. }
            | InstallError::Record { .. } => EXIT_INSTALL_FAILED,
            InstallError::Cancelled => EXIT_USER_CANCELLED,
        }
    }

    /// Message key of the catalog entry describing the failure.
    pub fn message_key(&self) -> &'static str {
        match self {
            InstallError::Validation(err) => match err {
                ValidationError::PermissionDenied { .. } => "ErrorPermissionDenied",
                ValidationError::InsufficientSpace { .. } => "ErrorInsufficientSpace",
                ValidationError::AlreadyRunning { .. } => "ErrorAlreadyRunning",
                ValidationError::Downgrade { .. } => "ErrorDowngrade",
                ValidationError::Package(_) => "ErrorInvalidPackage",
            },
            InstallError::Copy { .. }
            | InstallError::Registration { .. }
            | InstallError::Commit { .. } => "ErrorInstallFailed",
            InstallError::Record { .. } => "ErrorRecordUnreadable",
            InstallError::Cancelled => "UserCancelled",
        }
    }

    /// Message key of the catalog entry telling the user what to do next.
    pub fn remedy_key(&self) -> &'static str {
        match self {
            InstallError::Validation(err) => match err {
                ValidationError::PermissionDenied { .. } => "RemedyPermission",
                ValidationError::InsufficientSpace { .. } => "RemedyFreeSpace",
                ValidationError::AlreadyRunning { .. } => "RemedyWaitOtherSetup",
                ValidationError::Downgrade { .. } => "RemedyDowngrade",
                ValidationError::Package(_) => "RemedyRedownload",
            },
            InstallError::Copy { cause, .. } | InstallError::Commit { cause, .. } => {
                if is_locked(cause) {
                    "RemedyCloseApp"
                } else {
                    "RemedyRetry"
                }
            }
            InstallError::Registration { .. } => "RemedyPermission",
            InstallError::Record { .. } => "RemedyManualCleanup",
            InstallError::Cancelled => "RemedyRerun",
        }
    }

    /// Path or registry key the failure is about, if any.
    pub fn subject(&self) -> Option<String> {
        match self {
            InstallError::Validation(ValidationError::PermissionDenied { path, .. })
            | InstallError::Validation(ValidationError::InsufficientSpace { path, .. })
            | InstallError::Copy { path, .. }
            | InstallError::Commit { path, .. }
            | InstallError::Record { path, .. } => Some(path.display().to_string()),
            InstallError::Registration { key, .. } => Some(key.clone()),
            _ => None,
        }
    }
}

/// Errors raised while turning a manifest into a package. They surface at
/// build time, never on an end user's machine.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("resource not found: {0}")]
    ResourceNotFound(PathBuf),
    #[error("duplicate destination {0}")]
    DuplicateDestination(String),
    #[error("duplicate program id {0}")]
    DuplicateProgramId(String),
    #[error("{field}: {reason}")]
    Invalid { field: String, reason: String },
    #[error("read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ManifestError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ManifestError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// True when the error chain points at a file held open by another process.
pub fn is_locked(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .any(|io| {
            // 32 = ERROR_SHARING_VIOLATION, 33 = ERROR_LOCK_VIOLATION
            io.kind() == std::io::ErrorKind::PermissionDenied
                || (cfg!(windows) && matches!(io.raw_os_error(), Some(32) | Some(33)))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn exit_codes_are_distinct_per_failure_class() {
        let codes = [
            InstallError::Validation(ValidationError::PermissionDenied {
                path: PathBuf::from("x"),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            })
            .exit_code(),
            InstallError::Validation(ValidationError::InsufficientSpace {
                path: PathBuf::from("x"),
                required: 2,
                available: 1,
            })
            .exit_code(),
            InstallError::Copy {
                path: PathBuf::from("x"),
                cause: anyhow::anyhow!("boom"),
            }
            .exit_code(),
            InstallError::Cancelled.exit_code(),
        ];
        assert_eq!(codes, [3, 4, 5, 6]);
    }

    #[test]
    fn locked_file_suggests_closing_the_app() {
        let cause = Err::<(), _>(std::io::Error::from(std::io::ErrorKind::PermissionDenied))
            .context("remove app.bin")
            .unwrap_err();
        let err = InstallError::Copy {
            path: PathBuf::from("app.bin"),
            cause,
        };
        assert_eq!(err.remedy_key(), "RemedyCloseApp");
        assert_eq!(err.message_key(), "ErrorInstallFailed");
        assert_eq!(err.subject().as_deref(), Some("app.bin"));
    }
}
