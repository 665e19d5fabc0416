use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::supervisor::SupervisorState;

pub type Result<T, E = LauncherError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("invalid version '{input}': {reason}")]
    InvalidVersion { input: String, reason: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("failed to create directory {}: {source}", path.display())]
    DirectoryCreate { path: PathBuf, source: io::Error },
    #[error("{}: {}: {source}", if *partial { "partially removed directory" } else { "failed to remove directory" }, path.display())]
    DirectoryRemove {
        path: PathBuf,
        partial: bool,
        source: io::Error,
    },
    #[error("launch failed: {0}")]
    Launch(#[from] LaunchError),
    #[error("install of {version} failed: {source}")]
    Install {
        version: String,
        source: Box<LauncherError>,
    },
    #[error("an install of {0} is already in progress")]
    InstallInProgress(String),
    #[error("the runtime is still launching; try stopping again once it is running")]
    NotYetRunning,
    #[error("could not terminate process {pid}: {reason}")]
    ForcedTerminationFailed { pid: u32, reason: String },
    #[error("You must be connected to the internet to fetch a version of the program. Please connect and restart the program.")]
    Offline,
    #[error("{0}")]
    Refused(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("runtime artifact not found at {}", .0.display())]
    ExecutableMissing(PathBuf),
    #[error("required runtime '{0}' is not available")]
    PrerequisiteMissing(String),
    #[error("failed to spawn {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("runtime exited right after start ({0})")]
    ExitedEarly(String),
    #[error("process {pid} from a previous run is still holding the runtime; kill it first")]
    LockedByOther { pid: u32 },
    #[error("cannot launch while the supervisor is {0}")]
    InvalidState(SupervisorState),
}

impl From<reqwest::Error> for LauncherError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return LauncherError::Network(format!("request timed out: {err}"));
        }
        LauncherError::Network(err.to_string())
    }
}

impl LauncherError {
    pub fn install(version: impl ToString, source: LauncherError) -> Self {
        LauncherError::Install {
            version: version.to_string(),
            source: Box::new(source),
        }
    }

    /// Fatal errors end the control loop instead of being reported and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LauncherError::Offline | LauncherError::ForcedTerminationFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_remove_message_reports_partial_state() {
        let err = LauncherError::DirectoryRemove {
            path: PathBuf::from("/tmp/firmata/1.0.0"),
            partial: true,
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().starts_with("partially removed directory"));
    }

    #[test]
    fn install_error_wraps_cause() {
        let err = LauncherError::install("1.2.0", LauncherError::Network("HTTP 404".to_string()));
        let text = err.to_string();
        assert!(text.contains("1.2.0"));
        assert!(text.contains("HTTP 404"));
    }

    #[test]
    fn only_offline_and_failed_kill_are_fatal() {
        assert!(LauncherError::Offline.is_fatal());
        assert!(LauncherError::ForcedTerminationFailed {
            pid: 1,
            reason: "EPERM".to_string()
        }
        .is_fatal());
        assert!(!LauncherError::NotYetRunning.is_fatal());
    }
}
