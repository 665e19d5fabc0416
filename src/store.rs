use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{LauncherError, Result};
use crate::version::SemanticVersion;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledVersion {
    pub version: SemanticVersion,
    pub path: PathBuf,
}

/// The install root is the only record of what is installed: one directory per
/// version, named by its canonical semver string.
#[derive(Debug, Clone)]
pub struct InstallStore {
    root: PathBuf,
    artifact_name: String,
}

impl InstallStore {
    pub fn new(root: impl Into<PathBuf>, artifact_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            artifact_name: artifact_name.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_name(&self) -> &str {
        &self.artifact_name
    }

    pub fn version_dir(&self, version: &SemanticVersion) -> PathBuf {
        self.root.join(version.to_string())
    }

    pub fn artifact_path(&self, version: &SemanticVersion) -> PathBuf {
        self.version_dir(version).join(&self.artifact_name)
    }

    pub fn list_installed(&self) -> Result<Vec<InstalledVersion>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(LauncherError::Io(err)),
        };
        let mut installed = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            match SemanticVersion::parse(&name) {
                Ok(version) => installed.push(InstalledVersion {
                    version,
                    path: entry.path(),
                }),
                Err(_) => debug!(entry = %name, "ignoring non-version directory"),
            }
        }
        installed.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(installed)
    }

    pub fn find(&self, version: &SemanticVersion) -> Result<Option<InstalledVersion>> {
        Ok(self
            .list_installed()?
            .into_iter()
            .find(|installed| &installed.version == version))
    }

    pub fn create_install_dir(&self, version: &SemanticVersion) -> Result<PathBuf> {
        fs::create_dir_all(&self.root).map_err(|source| LauncherError::DirectoryCreate {
            path: self.root.clone(),
            source,
        })?;
        let dir = self.version_dir(version);
        fs::create_dir(&dir).map_err(|source| LauncherError::DirectoryCreate {
            path: dir.clone(),
            source,
        })?;
        info!(version = %version, path = %dir.display(), "created install directory");
        Ok(dir)
    }

    pub fn remove_version(&self, version: &SemanticVersion) -> Result<()> {
        let dir = self.version_dir(version);
        remove_tree(&dir)?;
        info!(version = %version, "removed installed version");
        Ok(())
    }

    /// Removes every version directory but keeps the rest of the install root
    /// (managed runtime, logs, lock file).
    pub fn remove_all_versions(&self) -> Result<Vec<SemanticVersion>> {
        let mut removed = Vec::new();
        for installed in self.list_installed()? {
            remove_tree(&installed.path)?;
            removed.push(installed.version);
        }
        info!(count = removed.len(), "removed all installed versions");
        Ok(removed)
    }

    pub fn remove_all(&self) -> Result<()> {
        remove_tree(&self.root)?;
        info!(root = %self.root.display(), "removed install root");
        Ok(())
    }
}

pub(crate) fn remove_tree(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => {
            let partial = path.exists();
            warn!(path = %path.display(), partial, error = %source, "directory removal failed");
            Err(LauncherError::DirectoryRemove {
                path: path.to_path_buf(),
                partial,
                source,
            })
        }
    }
}
