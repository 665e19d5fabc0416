use serde::Serialize;

use crate::feed::Release;
use crate::store::InstalledVersion;
use crate::version::{self, SemanticVersion};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "version")]
pub enum UpdateAdvisory {
    NoVersionInstalled,
    UpdateAvailable(SemanticVersion),
    UpToDateStable(SemanticVersion),
    UpToDatePreRelease(SemanticVersion),
}

/// Compares the newest installed version against the newest stable release.
/// Pre-releases on the feed never trigger an update notice.
pub fn advise(installed: &[InstalledVersion], releases: &[Release]) -> UpdateAdvisory {
    let Some(latest_installed) = version::latest(installed.iter().map(|i| &i.version)) else {
        return UpdateAdvisory::NoVersionInstalled;
    };
    if let Some(latest_stable) = version::latest_stable(releases.iter().map(|r| &r.version)) {
        if latest_stable > latest_installed {
            return UpdateAdvisory::UpdateAvailable(latest_stable);
        }
    }
    if latest_installed.is_pre_release() {
        UpdateAdvisory::UpToDatePreRelease(latest_installed)
    } else {
        UpdateAdvisory::UpToDateStable(latest_installed)
    }
}

impl UpdateAdvisory {
    pub fn version(&self) -> Option<&SemanticVersion> {
        match self {
            UpdateAdvisory::NoVersionInstalled => None,
            UpdateAdvisory::UpdateAvailable(v)
            | UpdateAdvisory::UpToDateStable(v)
            | UpdateAdvisory::UpToDatePreRelease(v) => Some(v),
        }
    }

    pub fn message(&self) -> String {
        match self {
            UpdateAdvisory::NoVersionInstalled => "No version is installed.".to_string(),
            UpdateAdvisory::UpdateAvailable(v) => {
                format!("A more recent stable version {v} is available.")
            }
            UpdateAdvisory::UpToDateStable(v) => format!("You are using stable version {v}."),
            UpdateAdvisory::UpToDatePreRelease(v) => format!("You are using pre-release {v}."),
        }
    }

    pub fn notes_url(&self, notes_base_url: &str) -> Option<String> {
        self.version()
            .map(|v| format!("{}/{}", notes_base_url.trim_end_matches('/'), v))
    }
}
