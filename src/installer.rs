use serde::Serialize;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

use crate::error::{LauncherError, Result};
use crate::feed::ReleaseFeed;
use crate::store::{InstallStore, InstalledVersion};
use crate::version::SemanticVersion;

const PROGRESS_STEP_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallPhase {
    Idle,
    CreatingDirectory,
    Downloading,
    Done,
    Failed,
}

impl fmt::Display for InstallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            InstallPhase::Idle => "idle",
            InstallPhase::CreatingDirectory => "creating directory",
            InstallPhase::Downloading => "downloading",
            InstallPhase::Done => "done",
            InstallPhase::Failed => "failed",
        };
        f.write_str(text)
    }
}

#[derive(Debug)]
pub enum InstallEvent {
    Phase {
        version: SemanticVersion,
        phase: InstallPhase,
    },
    Progress {
        version: SemanticVersion,
        bytes: u64,
    },
    Finished {
        version: SemanticVersion,
        result: Result<InstalledVersion>,
    },
}

impl InstallEvent {
    pub fn status_text(&self) -> Option<String> {
        match self {
            InstallEvent::Phase { version, phase } => Some(match phase {
                InstallPhase::Idle => return None,
                InstallPhase::CreatingDirectory => format!("Preparing install of {version}..."),
                InstallPhase::Downloading => format!("Downloading {version}..."),
                InstallPhase::Done => format!("Installed {version}."),
                InstallPhase::Failed => format!("Install of {version} failed."),
            }),
            InstallEvent::Progress { version, bytes } => Some(format!(
                "Downloading {version}: {:.1} MiB",
                *bytes as f64 / (1024.0 * 1024.0)
            )),
            InstallEvent::Finished { .. } => None,
        }
    }
}

/// Downloads one release artifact into a fresh install directory.
#[derive(Clone)]
pub struct DownloadInstaller {
    store: InstallStore,
    feed: Arc<dyn ReleaseFeed>,
}

impl DownloadInstaller {
    pub fn new(store: InstallStore, feed: Arc<dyn ReleaseFeed>) -> Self {
        Self { store, feed }
    }

    /// Runs the whole sequence on the calling thread. A leftover directory from an
    /// earlier failed attempt is removed first; a failed transfer leaves the new
    /// directory behind without the artifact.
    pub fn install(
        &self,
        version: &SemanticVersion,
        url: &str,
        sink: &mut dyn FnMut(InstallEvent),
    ) -> Result<InstalledVersion> {
        let result = self.run(version, url, sink);
        let phase = match &result {
            Ok(installed) => {
                info!(version = %version, path = %installed.path.display(), "install complete");
                InstallPhase::Done
            }
            Err(err) => {
                error!(version = %version, error = %err, "install failed");
                InstallPhase::Failed
            }
        };
        sink(InstallEvent::Phase {
            version: version.clone(),
            phase,
        });
        result.map_err(|err| LauncherError::install(version, err))
    }

    /// Same as [`install`](Self::install) on a worker thread; the outcome arrives as
    /// [`InstallEvent::Finished`].
    pub fn spawn<F>(&self, version: SemanticVersion, url: String, mut sink: F) -> JoinHandle<()>
    where
        F: FnMut(InstallEvent) + Send + 'static,
    {
        let installer = self.clone();
        thread::spawn(move || {
            let result = installer.install(&version, &url, &mut sink);
            sink(InstallEvent::Finished { version, result });
        })
    }

    fn run(
        &self,
        version: &SemanticVersion,
        url: &str,
        sink: &mut dyn FnMut(InstallEvent),
    ) -> Result<InstalledVersion> {
        sink(InstallEvent::Phase {
            version: version.clone(),
            phase: InstallPhase::CreatingDirectory,
        });
        let existing = self.store.version_dir(version);
        if existing.exists() {
            warn!(version = %version, path = %existing.display(), "removing leftover install directory");
            self.store.remove_version(version)?;
        }
        let dir = self.store.create_install_dir(version)?;

        sink(InstallEvent::Phase {
            version: version.clone(),
            phase: InstallPhase::Downloading,
        });
        let artifact = self.store.artifact_path(version);
        let partial = dir.join(format!("{}.part", self.store.artifact_name()));
        let bytes = match self.transfer(version, url, &partial, sink) {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = fs::remove_file(&partial);
                return Err(err);
            }
        };
        fs::rename(&partial, &artifact)?;
        info!(version = %version, bytes, "artifact stored");
        Ok(InstalledVersion {
            version: version.clone(),
            path: dir,
        })
    }

    fn transfer(
        &self,
        version: &SemanticVersion,
        url: &str,
        partial: &Path,
        sink: &mut dyn FnMut(InstallEvent),
    ) -> Result<u64> {
        let mut writer = BufWriter::new(File::create(partial)?);
        let mut next_report = PROGRESS_STEP_BYTES;
        let bytes = self.feed.download(url, &mut writer, &mut |bytes| {
            if bytes >= next_report {
                next_report = bytes + PROGRESS_STEP_BYTES;
                sink(InstallEvent::Progress {
                    version: version.clone(),
                    bytes,
                });
            }
        })?;
        writer.flush()?;
        if bytes == 0 {
            return Err(LauncherError::Network(format!("empty download from {url}")));
        }
        Ok(bytes)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::feed::{artifact_url, Release};
    use std::collections::BTreeMap;
    use std::sync::{mpsc, Mutex};
    use tempfile::tempdir;

    /// In-memory feed: releases are served as given, artifacts by URL.
    #[derive(Default)]
    pub(crate) struct StaticFeed {
        pub releases: Vec<Release>,
        pub artifacts: BTreeMap<String, Vec<u8>>,
        pub reachable: bool,
        /// Served instead of the release list while the feed stays reachable.
        pub fetch_error: Option<String>,
        pub downloads: Mutex<Vec<String>>,
    }

    impl StaticFeed {
        pub(crate) fn with_versions(versions: &[&str]) -> Self {
            let mut feed = StaticFeed {
                reachable: true,
                ..StaticFeed::default()
            };
            for text in versions {
                let version = SemanticVersion::parse(text).unwrap();
                let url = artifact_url("https://feed.test", &version, "app.jar");
                feed.artifacts.insert(url.clone(), format!("jar {text}").into_bytes());
                feed.releases.push(Release {
                    is_pre_release: version.is_pre_release(),
                    download_url: url,
                    version,
                });
            }
            feed
        }
    }

    impl ReleaseFeed for StaticFeed {
        fn fetch_releases(&self) -> Result<Vec<Release>> {
            if !self.reachable {
                return Err(LauncherError::Network("unreachable".to_string()));
            }
            if let Some(message) = &self.fetch_error {
                return Err(LauncherError::Network(message.clone()));
            }
            Ok(self.releases.clone())
        }

        fn is_reachable(&self) -> bool {
            self.reachable
        }

        fn download_url(&self, version: &SemanticVersion) -> String {
            artifact_url("https://feed.test", version, "app.jar")
        }

        fn download(
            &self,
            url: &str,
            dest: &mut dyn Write,
            progress: &mut dyn FnMut(u64),
        ) -> Result<u64> {
            self.downloads.lock().unwrap().push(url.to_string());
            let Some(bytes) = self.artifacts.get(url) else {
                return Err(LauncherError::Network(format!(
                    "download failed: {url} (HTTP 404 Not Found)"
                )));
            };
            dest.write_all(bytes)?;
            progress(bytes.len() as u64);
            Ok(bytes.len() as u64)
        }
    }

    fn v(text: &str) -> SemanticVersion {
        SemanticVersion::parse(text).unwrap()
    }

    fn phases(events: &[InstallEvent]) -> Vec<InstallPhase> {
        events
            .iter()
            .filter_map(|event| match event {
                InstallEvent::Phase { phase, .. } => Some(*phase),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn install_stores_artifact_and_reports_ordered_phases() {
        let dir = tempdir().unwrap();
        let store = InstallStore::new(dir.path(), "app.jar");
        let feed = Arc::new(StaticFeed::with_versions(&["1.0.0"]));
        let installer = DownloadInstaller::new(store.clone(), feed.clone());
        let url = feed.download_url(&v("1.0.0"));

        let mut events = Vec::new();
        let installed = installer
            .install(&v("1.0.0"), &url, &mut |event| events.push(event))
            .unwrap();

        assert_eq!(installed.version, v("1.0.0"));
        assert_eq!(
            fs::read(store.artifact_path(&v("1.0.0"))).unwrap(),
            b"jar 1.0.0"
        );
        assert_eq!(
            phases(&events),
            vec![
                InstallPhase::CreatingDirectory,
                InstallPhase::Downloading,
                InstallPhase::Done
            ]
        );
        assert_eq!(store.list_installed().unwrap().len(), 1);
    }

    #[test]
    fn failed_transfer_leaves_directory_without_artifact() {
        let dir = tempdir().unwrap();
        let store = InstallStore::new(dir.path(), "app.jar");
        let feed = Arc::new(StaticFeed::with_versions(&[]));
        let installer = DownloadInstaller::new(store.clone(), feed);

        let mut events = Vec::new();
        let err = installer
            .install(&v("9.9.9"), "https://feed.test/9.9.9/app.jar", &mut |event| {
                events.push(event)
            })
            .unwrap_err();

        assert!(err.to_string().contains("HTTP 404"));
        assert_eq!(phases(&events).last(), Some(&InstallPhase::Failed));
        assert!(store.version_dir(&v("9.9.9")).is_dir());
        assert!(!store.artifact_path(&v("9.9.9")).exists());
        let listed: Vec<_> = store
            .list_installed()
            .unwrap()
            .into_iter()
            .map(|i| i.version)
            .collect();
        assert_eq!(listed, vec![v("9.9.9")]);
    }

    #[test]
    fn leftover_directory_is_cleaned_before_retry() {
        let dir = tempdir().unwrap();
        let store = InstallStore::new(dir.path(), "app.jar");
        let leftover = store.create_install_dir(&v("1.0.0")).unwrap();
        fs::write(leftover.join("app.jar.part"), b"half").unwrap();
        fs::write(leftover.join("stale.txt"), b"old").unwrap();

        let feed = Arc::new(StaticFeed::with_versions(&["1.0.0"]));
        let installer = DownloadInstaller::new(store.clone(), feed.clone());
        installer
            .install(&v("1.0.0"), &feed.download_url(&v("1.0.0")), &mut |_| {})
            .unwrap();

        assert!(!leftover.join("stale.txt").exists());
        assert!(!leftover.join("app.jar.part").exists());
        assert!(store.artifact_path(&v("1.0.0")).exists());
    }

    #[test]
    fn spawned_install_reports_finished_event() {
        let dir = tempdir().unwrap();
        let store = InstallStore::new(dir.path(), "app.jar");
        let feed = Arc::new(StaticFeed::with_versions(&["2.0.0"]));
        let installer = DownloadInstaller::new(store, feed.clone());
        let (tx, rx) = mpsc::channel();

        let handle = installer.spawn(v("2.0.0"), feed.download_url(&v("2.0.0")), move |event| {
            let _ = tx.send(event);
        });
        handle.join().unwrap();

        let events: Vec<InstallEvent> = rx.try_iter().collect();
        match events.last() {
            Some(InstallEvent::Finished { version, result }) => {
                assert_eq!(version, &v("2.0.0"));
                assert!(result.is_ok());
            }
            other => panic!("expected Finished, got {other:?}"),
        }
    }

    #[test]
    fn status_text_describes_progress() {
        let event = InstallEvent::Progress {
            version: v("1.0.0"),
            bytes: 3 * 1024 * 1024,
        };
        assert_eq!(event.status_text().unwrap(), "Downloading 1.0.0: 3.0 MiB");
    }
}
