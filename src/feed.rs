use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{LauncherError, Result};
use crate::version::SemanticVersion;

const USER_AGENT: &str = concat!("firmata-launcher/", env!("CARGO_PKG_VERSION"));
const COPY_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Release {
    pub version: SemanticVersion,
    pub is_pre_release: bool,
    pub download_url: String,
}

/// Source of published releases and their artifacts.
pub trait ReleaseFeed: Send + Sync {
    /// One round trip; entries come back in the order the remote sent them.
    fn fetch_releases(&self) -> Result<Vec<Release>>;

    fn is_reachable(&self) -> bool;

    fn download_url(&self, version: &SemanticVersion) -> String;

    /// Streams `url` into `dest`, calling `progress` with the running byte count.
    fn download(
        &self,
        url: &str,
        dest: &mut dyn Write,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64>;
}

#[derive(Debug, Deserialize)]
struct GitHubReleasePayload {
    tag_name: String,
    #[serde(default)]
    draft: bool,
}

pub struct HttpReleaseFeed {
    feed_url: String,
    download_base_url: String,
    artifact_name: String,
    probe_url: String,
    fetch_client: Client,
    download_client: Client,
    probe_client: Client,
}

impl HttpReleaseFeed {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        Ok(Self {
            feed_url: cfg.release.feed_url.clone(),
            download_base_url: cfg.release.download_base_url.trim_end_matches('/').to_string(),
            artifact_name: cfg.release.artifact_name.clone(),
            probe_url: cfg.network.probe_url.clone(),
            fetch_client: build_client(Duration::from_secs(cfg.release.fetch_timeout_sec))?,
            download_client: build_client(Duration::from_secs(cfg.release.download_timeout_sec))?,
            probe_client: build_client(Duration::from_secs(cfg.network.probe_timeout_sec))?,
        })
    }
}

fn build_client(timeout: Duration) -> Result<Client> {
    Ok(Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()?)
}

impl ReleaseFeed for HttpReleaseFeed {
    fn fetch_releases(&self) -> Result<Vec<Release>> {
        let response = self
            .fetch_client
            .get(&self.feed_url)
            .header("Accept", "application/vnd.github+json")
            .send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(LauncherError::Network(format!(
                "failed to fetch releases: HTTP {} {}",
                status,
                body.trim()
            )));
        }
        let payload: Vec<GitHubReleasePayload> = response.json()?;
        let releases = releases_from_payload(payload, &self.download_base_url, &self.artifact_name);
        info!(count = releases.len(), "fetched releases");
        Ok(releases)
    }

    fn is_reachable(&self) -> bool {
        match self.probe_client.head(&self.probe_url).send() {
            Ok(_) => true,
            Err(err) => {
                warn!(url = %self.probe_url, error = %err, "network probe failed");
                false
            }
        }
    }

    fn download_url(&self, version: &SemanticVersion) -> String {
        artifact_url(&self.download_base_url, version, &self.artifact_name)
    }

    fn download(
        &self,
        url: &str,
        dest: &mut dyn Write,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64> {
        debug!(url, "starting download");
        let mut response = self.download_client.get(url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(LauncherError::Network(format!(
                "download failed: {url} (HTTP {status})"
            )));
        }
        copy_with_progress(&mut response, dest, progress)
    }
}

pub fn artifact_url(base_url: &str, version: &SemanticVersion, artifact_name: &str) -> String {
    format!(
        "{}/{}/{}",
        base_url.trim_end_matches('/'),
        version,
        artifact_name
    )
}

fn normalize_tag(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed.strip_prefix('v').unwrap_or(trimmed)
}

fn releases_from_payload(
    payload: Vec<GitHubReleasePayload>,
    base_url: &str,
    artifact_name: &str,
) -> Vec<Release> {
    let mut releases = Vec::new();
    for entry in payload {
        if entry.draft {
            continue;
        }
        let version = match SemanticVersion::parse(normalize_tag(&entry.tag_name)) {
            Ok(version) => version,
            Err(err) => {
                warn!(tag = %entry.tag_name, error = %err, "skipping release with unparseable tag");
                continue;
            }
        };
        releases.push(Release {
            is_pre_release: version.is_pre_release(),
            download_url: artifact_url(base_url, &version, artifact_name),
            version,
        });
    }
    releases
}

pub(crate) fn copy_with_progress(
    source: &mut dyn Read,
    dest: &mut dyn Write,
    progress: &mut dyn FnMut(u64),
) -> Result<u64> {
    let mut buffer = vec![0u8; COPY_CHUNK_BYTES];
    let mut total: u64 = 0;
    loop {
        let read = source
            .read(&mut buffer)
            .map_err(|err| LauncherError::Network(format!("transfer interrupted: {err}")))?;
        if read == 0 {
            break;
        }
        dest.write_all(&buffer[..read])?;
        total += read as u64;
        progress(total);
    }
    dest.flush()?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn payload(json: &str) -> Vec<GitHubReleasePayload> {
        serde_json::from_str(json).expect("payload")
    }

    #[test]
    fn maps_tags_to_releases_in_received_order() {
        let releases = releases_from_payload(
            payload(
                r#"[
                    {"tag_name": "1.0.0", "draft": false, "prerelease": false},
                    {"tag_name": "1.1.0-rc1", "draft": false, "prerelease": true},
                    {"tag_name": "v0.9.0"}
                ]"#,
            ),
            "https://example.test/download",
            "owlcms-firmata.jar",
        );
        let versions: Vec<String> = releases.iter().map(|r| r.version.to_string()).collect();
        assert_eq!(versions, vec!["1.0.0", "1.1.0-rc1", "0.9.0"]);
        assert!(!releases[0].is_pre_release);
        assert!(releases[1].is_pre_release);
        assert_eq!(
            releases[1].download_url,
            "https://example.test/download/1.1.0-rc1/owlcms-firmata.jar"
        );
    }

    #[test]
    fn drafts_and_bad_tags_are_skipped() {
        let releases = releases_from_payload(
            payload(
                r#"[
                    {"tag_name": "2.0.0", "draft": true},
                    {"tag_name": "nightly"},
                    {"tag_name": "1.2"},
                    {"tag_name": "1.2.0"}
                ]"#,
            ),
            "https://example.test/download",
            "a.jar",
        );
        assert_eq!(releases.len(), 1);
        assert_eq!(releases[0].version.to_string(), "1.2.0");
    }

    #[test]
    fn artifact_url_trims_trailing_slash() {
        let version = SemanticVersion::parse("1.0.0").unwrap();
        assert_eq!(
            artifact_url("https://example.test/dl/", &version, "a.jar"),
            "https://example.test/dl/1.0.0/a.jar"
        );
    }

    #[test]
    fn copy_reports_running_total() {
        let data = vec![7u8; COPY_CHUNK_BYTES * 2 + 10];
        let mut out = Vec::new();
        let mut seen = Vec::new();
        let total =
            copy_with_progress(&mut data.as_slice(), &mut out, &mut |n| seen.push(n)).unwrap();
        assert_eq!(total, data.len() as u64);
        assert_eq!(out, data);
        assert_eq!(seen.last().copied(), Some(data.len() as u64));
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
        }
    }

    #[test]
    fn interrupted_transfer_is_a_network_error() {
        let mut out = Vec::new();
        let err = copy_with_progress(&mut FailingReader, &mut out, &mut |_| {}).unwrap_err();
        assert!(matches!(err, LauncherError::Network(_)));
    }
}
