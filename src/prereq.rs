use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{LaunchError, LauncherError, Result};
use crate::feed::ReleaseFeed;
use crate::store::remove_tree;

/// A runtime the launched program needs (the Java VM for the jar).
pub trait Prerequisite: Send + Sync {
    fn name(&self) -> &str;

    /// Path of a usable executable, preferring the launcher-managed copy.
    fn locate(&self) -> Option<PathBuf>;

    fn provision(&self) -> Result<PathBuf>;

    /// Deletes the launcher-managed copy; a system-wide install is left alone.
    fn remove(&self) -> Result<()>;
}

pub struct JavaPrerequisite {
    program: String,
    managed_dir: PathBuf,
    provision_url: String,
    feed: Arc<dyn ReleaseFeed>,
}

impl JavaPrerequisite {
    pub fn new(
        program: impl Into<String>,
        managed_dir: impl Into<PathBuf>,
        provision_url: impl Into<String>,
        feed: Arc<dyn ReleaseFeed>,
    ) -> Self {
        Self {
            program: program.into(),
            managed_dir: managed_dir.into(),
            provision_url: provision_url.into(),
            feed,
        }
    }

    pub fn from_config(cfg: &Config, install_root: &Path, feed: Arc<dyn ReleaseFeed>) -> Self {
        Self::new(
            cfg.prerequisite.name.clone(),
            install_root.join(&cfg.prerequisite.managed_dir),
            cfg.prerequisite.provision_url.clone(),
            feed,
        )
    }

    pub fn managed_dir(&self) -> &Path {
        &self.managed_dir
    }

    fn managed_candidates(&self) -> Vec<PathBuf> {
        let exe = if cfg!(windows) {
            format!("{}.exe", self.program)
        } else {
            self.program.clone()
        };
        vec![
            self.managed_dir.join("bin").join(&exe),
            self.managed_dir
                .join("Contents")
                .join("Home")
                .join("bin")
                .join(&exe),
        ]
    }
}

impl Prerequisite for JavaPrerequisite {
    fn name(&self) -> &str {
        &self.program
    }

    fn locate(&self) -> Option<PathBuf> {
        if let Some(path) = self.managed_candidates().into_iter().find(|p| p.is_file()) {
            debug!(path = %path.display(), "using managed runtime");
            return Some(path);
        }
        which::which(&self.program).ok()
    }

    fn provision(&self) -> Result<PathBuf> {
        if self.provision_url.trim().is_empty() {
            return Err(LauncherError::Refused(format!(
                "no download is configured for {}; install it and make sure it is on PATH",
                self.program
            )));
        }
        info!(url = %self.provision_url, dir = %self.managed_dir.display(), "provisioning runtime");
        let archive = self.managed_dir.with_extension("archive.part");
        if let Some(parent) = archive.parent() {
            fs::create_dir_all(parent)?;
        }
        let download = (|| -> Result<()> {
            let mut writer = BufWriter::new(File::create(&archive)?);
            self.feed.download(&self.provision_url, &mut writer, &mut |_| {})?;
            writer.flush()?;
            remove_tree(&self.managed_dir)?;
            extract_bundle(&archive, &self.managed_dir)
        })();
        let _ = fs::remove_file(&archive);
        download?;

        self.managed_candidates()
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| LaunchError::PrerequisiteMissing(self.program.clone()).into())
    }

    fn remove(&self) -> Result<()> {
        remove_tree(&self.managed_dir)?;
        info!(dir = %self.managed_dir.display(), "removed managed runtime");
        Ok(())
    }
}

fn normalize_tar_entry_path(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let stripped = trimmed
        .trim_start_matches("./")
        .trim_start_matches('/')
        .trim_end_matches('/');
    if stripped.is_empty() {
        return None;
    }
    Some(stripped.to_string())
}

fn tar_list_entries(archive: &Path) -> Result<Vec<String>> {
    let output = Command::new("tar")
        .arg("-tf")
        .arg(archive)
        .output()
        .map_err(|err| LauncherError::Process(format!("failed to run tar: {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(LauncherError::Process(format!(
            "tar listing failed with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().filter_map(normalize_tar_entry_path).collect())
}

/// True when every entry lives under one shared top-level directory, as JDK
/// archives (`jdk-17.0.9+9-jre/...`) do.
fn tar_has_single_top_level_dir(entries: &[String]) -> bool {
    let mut top: Option<&str> = None;
    let mut saw_nested = false;
    for entry in entries {
        let (first, nested) = match entry.split_once('/') {
            Some((first, _)) => (first, true),
            None => (entry.as_str(), false),
        };
        if first.is_empty() {
            continue;
        }
        saw_nested |= nested;
        match top {
            None => top = Some(first),
            Some(existing) if existing != first => return false,
            Some(_) => {}
        }
    }
    saw_nested && top.is_some()
}

fn extract_bundle(archive: &Path, destination: &Path) -> Result<()> {
    fs::create_dir_all(destination)?;
    let entries = tar_list_entries(archive)?;
    let strip_components = tar_has_single_top_level_dir(&entries);
    let mut cmd = Command::new("tar");
    cmd.arg("-xf").arg(archive).arg("-C").arg(destination);
    if strip_components {
        cmd.arg("--strip-components").arg("1");
    }
    let status = cmd
        .status()
        .map_err(|err| LauncherError::Process(format!("failed to run tar: {err}")))?;
    if !status.success() {
        warn!(archive = %archive.display(), %status, "tar extraction failed");
        return Err(LauncherError::Process(format!(
            "tar extraction failed with status {status}"
        )));
    }
    Ok(())
}
