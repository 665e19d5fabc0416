use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::advisor::{advise, UpdateAdvisory};
use crate::error::{LaunchError, LauncherError, Result};
use crate::feed::{Release, ReleaseFeed};
use crate::installer::{DownloadInstaller, InstallEvent};
use crate::prereq::Prerequisite;
use crate::store::{InstallStore, InstalledVersion};
use crate::supervisor::{
    LaunchSpec, LockingProcess, ProcessSupervisor, RunningInstance, StopOutcome, SupervisorState,
};
use crate::version::{self, SemanticVersion};

/// The presentation boundary. Everything user-visible goes through here.
pub trait Presenter {
    fn status(&self, text: &str);
    fn advisory(&self, advisory: &UpdateAdvisory, notes_url: Option<&str>);
    fn notice(&self, text: &str);
    fn error(&self, err: &LauncherError);
    /// Asked before any destructive action; `Ok(false)` cancels it.
    fn confirm(&self, prompt: &str) -> Result<bool>;
    fn releases(&self, releases: &[Release], installed: &[InstalledVersion]);
}

#[derive(Debug)]
pub enum Message {
    Install(SemanticVersion),
    InstallLatest,
    Remove(SemanticVersion),
    RemoveAllVersions,
    Uninstall,
    RemovePrerequisite,
    Launch(Option<SemanticVersion>),
    Stop,
    KillLockingProcess,
    CheckForUpdates,
    ListReleases,
    Status,
    Interrupt,
    Quit,
    Installer(InstallEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct OrchestratorState {
    pub prerequisite: Option<PathBuf>,
    pub network_available: bool,
    pub releases: Vec<Release>,
    pub installed: Vec<InstalledVersion>,
    pub current: Option<InstalledVersion>,
    pub advisory: Option<UpdateAdvisory>,
    pub installs_in_flight: BTreeSet<SemanticVersion>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: SupervisorState,
    pub instance: Option<RunningInstance>,
    pub locking_process: Option<LockingProcess>,
    pub current: Option<SemanticVersion>,
    pub installed: Vec<SemanticVersion>,
    pub advisory: Option<UpdateAdvisory>,
    pub installs_in_flight: Vec<SemanticVersion>,
}

impl StatusReport {
    pub fn summary(&self) -> String {
        let mut text = match &self.instance {
            Some(instance) => format!(
                "Running {} (pid {}) since {}.",
                instance.version,
                instance.pid,
                instance.started_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            None => format!("Runtime is {}.", self.state),
        };
        if let Some(locking) = &self.locking_process {
            text.push_str(&format!(" Process {} holds the runtime lock.", locking.pid));
        }
        if let Some(advisory) = &self.advisory {
            text.push(' ');
            text.push_str(&advisory.message());
        }
        for version in &self.installs_in_flight {
            text.push_str(&format!(" Installing {version}."));
        }
        text
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub launch_spec: LaunchSpec,
    pub notes_base_url: String,
    pub offline: bool,
    pub poll_interval: Duration,
}

/// Owns the launcher state. Every command and every worker event goes through
/// one channel and is handled here, one at a time.
pub struct Orchestrator<P: Presenter> {
    store: InstallStore,
    feed: Arc<dyn ReleaseFeed>,
    installer: DownloadInstaller,
    supervisor: ProcessSupervisor,
    prerequisite: Arc<dyn Prerequisite>,
    presenter: P,
    settings: OrchestratorSettings,
    state: OrchestratorState,
    workers: BTreeMap<SemanticVersion, JoinHandle<()>>,
    tx: Sender<Message>,
    rx: Receiver<Message>,
}

impl<P: Presenter> Orchestrator<P> {
    pub fn new(
        store: InstallStore,
        feed: Arc<dyn ReleaseFeed>,
        supervisor: ProcessSupervisor,
        prerequisite: Arc<dyn Prerequisite>,
        presenter: P,
        settings: OrchestratorSettings,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        let installer = DownloadInstaller::new(store.clone(), feed.clone());
        Self {
            store,
            feed,
            installer,
            supervisor,
            prerequisite,
            presenter,
            settings,
            state: OrchestratorState::default(),
            workers: BTreeMap::new(),
            tx,
            rx,
        }
    }

    pub fn sender(&self) -> Sender<Message> {
        self.tx.clone()
    }

    pub fn presenter(&self) -> &P {
        &self.presenter
    }

    pub fn state(&self) -> &OrchestratorState {
        &self.state
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            state: self.supervisor.state(),
            instance: self.supervisor.instance(),
            locking_process: self.supervisor.locking_process(),
            current: self.state.current.as_ref().map(|c| c.version.clone()),
            installed: self
                .state
                .installed
                .iter()
                .map(|i| i.version.clone())
                .collect(),
            advisory: self.state.advisory.clone(),
            installs_in_flight: self.state.installs_in_flight.iter().cloned().collect(),
        }
    }

    /// Prerequisite lookup, network probe with release fetch, and a store scan.
    /// Nothing is installed or presented as an advisory.
    pub fn prepare(&mut self) -> Result<()> {
        self.state.prerequisite = self.prerequisite.locate();
        self.refresh_releases();
        self.state.installed = self.store.list_installed()?;
        Ok(())
    }

    /// First-run sequence. Fails with [`LauncherError::Offline`] when nothing is
    /// installed and nothing can be fetched.
    pub fn startup(&mut self) -> Result<()> {
        self.state.prerequisite = self.prerequisite.locate();
        if self.state.prerequisite.is_none() {
            warn!(name = self.prerequisite.name(), "runtime prerequisite not found");
        }

        self.refresh_releases();

        if self.state.prerequisite.is_none() && self.state.network_available {
            self.presenter.status(&format!(
                "Fetching the {} runtime...",
                self.prerequisite.name()
            ));
            match self.prerequisite.provision() {
                Ok(path) => {
                    info!(path = %path.display(), "runtime prerequisite provisioned");
                    self.state.prerequisite = Some(path);
                }
                Err(err) => self.report(&err),
            }
        }

        self.state.installed = self.store.list_installed()?;

        if self.state.installed.is_empty() {
            if !self.state.network_available {
                error!("no version installed and no network available");
                return Err(LauncherError::Offline);
            }
            match version::latest_stable(self.state.releases.iter().map(|r| &r.version)) {
                Some(latest) => {
                    self.presenter.status(&format!(
                        "Downloading and installing latest stable version {latest}"
                    ));
                    self.start_install(latest)?;
                }
                None => self
                    .presenter
                    .notice("No stable release is available to install."),
            }
        }

        self.refresh_advisory()
    }

    /// Drains worker events until no install is in flight. Other queued
    /// messages are handled along the way.
    pub fn settle(&mut self) -> Result<Flow> {
        while !self.state.installs_in_flight.is_empty() {
            match self.rx.recv_timeout(self.settings.poll_interval) {
                Ok(message) => {
                    if self.dispatch(message)? == Flow::Exit {
                        return Ok(Flow::Exit);
                    }
                }
                Err(RecvTimeoutError::Timeout) => self.reap_workers(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(Flow::Continue)
    }

    /// The control loop. Returns once a message asks to exit; the runtime has
    /// been stopped by then.
    pub fn run(&mut self) -> Result<()> {
        loop {
            match self.rx.recv_timeout(self.settings.poll_interval) {
                Ok(message) => {
                    if self.dispatch(message)? == Flow::Exit {
                        return Ok(());
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.poll_runtime();
                    self.reap_workers();
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }
    }

    /// Handles one message. Non-fatal errors are reported and swallowed.
    pub fn dispatch(&mut self, message: Message) -> Result<Flow> {
        match self.handle(message) {
            Ok(flow) => Ok(flow),
            Err(err) if err.is_fatal() => {
                error!(error = %err, "fatal error");
                Err(err)
            }
            Err(err) => {
                self.report(&err);
                Ok(Flow::Continue)
            }
        }
    }

    pub fn handle(&mut self, message: Message) -> Result<Flow> {
        debug!(message = ?message, "handling message");
        match message {
            Message::Install(version) => self.install(version),
            Message::InstallLatest => {
                let latest =
                    version::latest_stable(self.state.releases.iter().map(|r| &r.version))
                        .ok_or_else(|| {
                            LauncherError::Refused("no stable release is available".to_string())
                        })?;
                self.install(latest)
            }
            Message::Remove(version) => self.remove(&version),
            Message::RemoveAllVersions => self.remove_all_versions(),
            Message::Uninstall => self.uninstall(),
            Message::RemovePrerequisite => self.remove_prerequisite(),
            Message::Launch(version) => self.launch(version.as_ref()),
            Message::Stop => {
                let outcome = self.supervisor.stop()?;
                self.presenter.notice(&stop_message(outcome));
                Ok(Flow::Continue)
            }
            Message::KillLockingProcess => {
                match self.supervisor.kill_locking_process()? {
                    Some((locking, outcome)) => self.presenter.notice(&format!(
                        "Process {} was terminated ({}).",
                        locking.pid,
                        outcome_label(outcome)
                    )),
                    None => self.presenter.notice("No locking process found."),
                }
                Ok(Flow::Continue)
            }
            Message::CheckForUpdates => {
                self.refresh_releases();
                self.refresh_advisory()?;
                Ok(Flow::Continue)
            }
            Message::ListReleases => {
                self.presenter
                    .releases(&self.state.releases, &self.state.installed);
                Ok(Flow::Continue)
            }
            Message::Status => {
                self.presenter.notice(&self.status_report().summary());
                Ok(Flow::Continue)
            }
            Message::Interrupt => {
                info!("interrupt received, stopping runtime");
                let outcome = self.stop_own_runtime()?;
                if outcome != StopOutcome::AlreadyStopped {
                    self.presenter.notice(&stop_message(outcome));
                }
                Ok(Flow::Exit)
            }
            Message::Quit => {
                if self.supervisor.owns_runtime()
                    && !self.confirmed(
                        "This will stop the firmata server for all the users. Quit anyway?",
                    )?
                {
                    return Ok(Flow::Continue);
                }
                self.stop_own_runtime()?;
                Ok(Flow::Exit)
            }
            Message::Installer(event) => self.on_install_event(event),
        }
    }

    /// Leaving never touches a process started by another launcher; that one is
    /// only terminated through `KillLockingProcess`.
    fn stop_own_runtime(&self) -> Result<StopOutcome> {
        if !self.supervisor.owns_runtime() {
            return Ok(StopOutcome::AlreadyStopped);
        }
        self.supervisor.stop()
    }

    fn report(&self, err: &LauncherError) {
        error!(error = %err, "operation failed");
        self.presenter.error(err);
    }

    fn refresh_releases(&mut self) {
        self.state.network_available = !self.settings.offline && self.feed.is_reachable();
        if !self.state.network_available {
            info!("network unavailable, release list is empty");
            self.state.releases.clear();
            return;
        }
        match self.feed.fetch_releases() {
            Ok(releases) => self.state.releases = releases,
            Err(err) => {
                warn!(error = %err, "release list unavailable, continuing without it");
                self.presenter
                    .notice(&format!("The release list is unavailable ({err})."));
                self.state.releases.clear();
            }
        }
    }

    /// Rescans the store and presents a fresh advisory. Deferred while an
    /// install is in flight; the install's completion triggers it instead.
    fn refresh_advisory(&mut self) -> Result<()> {
        if !self.state.installs_in_flight.is_empty() {
            debug!("advisory refresh deferred until installs finish");
            return Ok(());
        }
        self.state.installed = self.store.list_installed()?;
        if let Some(current) = &self.state.current {
            if !self.state.installed.iter().any(|i| i.version == current.version) {
                self.state.current = None;
            }
        }
        let advisory = advise(&self.state.installed, &self.state.releases);
        let notes_url = advisory.notes_url(&self.settings.notes_base_url);
        self.presenter.advisory(&advisory, notes_url.as_deref());
        self.state.advisory = Some(advisory);
        Ok(())
    }

    fn running_version(&self) -> Option<SemanticVersion> {
        self.supervisor.instance().map(|instance| instance.version)
    }

    fn ensure_idle(&self, action: &str) -> Result<()> {
        if let Some(version) = self.state.installs_in_flight.iter().next() {
            return Err(LauncherError::InstallInProgress(version.to_string()));
        }
        if let Some(version) = self.running_version() {
            return Err(LauncherError::Refused(format!(
                "version {version} is running; stop it before {action}"
            )));
        }
        self.ensure_unlocked(action)
    }

    /// A runtime started by another launcher process still uses the install root.
    fn ensure_unlocked(&self, action: &str) -> Result<()> {
        match self.supervisor.detect_locking_process() {
            Some(locking) => Err(LauncherError::Refused(format!(
                "process {} is still running the device server; stop it (or use kill-locking) before {action}",
                locking.pid
            ))),
            None => Ok(()),
        }
    }

    fn confirmed(&self, prompt: &str) -> Result<bool> {
        if self.presenter.confirm(prompt)? {
            return Ok(true);
        }
        self.presenter.notice("Cancelled.");
        Ok(false)
    }

    fn install(&mut self, version: SemanticVersion) -> Result<Flow> {
        if self.state.installs_in_flight.contains(&version) {
            return Err(LauncherError::InstallInProgress(version.to_string()));
        }
        if self.running_version().as_ref() == Some(&version) {
            return Err(LauncherError::Refused(format!(
                "version {version} is running; stop it before reinstalling"
            )));
        }
        if self.store.artifact_path(&version).is_file()
            && !self.confirmed(&format!(
                "Version {version} is already installed. Download it again?"
            ))?
        {
            return Ok(Flow::Continue);
        }
        self.start_install(version)?;
        Ok(Flow::Continue)
    }

    fn start_install(&mut self, version: SemanticVersion) -> Result<()> {
        if self.settings.offline {
            return Err(LauncherError::Network(
                "offline mode is on; nothing can be downloaded".to_string(),
            ));
        }
        let url = self
            .state
            .releases
            .iter()
            .find(|release| release.version == version)
            .map(|release| release.download_url.clone())
            .unwrap_or_else(|| self.feed.download_url(&version));
        info!(version = %version, url = %url, "starting install");
        let tx = self.tx.clone();
        let handle = self.installer.spawn(version.clone(), url, move |event| {
            let _ = tx.send(Message::Installer(event));
        });
        self.state.installs_in_flight.insert(version.clone());
        self.workers.insert(version, handle);
        Ok(())
    }

    fn on_install_event(&mut self, event: InstallEvent) -> Result<Flow> {
        if let Some(text) = event.status_text() {
            self.presenter.status(&text);
        }
        if let InstallEvent::Finished { version, result } = event {
            self.state.installs_in_flight.remove(&version);
            if let Some(handle) = self.workers.remove(&version) {
                let _ = handle.join();
            }
            match result {
                Ok(installed) => self.presenter.notice(&format!(
                    "Version {} is installed in {}.",
                    installed.version,
                    installed.path.display()
                )),
                Err(err) => self.report(&err),
            }
            self.refresh_advisory()?;
        }
        Ok(Flow::Continue)
    }

    /// A worker that ended without delivering `Finished` panicked.
    fn reap_workers(&mut self) {
        let finished: Vec<SemanticVersion> = self
            .workers
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(version, _)| version.clone())
            .collect();
        for version in finished {
            if let Some(handle) = self.workers.remove(&version) {
                if handle.join().is_err() {
                    self.state.installs_in_flight.remove(&version);
                    self.report(&LauncherError::install(
                        &version,
                        LauncherError::Process("installer thread panicked".to_string()),
                    ));
                }
            }
        }
    }

    fn poll_runtime(&mut self) {
        if let Some((instance, status)) = self.supervisor.poll_exit() {
            self.presenter.notice(&format!(
                "Version {} stopped on its own ({status}).",
                instance.version
            ));
        }
    }

    fn remove(&mut self, version: &SemanticVersion) -> Result<Flow> {
        if self.state.installs_in_flight.contains(version) {
            return Err(LauncherError::InstallInProgress(version.to_string()));
        }
        if self.running_version().as_ref() == Some(version) {
            return Err(LauncherError::Refused(format!(
                "version {version} is running; stop it before removing it"
            )));
        }
        self.ensure_unlocked("removing it")?;
        if self.store.find(version)?.is_none() {
            return Err(LauncherError::Refused(format!(
                "version {version} is not installed"
            )));
        }
        if !self.confirmed(&format!("Remove version {version}?"))? {
            return Ok(Flow::Continue);
        }
        self.store.remove_version(version)?;
        self.presenter
            .notice(&format!("Version {version} was removed."));
        self.refresh_advisory()?;
        Ok(Flow::Continue)
    }

    fn remove_all_versions(&mut self) -> Result<Flow> {
        self.ensure_idle("removing versions")?;
        if !self.confirmed("Remove all installed versions?")? {
            return Ok(Flow::Continue);
        }
        let removed = self.store.remove_all_versions()?;
        self.presenter
            .notice(&format!("Removed {} version(s).", removed.len()));
        self.refresh_advisory()?;
        Ok(Flow::Continue)
    }

    fn uninstall(&mut self) -> Result<Flow> {
        self.ensure_idle("uninstalling")?;
        let root = self.store.root().display().to_string();
        if !self.confirmed(&format!(
            "Remove all launcher data in {root}, including every installed version?"
        ))? {
            return Ok(Flow::Continue);
        }
        self.store.remove_all()?;
        self.state.prerequisite = self.prerequisite.locate();
        self.presenter
            .notice(&format!("All launcher data in {root} was removed."));
        self.refresh_advisory()?;
        Ok(Flow::Continue)
    }

    fn remove_prerequisite(&mut self) -> Result<Flow> {
        if let Some(version) = self.running_version() {
            return Err(LauncherError::Refused(format!(
                "version {version} is running; stop it before removing {}",
                self.prerequisite.name()
            )));
        }
        self.ensure_unlocked(&format!("removing {}", self.prerequisite.name()))?;
        if !self.confirmed(&format!(
            "Remove the launcher-managed {} runtime?",
            self.prerequisite.name()
        ))? {
            return Ok(Flow::Continue);
        }
        self.prerequisite.remove()?;
        self.state.prerequisite = self.prerequisite.locate();
        self.presenter.notice(&format!(
            "The managed {} runtime was removed.",
            self.prerequisite.name()
        ));
        Ok(Flow::Continue)
    }

    fn launch(&mut self, requested: Option<&SemanticVersion>) -> Result<Flow> {
        let installed = self.store.list_installed()?;
        let target = match requested {
            Some(version) => installed
                .into_iter()
                .find(|i| &i.version == version)
                .ok_or_else(|| {
                    LauncherError::Refused(format!("version {version} is not installed"))
                })?,
            None => match &self.state.current {
                Some(current) if installed.contains(current) => current.clone(),
                _ => installed
                    .into_iter()
                    .max_by(|a, b| a.version.cmp(&b.version))
                    .ok_or_else(|| {
                        LauncherError::Refused("No version is installed.".to_string())
                    })?,
            },
        };
        if self.state.installs_in_flight.contains(&target.version) {
            return Err(LauncherError::InstallInProgress(target.version.to_string()));
        }

        let program = self
            .prerequisite
            .locate()
            .ok_or_else(|| LaunchError::PrerequisiteMissing(self.prerequisite.name().to_string()))?;
        self.state.prerequisite = Some(program.clone());
        let spec = self
            .settings
            .launch_spec
            .clone()
            .with_program(program.to_string_lossy());
        let artifact = self.store.artifact_path(&target.version);

        self.presenter
            .status(&format!("Starting version {}...", target.version));
        let instance = self.supervisor.launch(&target, &artifact, &spec)?;
        self.state.current = Some(target);
        self.presenter.notice(&format!(
            "Version {} is running (pid {}).",
            instance.version, instance.pid
        ));
        Ok(Flow::Continue)
    }
}

fn outcome_label(outcome: StopOutcome) -> &'static str {
    match outcome {
        StopOutcome::AlreadyStopped => "not running",
        StopOutcome::Exited => "already exited",
        StopOutcome::Graceful => "graceful",
        StopOutcome::Forced => "forced",
        StopOutcome::Coalesced => "stopped by a concurrent request",
    }
}

fn stop_message(outcome: StopOutcome) -> String {
    match outcome {
        StopOutcome::AlreadyStopped => "Nothing is running.".to_string(),
        other => format!("Runtime stopped ({}).", outcome_label(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::tests::StaticFeed;
    use crate::supervisor::{SupervisorSettings, LOCK_FILE_NAME};
    use std::cell::RefCell;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingPresenter {
        answer: bool,
        statuses: RefCell<Vec<String>>,
        notices: RefCell<Vec<String>>,
        errors: RefCell<Vec<String>>,
        advisories: RefCell<Vec<UpdateAdvisory>>,
        prompts: RefCell<Vec<String>>,
    }

    impl RecordingPresenter {
        fn agreeing() -> Self {
            Self {
                answer: true,
                ..Self::default()
            }
        }

        fn last_advisory(&self) -> Option<UpdateAdvisory> {
            self.advisories.borrow().last().cloned()
        }
    }

    impl Presenter for RecordingPresenter {
        fn status(&self, text: &str) {
            self.statuses.borrow_mut().push(text.to_string());
        }

        fn advisory(&self, advisory: &UpdateAdvisory, _notes_url: Option<&str>) {
            self.advisories.borrow_mut().push(advisory.clone());
        }

        fn notice(&self, text: &str) {
            self.notices.borrow_mut().push(text.to_string());
        }

        fn error(&self, err: &LauncherError) {
            self.errors.borrow_mut().push(err.to_string());
        }

        fn confirm(&self, prompt: &str) -> Result<bool> {
            self.prompts.borrow_mut().push(prompt.to_string());
            Ok(self.answer)
        }

        fn releases(&self, _releases: &[Release], _installed: &[InstalledVersion]) {}
    }

    struct FakePrerequisite {
        path: Option<PathBuf>,
        provision_ok: bool,
    }

    impl Prerequisite for FakePrerequisite {
        fn name(&self) -> &str {
            "java"
        }

        fn locate(&self) -> Option<PathBuf> {
            self.path.clone()
        }

        fn provision(&self) -> Result<PathBuf> {
            if self.provision_ok {
                Ok(PathBuf::from("/opt/java/bin/java"))
            } else {
                Err(LauncherError::Network("jre download failed".to_string()))
            }
        }

        fn remove(&self) -> Result<()> {
            Ok(())
        }
    }

    fn orchestrator(
        root: &Path,
        feed: StaticFeed,
        presenter: RecordingPresenter,
        offline: bool,
    ) -> (Orchestrator<RecordingPresenter>, Arc<StaticFeed>) {
        let feed = Arc::new(feed);
        let prerequisite = Arc::new(FakePrerequisite {
            path: Some(PathBuf::from("sh")),
            provision_ok: true,
        });
        let orch = orchestrator_with(root, feed.clone(), prerequisite, presenter, offline);
        (orch, feed)
    }

    fn orchestrator_with(
        root: &Path,
        feed: Arc<StaticFeed>,
        prerequisite: Arc<FakePrerequisite>,
        presenter: RecordingPresenter,
        offline: bool,
    ) -> Orchestrator<RecordingPresenter> {
        let store = InstallStore::new(root, "app.jar");
        let supervisor = ProcessSupervisor::new(SupervisorSettings {
            lock_path: root.join(LOCK_FILE_NAME),
            port: None,
            grace_period: Duration::from_millis(1000),
            settle: Duration::from_millis(100),
            poll_interval: Duration::from_millis(20),
            runtime_marker: Some("app.jar".to_string()),
        });
        Orchestrator::new(
            store,
            feed,
            supervisor,
            prerequisite,
            presenter,
            OrchestratorSettings {
                launch_spec: LaunchSpec {
                    program: "sh".to_string(),
                    args: vec!["-c".to_string(), "exec sleep 30".to_string()],
                },
                notes_base_url: "https://example.test/releases/tag".to_string(),
                offline,
                poll_interval: Duration::from_millis(20),
            },
        )
    }

    fn v(text: &str) -> SemanticVersion {
        SemanticVersion::parse(text).unwrap()
    }

    fn seed(root: &Path, versions: &[&str]) {
        for text in versions {
            let dir = root.join(text);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("app.jar"), b"jar").unwrap();
        }
    }

    #[test]
    fn offline_with_nothing_installed_is_fatal() {
        let dir = tempdir().unwrap();
        let (mut orch, feed) = orchestrator(
            dir.path(),
            StaticFeed::with_versions(&["1.0.0"]),
            RecordingPresenter::default(),
            true,
        );
        let err = orch.startup().unwrap_err();
        assert!(matches!(err, LauncherError::Offline));
        assert!(err.to_string().contains("connected to the internet"));
        assert!(feed.downloads.lock().unwrap().is_empty());
    }

    #[test]
    fn unreachable_feed_with_nothing_installed_is_fatal() {
        let dir = tempdir().unwrap();
        let mut feed = StaticFeed::with_versions(&["1.0.0"]);
        feed.reachable = false;
        let (mut orch, _) = orchestrator(dir.path(), feed, RecordingPresenter::default(), false);
        assert!(matches!(orch.startup(), Err(LauncherError::Offline)));
    }

    #[test]
    fn offline_with_installed_version_reports_advisory() {
        let dir = tempdir().unwrap();
        seed(dir.path(), &["1.2.0"]);
        let (mut orch, _) = orchestrator(
            dir.path(),
            StaticFeed::with_versions(&["1.3.0"]),
            RecordingPresenter::default(),
            true,
        );
        orch.startup().unwrap();
        assert_eq!(
            orch.presenter().last_advisory(),
            Some(UpdateAdvisory::UpToDateStable(v("1.2.0")))
        );
        assert!(orch.state().releases.is_empty());
    }

    #[test]
    fn bootstrap_installs_latest_stable_not_pre_release() {
        let dir = tempdir().unwrap();
        let (mut orch, feed) = orchestrator(
            dir.path(),
            StaticFeed::with_versions(&["1.0.0-rc1", "1.0.0"]),
            RecordingPresenter::default(),
            false,
        );
        orch.startup().unwrap();
        assert!(orch.state().installs_in_flight.contains(&v("1.0.0")));
        assert!(orch.presenter().advisories.borrow().is_empty());

        assert_eq!(orch.settle().unwrap(), Flow::Continue);

        let installed: Vec<_> = orch
            .state()
            .installed
            .iter()
            .map(|i| i.version.clone())
            .collect();
        assert_eq!(installed, vec![v("1.0.0")]);
        let downloads = feed.downloads.lock().unwrap().clone();
        assert_eq!(downloads.len(), 1);
        assert!(downloads[0].contains("/1.0.0/"));
        assert_eq!(
            orch.presenter().last_advisory(),
            Some(UpdateAdvisory::UpToDateStable(v("1.0.0")))
        );
    }

    #[test]
    fn failed_provisioning_is_not_fatal() {
        let dir = tempdir().unwrap();
        seed(dir.path(), &["1.0.0"]);
        let feed = Arc::new(StaticFeed::with_versions(&["1.0.0"]));
        let prerequisite = Arc::new(FakePrerequisite {
            path: None,
            provision_ok: false,
        });
        let mut orch = orchestrator_with(
            dir.path(),
            feed,
            prerequisite,
            RecordingPresenter::default(),
            false,
        );
        orch.startup().unwrap();
        assert!(orch.state().prerequisite.is_none());
        assert!(orch.presenter().errors.borrow()[0].contains("jre download failed"));
        assert_eq!(
            orch.presenter().last_advisory(),
            Some(UpdateAdvisory::UpToDateStable(v("1.0.0")))
        );
    }

    #[test]
    fn remove_recomputes_advisory() {
        let dir = tempdir().unwrap();
        seed(dir.path(), &["1.0.0", "1.1.0"]);
        let (mut orch, _) = orchestrator(
            dir.path(),
            StaticFeed::with_versions(&["1.0.0", "1.1.0"]),
            RecordingPresenter::agreeing(),
            false,
        );
        orch.startup().unwrap();
        assert_eq!(
            orch.presenter().last_advisory(),
            Some(UpdateAdvisory::UpToDateStable(v("1.1.0")))
        );

        orch.dispatch(Message::Remove(v("1.1.0"))).unwrap();
        assert!(!dir.path().join("1.1.0").exists());
        assert_eq!(
            orch.presenter().last_advisory(),
            Some(UpdateAdvisory::UpdateAvailable(v("1.1.0")))
        );
        assert_eq!(orch.state().installed.len(), 1);
    }

    #[test]
    fn declined_remove_keeps_version() {
        let dir = tempdir().unwrap();
        seed(dir.path(), &["1.0.0"]);
        let (mut orch, _) = orchestrator(
            dir.path(),
            StaticFeed::with_versions(&[]),
            RecordingPresenter::default(),
            true,
        );
        orch.startup().unwrap();
        orch.dispatch(Message::Remove(v("1.0.0"))).unwrap();
        assert!(dir.path().join("1.0.0").exists());
        assert_eq!(orch.presenter().prompts.borrow().len(), 1);
        assert_eq!(orch.presenter().notices.borrow().last().unwrap(), "Cancelled.");
    }

    #[test]
    fn overlapping_install_of_same_version_is_rejected() {
        let dir = tempdir().unwrap();
        seed(dir.path(), &["1.0.0"]);
        let (mut orch, _) = orchestrator(
            dir.path(),
            StaticFeed::with_versions(&["1.0.0", "2.0.0"]),
            RecordingPresenter::agreeing(),
            false,
        );
        orch.startup().unwrap();
        orch.dispatch(Message::Install(v("2.0.0"))).unwrap();
        let err = orch.handle(Message::Install(v("2.0.0"))).unwrap_err();
        assert!(matches!(err, LauncherError::InstallInProgress(_)));
        let err = orch.handle(Message::Remove(v("2.0.0"))).unwrap_err();
        assert!(matches!(err, LauncherError::InstallInProgress(_)));

        orch.settle().unwrap();
        assert!(dir.path().join("2.0.0").join("app.jar").exists());
        assert_eq!(
            orch.presenter().last_advisory(),
            Some(UpdateAdvisory::UpToDateStable(v("2.0.0")))
        );
    }

    #[test]
    fn failed_install_is_reported_and_advisory_refreshed() {
        let dir = tempdir().unwrap();
        seed(dir.path(), &["1.0.0"]);
        let (mut orch, _) = orchestrator(
            dir.path(),
            StaticFeed::with_versions(&["1.0.0"]),
            RecordingPresenter::agreeing(),
            false,
        );
        orch.startup().unwrap();
        orch.dispatch(Message::Install(v("3.0.0"))).unwrap();
        orch.settle().unwrap();
        let errors = orch.presenter().errors.borrow().clone();
        assert!(errors.iter().any(|e| e.contains("install of 3.0.0 failed")));
        assert!(orch.state().installs_in_flight.is_empty());
        assert!(orch.state().installed.iter().any(|i| i.version == v("3.0.0")));
    }

    #[test]
    fn launch_with_nothing_installed_is_refused() {
        let dir = tempdir().unwrap();
        let (mut orch, _) = orchestrator(
            dir.path(),
            StaticFeed::with_versions(&[]),
            RecordingPresenter::default(),
            false,
        );
        let err = orch.handle(Message::Launch(None)).unwrap_err();
        assert_eq!(err.to_string(), "No version is installed.");
        assert_eq!(orch.dispatch(Message::Launch(None)).unwrap(), Flow::Continue);
        assert_eq!(orch.presenter().errors.borrow().len(), 1);
    }

    #[test]
    fn failed_release_fetch_does_not_fail_commands() {
        let dir = tempdir().unwrap();
        seed(dir.path(), &["1.0.0", "1.1.0"]);
        let mut feed = StaticFeed::with_versions(&["1.0.0", "1.1.0"]);
        feed.fetch_error = Some("HTTP 403 rate limit exceeded".to_string());
        let (mut orch, _) = orchestrator(dir.path(), feed, RecordingPresenter::agreeing(), false);

        orch.prepare().unwrap();
        assert!(orch.state().network_available);
        assert!(orch.state().releases.is_empty());

        orch.handle(Message::Remove(v("1.1.0"))).unwrap();
        assert!(!dir.path().join("1.1.0").exists());
        assert!(orch.presenter().errors.borrow().is_empty());
        assert!(orch
            .presenter()
            .notices
            .borrow()
            .iter()
            .any(|n| n.contains("release list is unavailable")));
        assert_eq!(
            orch.presenter().last_advisory(),
            Some(UpdateAdvisory::UpToDateStable(v("1.0.0")))
        );
    }

    #[test]
    fn quit_with_nothing_running_exits_without_asking() {
        let dir = tempdir().unwrap();
        let (mut orch, _) = orchestrator(
            dir.path(),
            StaticFeed::with_versions(&[]),
            RecordingPresenter::default(),
            true,
        );
        assert_eq!(orch.dispatch(Message::Quit).unwrap(), Flow::Exit);
        assert!(orch.presenter().prompts.borrow().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn declined_quit_keeps_runtime_running() {
        let dir = tempdir().unwrap();
        seed(dir.path(), &["1.0.0"]);
        let (mut orch, _) = orchestrator(
            dir.path(),
            StaticFeed::with_versions(&[]),
            RecordingPresenter::default(),
            true,
        );
        orch.startup().unwrap();
        orch.handle(Message::Launch(None)).unwrap();

        assert_eq!(orch.dispatch(Message::Quit).unwrap(), Flow::Continue);
        assert!(orch.presenter().prompts.borrow()[0].contains("for all the users"));
        assert_eq!(orch.supervisor().state(), SupervisorState::Running);

        assert_eq!(orch.dispatch(Message::Interrupt).unwrap(), Flow::Exit);
        assert_eq!(orch.supervisor().state(), SupervisorState::Stopped);
    }

    #[cfg(unix)]
    #[test]
    fn leaving_never_terminates_another_launchers_runtime() {
        use crate::supervisor::process_is_alive;
        use std::process::Command;

        let dir = tempdir().unwrap();
        seed(dir.path(), &["1.0.0"]);
        let (mut orch, _) = orchestrator(
            dir.path(),
            StaticFeed::with_versions(&[]),
            RecordingPresenter::agreeing(),
            true,
        );
        orch.startup().unwrap();

        let mut foreign = Command::new("sh")
            .arg("-c")
            .arg("sleep 30; :")
            .arg(dir.path().join("1.0.0").join("app.jar"))
            .spawn()
            .unwrap();
        fs::write(dir.path().join(LOCK_FILE_NAME), foreign.id().to_string()).unwrap();

        assert_eq!(orch.dispatch(Message::Launch(None)).unwrap(), Flow::Continue);
        assert_eq!(orch.supervisor().state(), SupervisorState::LockedByOther);

        assert_eq!(orch.dispatch(Message::Interrupt).unwrap(), Flow::Exit);
        assert!(process_is_alive(foreign.id()));
        assert_eq!(orch.dispatch(Message::Quit).unwrap(), Flow::Exit);
        assert!(process_is_alive(foreign.id()));
        assert!(orch.presenter().prompts.borrow().is_empty());

        foreign.kill().unwrap();
        foreign.wait().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn interrupt_stops_running_instance_before_exit() {
        let dir = tempdir().unwrap();
        seed(dir.path(), &["1.0.0", "1.1.0"]);
        let (mut orch, _) = orchestrator(
            dir.path(),
            StaticFeed::with_versions(&[]),
            RecordingPresenter::agreeing(),
            true,
        );
        orch.startup().unwrap();
        orch.handle(Message::Launch(None)).unwrap();
        let instance = orch.supervisor().instance().unwrap();
        assert_eq!(instance.version, v("1.1.0"));

        let err = orch.handle(Message::Remove(v("1.1.0"))).unwrap_err();
        assert!(matches!(err, LauncherError::Refused(_)));

        orch.sender().send(Message::Interrupt).unwrap();
        orch.run().unwrap();
        assert_eq!(orch.supervisor().state(), SupervisorState::Stopped);
        assert!(crate::supervisor::read_pid_file(&dir.path().join(LOCK_FILE_NAME)).is_none());
    }
}
