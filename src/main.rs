mod advisor;
mod config;
mod error;
mod feed;
mod installer;
mod orchestrator;
mod prereq;
mod store;
mod supervisor;
mod version;

use clap::{Parser, Subcommand};
use dialoguer::console::style;
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use serde::Serialize;
use serde_json::json;
use std::cell::RefCell;
use std::fs;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::advisor::{advise, UpdateAdvisory};
use crate::config::{
    load_config, read_config, resolve_config_path, resolve_install_root, Config,
    DEFAULT_CONFIG_YAML,
};
use crate::error::{LauncherError, Result};
use crate::feed::{HttpReleaseFeed, Release, ReleaseFeed};
use crate::orchestrator::{Flow, Message, Orchestrator, OrchestratorSettings, Presenter};
use crate::prereq::{JavaPrerequisite, Prerequisite};
use crate::store::{InstallStore, InstalledVersion};
use crate::supervisor::{LaunchSpec, ProcessSupervisor, SupervisorSettings};
use crate::version::SemanticVersion;

const LOG_ENV: &str = "FIRMATA_LOG";
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Parser, Debug)]
#[command(
    name = "firmata-launcher",
    version,
    about = "Installs, updates and runs the owlcms firmata device server"
)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    /// Skip the network entirely; only installed versions are used.
    #[arg(long, global = true)]
    offline: bool,
    /// Answer yes to confirmation prompts.
    #[arg(long, global = true)]
    yes: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install on first run, launch, then accept console commands until quit.
    Start {
        #[arg(long)]
        version: Option<String>,
    },
    Versions,
    Releases,
    Check,
    Install {
        #[arg(required_unless_present = "latest")]
        version: Option<String>,
        #[arg(long, conflicts_with = "version")]
        latest: bool,
    },
    Remove {
        version: String,
    },
    RemoveAll,
    RemovePrerequisite,
    /// Delete the install root, including every version and the managed runtime.
    Uninstall,
    KillLocking,
    Status,
    Paths,
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    json: bool,
    offline: bool,
    yes: bool,
}

/// Everything a command needs, resolved from config and environment.
struct Launcher {
    cfg: Config,
    install_root: PathBuf,
    store: InstallStore,
    feed: Arc<HttpReleaseFeed>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let ctx = build_context(&cli);

    let result = match cli.command {
        Commands::Start { version } => handle_start(&ctx, version),
        Commands::Versions => handle_versions(&ctx),
        Commands::Releases => handle_releases(&ctx),
        Commands::Check => handle_check(&ctx),
        Commands::Install { version, latest } => handle_install(&ctx, version, latest),
        Commands::Remove { version } => {
            SemanticVersion::parse(&version).and_then(|v| handle_mutation(&ctx, Message::Remove(v)))
        }
        Commands::RemoveAll => handle_mutation(&ctx, Message::RemoveAllVersions),
        Commands::RemovePrerequisite => handle_mutation(&ctx, Message::RemovePrerequisite),
        Commands::Uninstall => handle_mutation(&ctx, Message::Uninstall),
        Commands::KillLocking => handle_mutation(&ctx, Message::KillLockingProcess),
        Commands::Status => handle_status(&ctx),
        Commands::Paths => handle_paths(&ctx),
        Commands::Config { command } => handle_config(&ctx, command),
    };

    if let Err(err) = result {
        error!(error = %err, "command failed");
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn build_context(cli: &Cli) -> Context {
    Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
        offline: cli.offline || config::offline_forced(),
        yes: cli.yes,
    }
}

fn load_launcher(ctx: &Context) -> Result<Launcher> {
    let cfg = load_config(&ctx.config_path)?;
    let install_root = resolve_install_root(&cfg);
    let store = InstallStore::new(&install_root, cfg.release.artifact_name.clone());
    let feed = Arc::new(HttpReleaseFeed::from_config(&cfg)?);
    info!(root = %install_root.display(), config = %ctx.config_path.display(), "launcher configured");
    Ok(Launcher {
        cfg,
        install_root,
        store,
        feed,
    })
}

fn build_orchestrator(
    ctx: &Context,
    launcher: &Launcher,
    presenter: ConsolePresenter,
) -> Orchestrator<ConsolePresenter> {
    let feed: Arc<dyn ReleaseFeed> = launcher.feed.clone();
    let prerequisite: Arc<dyn Prerequisite> = Arc::new(JavaPrerequisite::from_config(
        &launcher.cfg,
        &launcher.install_root,
        feed.clone(),
    ));
    let supervisor = ProcessSupervisor::new(SupervisorSettings::from_config(
        &launcher.cfg.runtime,
        &launcher.install_root,
        &launcher.cfg.release.artifact_name,
    ));
    Orchestrator::new(
        launcher.store.clone(),
        feed,
        supervisor,
        prerequisite,
        presenter,
        OrchestratorSettings {
            launch_spec: LaunchSpec::from_config(&launcher.cfg.runtime),
            notes_base_url: launcher.cfg.release.notes_base_url.clone(),
            offline: ctx.offline,
            poll_interval: Duration::from_millis(200),
        },
    )
}

/// Terminal front-end. With `--json`, one-shot commands collect events into
/// the final envelope while `start` streams them as JSON lines.
struct ConsolePresenter {
    json: bool,
    streaming: bool,
    assume_yes: bool,
    prompts: bool,
    answers: Option<Arc<ConsoleAnswers>>,
    events: RefCell<Vec<serde_json::Value>>,
    errors: RefCell<Vec<String>>,
}

impl ConsolePresenter {
    fn new(ctx: &Context, streaming: bool) -> Self {
        Self {
            json: ctx.json,
            streaming,
            assume_yes: ctx.yes,
            prompts: !ctx.json && !streaming && io::stdin().is_terminal(),
            answers: None,
            events: RefCell::new(Vec::new()),
            errors: RefCell::new(Vec::new()),
        }
    }

    /// Confirmations are answered on the `start` console while its reader is
    /// attached to stdin.
    fn with_answers(mut self, answers: Arc<ConsoleAnswers>) -> Self {
        self.answers = Some(answers);
        self
    }

    fn emit(&self, event: serde_json::Value) {
        if self.streaming {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{line}");
            }
        } else {
            self.events.borrow_mut().push(event);
        }
    }
}

impl Presenter for ConsolePresenter {
    fn status(&self, text: &str) {
        if self.json {
            self.emit(json!({"status": text}));
        } else {
            println!("{}", style(text).dim());
        }
    }

    fn advisory(&self, advisory: &UpdateAdvisory, notes_url: Option<&str>) {
        if self.json {
            self.emit(json!({"advisory": advisory, "notes_url": notes_url}));
            return;
        }
        let message = match advisory {
            UpdateAdvisory::UpdateAvailable(_) => style(advisory.message()).bold().yellow(),
            _ => style(advisory.message()).bold(),
        };
        match notes_url {
            Some(url) => println!("{message} {}", style(format!("Release notes: {url}")).dim()),
            None => println!("{message}"),
        }
    }

    fn notice(&self, text: &str) {
        if self.json {
            self.emit(json!({"notice": text}));
        } else {
            println!("{text}");
        }
    }

    fn error(&self, err: &LauncherError) {
        self.errors.borrow_mut().push(err.to_string());
        if self.json {
            self.emit(json!({"error": err.to_string()}));
        } else {
            eprintln!("{}", style(err.to_string()).red());
        }
    }

    fn confirm(&self, prompt: &str) -> Result<bool> {
        if self.assume_yes {
            return Ok(true);
        }
        if let Some(reply) = self.answers.as_ref().and_then(|answers| answers.ask()) {
            if self.json {
                self.emit(json!({"prompt": prompt}));
            } else {
                print!("{prompt} [y/N] ");
                io::stdout().flush()?;
            }
            let answer = reply.recv().unwrap_or_default();
            return Ok(matches!(
                answer.trim().to_ascii_lowercase().as_str(),
                "y" | "yes"
            ));
        }
        if !self.prompts {
            return Err(LauncherError::Refused(format!(
                "{} requires --yes when not answering interactively",
                prompt.trim_end_matches('?')
            )));
        }
        let theme = ColorfulTheme::default();
        Ok(Confirm::with_theme(&theme)
            .with_prompt(prompt)
            .default(false)
            .interact()?)
    }

    fn releases(&self, releases: &[Release], installed: &[InstalledVersion]) {
        let is_installed =
            |version: &SemanticVersion| installed.iter().any(|i| &i.version == version);
        if self.json {
            let entries: Vec<serde_json::Value> = releases
                .iter()
                .map(|release| {
                    json!({
                        "version": release.version,
                        "pre_release": release.is_pre_release,
                        "installed": is_installed(&release.version),
                        "download_url": release.download_url,
                    })
                })
                .collect();
            self.emit(json!({"releases": entries}));
            return;
        }
        if releases.is_empty() {
            println!("No releases available.");
            return;
        }
        for release in releases {
            let mut line = release.version.to_string();
            if release.is_pre_release {
                line.push_str(" (pre-release)");
            }
            if is_installed(&release.version) {
                line.push_str(&format!(" {}", style("[installed]").green()));
            }
            println!("{line}");
        }
    }
}

/// Prints the collected events and exits non-zero if any error was reported
/// along the way.
fn finish(
    ctx: &Context,
    orch: &Orchestrator<ConsolePresenter>,
    mut payload: serde_json::Value,
) -> Result<()> {
    let presenter = orch.presenter();
    let errors = presenter.errors.borrow().clone();
    if ctx.json {
        if let Some(map) = payload.as_object_mut() {
            map.insert(
                "events".to_string(),
                serde_json::Value::Array(presenter.events.borrow().clone()),
            );
        }
        let wrapper = JsonResult {
            ok: errors.is_empty(),
            result: Some(payload),
            error: if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            },
        };
        print_json(&wrapper)?;
    }
    if !errors.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

fn handle_start(ctx: &Context, version: Option<String>) -> Result<()> {
    let requested = version.as_deref().map(SemanticVersion::parse).transpose()?;
    let launcher = load_launcher(ctx)?;
    let answers = Arc::new(ConsoleAnswers::default());
    let presenter = ConsolePresenter::new(ctx, true).with_answers(Arc::clone(&answers));
    let mut orch = build_orchestrator(ctx, &launcher, presenter);
    spawn_interrupt_watcher(orch.sender())?;

    orch.startup()?;
    if orch.settle()? == Flow::Exit {
        return Ok(());
    }
    if orch.dispatch(Message::Launch(requested))? == Flow::Exit {
        return Ok(());
    }
    if !ctx.json {
        println!(
            "{}",
            style("Type `help` for console commands; Ctrl-C stops the runtime and exits.").dim()
        );
    }
    spawn_console_reader(orch.sender(), answers, ctx.json);
    orch.run()
}

/// The first signal sets both flags. Any later one finds `requested` set and
/// exits right away, even while startup still blocks the control loop.
fn register_interrupts(
    signals: &[libc::c_int],
    requested: &Arc<AtomicBool>,
    pending: &Arc<AtomicBool>,
) -> Result<()> {
    use signal_hook::flag;

    for &signal in signals {
        flag::register_conditional_shutdown(signal, INTERRUPTED_EXIT_CODE, Arc::clone(requested))?;
        flag::register(signal, Arc::clone(requested))?;
        flag::register(signal, Arc::clone(pending))?;
    }
    Ok(())
}

fn spawn_interrupt_watcher(tx: Sender<Message>) -> Result<()> {
    use signal_hook::consts::signal::{SIGINT, SIGTERM};

    let requested = Arc::new(AtomicBool::new(false));
    let pending = Arc::new(AtomicBool::new(false));
    register_interrupts(&[SIGINT, SIGTERM], &requested, &pending)?;
    thread::spawn(move || loop {
        if pending.swap(false, Ordering::SeqCst) {
            eprintln!(
                "{}",
                style("Stopping the runtime; press Ctrl-C again to exit immediately.").dim()
            );
            if tx.send(Message::Interrupt).is_err() {
                break;
            }
        }
        thread::sleep(Duration::from_millis(100));
    });
    Ok(())
}

/// Routes the next console line to a pending confirmation instead of the
/// command parser.
#[derive(Default)]
struct ConsoleAnswers {
    slot: Mutex<AnswerSlot>,
}

#[derive(Default)]
struct AnswerSlot {
    attached: bool,
    pending: Option<Sender<String>>,
}

impl ConsoleAnswers {
    fn attach(&self) {
        self.lock().attached = true;
    }

    /// Dropping the pending sender answers an open question with "no".
    fn detach(&self) {
        let mut slot = self.lock();
        slot.attached = false;
        slot.pending = None;
    }

    /// `None` when no reader owns stdin.
    fn ask(&self) -> Option<Receiver<String>> {
        let mut slot = self.lock();
        if !slot.attached {
            return None;
        }
        let (tx, rx) = mpsc::channel();
        slot.pending = Some(tx);
        Some(rx)
    }

    fn take(&self) -> Option<Sender<String>> {
        self.lock().pending.take()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AnswerSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

const CONSOLE_HELP: &str = "\
Commands:
  status              show the runtime state and update advisory
  start [VERSION]     launch the current (or given) version
  stop                stop the runtime
  check               check for a newer stable release
  releases            list available releases
  install VERSION     download and install a version (or `install latest`)
  kill                terminate a process left over from a previous run
  quit                stop the runtime (after confirmation) and exit";

fn parse_console_line(line: &str) -> std::result::Result<Option<Message>, String> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(None);
    };
    let argument = words.next();
    let version = |text: &str| SemanticVersion::parse(text).map_err(|err| err.to_string());
    let message = match (command, argument) {
        ("status", None) => Message::Status,
        ("start", None) => Message::Launch(None),
        ("start", Some(v)) => Message::Launch(Some(version(v)?)),
        ("stop", None) => Message::Stop,
        ("check", None) => Message::CheckForUpdates,
        ("releases", None) => Message::ListReleases,
        ("install", Some("latest")) => Message::InstallLatest,
        ("install", Some(v)) => Message::Install(version(v)?),
        ("kill", None) => Message::KillLockingProcess,
        ("quit" | "exit", None) => Message::Quit,
        ("help", _) => return Err(CONSOLE_HELP.to_string()),
        _ => return Err(format!("unknown command `{}`; type `help`", line.trim())),
    };
    Ok(Some(message))
}

fn spawn_console_reader(tx: Sender<Message>, answers: Arc<ConsoleAnswers>, json: bool) {
    answers.attach();
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if let Some(reply) = answers.take() {
                let _ = reply.send(line);
                continue;
            }
            match parse_console_line(&line) {
                Ok(Some(message)) => {
                    if tx.send(message).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(text) if json => println!("{}", json!({"notice": text})),
                Err(text) => println!("{text}"),
            }
        }
        answers.detach();
    });
}

fn handle_versions(ctx: &Context) -> Result<()> {
    let cfg = load_config(&ctx.config_path)?;
    let root = resolve_install_root(&cfg);
    let store = InstallStore::new(&root, cfg.release.artifact_name.clone());
    let installed = store.list_installed()?;
    if ctx.json {
        let entries: Vec<serde_json::Value> = installed
            .iter()
            .map(|item| {
                json!({
                    "version": item.version,
                    "pre_release": item.version.is_pre_release(),
                    "path": item.path,
                    "artifact_present": store.artifact_path(&item.version).is_file(),
                })
            })
            .collect();
        return output(ctx, json!({"install_root": root, "versions": entries}));
    }
    if installed.is_empty() {
        println!("No version is installed.");
        return Ok(());
    }
    for item in &installed {
        let mut line = item.version.to_string();
        if !store.artifact_path(&item.version).is_file() {
            line.push_str(&format!(" {}", style("(incomplete)").red()));
        }
        println!("{line}  {}", style(item.path.display()).dim());
    }
    Ok(())
}

fn handle_releases(ctx: &Context) -> Result<()> {
    let launcher = load_launcher(ctx)?;
    let mut orch = build_orchestrator(ctx, &launcher, ConsolePresenter::new(ctx, false));
    orch.prepare()?;
    if !orch.state().network_available {
        return Err(LauncherError::Network(
            "the release feed is not reachable".to_string(),
        ));
    }
    orch.handle(Message::ListReleases)?;
    finish(ctx, &orch, json!({}))
}

fn handle_check(ctx: &Context) -> Result<()> {
    let launcher = load_launcher(ctx)?;
    let mut orch = build_orchestrator(ctx, &launcher, ConsolePresenter::new(ctx, false));
    orch.handle(Message::CheckForUpdates)?;
    let state = orch.state();
    finish(
        ctx,
        &orch,
        json!({
            "network_available": state.network_available,
            "advisory": state.advisory,
            "installed": state.installed,
        }),
    )
}

fn handle_install(ctx: &Context, version: Option<String>, latest: bool) -> Result<()> {
    let message = match version {
        Some(text) if !latest => Message::Install(SemanticVersion::parse(&text)?),
        _ => Message::InstallLatest,
    };
    let launcher = load_launcher(ctx)?;
    let mut orch = build_orchestrator(ctx, &launcher, ConsolePresenter::new(ctx, false));
    orch.prepare()?;
    orch.handle(message)?;
    orch.settle()?;
    let state = orch.state();
    finish(
        ctx,
        &orch,
        json!({"installed": state.installed, "advisory": state.advisory}),
    )
}

/// Remove, reset and kill commands share this path: scan, act, report.
fn handle_mutation(ctx: &Context, message: Message) -> Result<()> {
    let launcher = load_launcher(ctx)?;
    let mut orch = build_orchestrator(ctx, &launcher, ConsolePresenter::new(ctx, false));
    orch.prepare()?;
    orch.handle(message)?;
    let state = orch.state();
    finish(
        ctx,
        &orch,
        json!({"installed": state.installed, "advisory": state.advisory}),
    )
}

fn handle_status(ctx: &Context) -> Result<()> {
    let launcher = load_launcher(ctx)?;
    let orch = build_orchestrator(ctx, &launcher, ConsolePresenter::new(ctx, false));
    let installed = launcher.store.list_installed()?;
    let advisory = advise(&installed, &[]);
    let locking = orch.supervisor().detect_locking_process();
    let lock_path = &orch.supervisor().settings().lock_path;
    output(
        ctx,
        json!({
            "running": locking.is_some(),
            "process": locking,
            "lock_file": lock_path,
            "installed": installed.iter().map(|i| &i.version).collect::<Vec<_>>(),
            "latest_installed": advisory.version(),
            "message": advisory.message(),
        }),
    )
}

fn handle_paths(ctx: &Context) -> Result<()> {
    let cfg = load_config(&ctx.config_path)?;
    let root = resolve_install_root(&cfg);
    output(
        ctx,
        json!({
            "config_path": ctx.config_path,
            "config_exists": ctx.config_path.exists(),
            "install_root": root,
            "lock_file": root.join(supervisor::LOCK_FILE_NAME),
            "managed_runtime_dir": root.join(&cfg.prerequisite.managed_dir),
        }),
    )
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Validate => {
            let _cfg = read_config(&ctx.config_path)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<()> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
