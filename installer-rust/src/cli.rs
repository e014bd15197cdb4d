use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::{
    collections::BTreeSet,
    io::{self, IsTerminal, Write},
    path::{Path, PathBuf},
    process::Command as Process,
};
use tracing::{error, info, warn};

use crate::{
    config::Settings,
    engine::{self, Host, InstallOptions, Installer, UninstallReport},
    error::{InstallError, EXIT_USAGE},
    locale::{self, Catalog, LocalizationTable},
    logging, manifest,
    package::{Package, PackageIndex},
    paths::{self, Layout, Locations, Scope},
    prompt::{Prompter, TerminalPrompter, Unattended},
    record,
    tasks::{self, Task},
    template::Expander,
};

#[derive(Debug, Parser)]
#[command(
    name = "shipwright-installer",
    version,
    about = "Installs and removes Shipwright packages",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
    #[command(flatten)]
    pub install: InstallArgs,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Install a package (the default when no subcommand is given)
    Install(InstallArgs),
    /// Remove an installed application
    Uninstall(UninstallArgs),
}

#[derive(Debug, Clone, Default, Args)]
pub struct InstallArgs {
    /// Package archive; defaults to the package embedded in this executable
    #[arg(long)]
    pub package: Option<PathBuf>,
    /// Language tag such as `de` or `en-US`
    #[arg(long = "lang")]
    pub language: Option<String>,
    /// Install directory
    #[arg(long)]
    pub dir: Option<PathBuf>,
    #[arg(long, value_enum)]
    pub scope: Option<Scope>,
    /// Comma separated task ids, replacing the default selection
    #[arg(long, value_delimiter = ',')]
    pub tasks: Option<Vec<String>>,
    /// Accept every default without asking
    #[arg(short, long)]
    pub yes: bool,
    /// Start the application after installing
    #[arg(long, overrides_with = "no_launch")]
    pub launch: bool,
    #[arg(long, overrides_with = "launch")]
    pub no_launch: bool,
    #[arg(long)]
    pub allow_downgrade: bool,
}

#[derive(Debug, Clone, Args)]
pub struct UninstallArgs {
    #[arg(long, value_parser = parse_app_id)]
    pub app_id: String,
    #[arg(long, value_enum)]
    pub scope: Option<Scope>,
    #[arg(short, long)]
    pub yes: bool,
}

fn parse_app_id(raw: &str) -> Result<String, String> {
    manifest::check_app_id(raw)?;
    Ok(raw.to_string())
}

pub type Launcher<'a> = dyn Fn(&Path, &[String]) -> Result<()> + 'a;

/// Everything a run talks to outside the engine.
pub struct Session<'s> {
    pub settings: Settings,
    pub locate: &'s dyn Fn(Scope) -> Result<Locations>,
    pub host: &'s dyn Fn(&Path) -> Host,
    pub prompter: &'s mut dyn Prompter,
    pub out: &'s mut dyn Write,
    /// Copied next to the installed files as the uninstaller.
    pub uninstaller: Option<PathBuf>,
    pub launch: &'s Launcher<'s>,
}

impl Session<'_> {
    fn say(&mut self, line: &str) {
        let _ = writeln!(self.out, "{line}");
    }
}

/// Why a run stopped early.
#[derive(Debug)]
enum Stop {
    Usage(String),
    Install(InstallError),
}

impl From<InstallError> for Stop {
    fn from(err: InstallError) -> Self {
        Stop::Install(err)
    }
}

impl From<anyhow::Error> for Stop {
    fn from(err: anyhow::Error) -> Self {
        Stop::Usage(format!("{err:#}"))
    }
}

pub fn run(cli: Cli) -> u8 {
    let settings = match load_settings() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("{err:#}");
            return EXIT_USAGE;
        }
    };
    let yes = match &cli.command {
        Some(Command::Install(args)) => args.yes,
        Some(Command::Uninstall(args)) => args.yes,
        None => cli.install.yes,
    };

    let mut terminal;
    let mut unattended = Unattended;
    let prompter: &mut dyn Prompter = if !yes && io::stdin().is_terminal() {
        terminal = TerminalPrompter::new(io::stdin().lock(), io::stdout());
        &mut terminal
    } else {
        &mut unattended
    };
    let mut stdout = io::stdout();
    let mut session = Session {
        settings,
        locate: &Locations::resolve,
        host: &Host::system,
        prompter,
        out: &mut stdout,
        uninstaller: paths::self_path().ok(),
        launch: &launch_detached,
    };

    match &cli.command {
        Some(Command::Install(args)) => install(args, &mut session),
        Some(Command::Uninstall(args)) => uninstall(args, &mut session),
        None => install(&cli.install, &mut session),
    }
}

fn load_settings() -> Result<Settings> {
    let exe = paths::self_path()?;
    let dir = exe.parent().unwrap_or(Path::new("."));
    Settings::load(dir)
}

fn launch_detached(target: &Path, args: &[String]) -> Result<()> {
    let mut command = Process::new(target);
    command.args(args);
    if let Some(dir) = target.parent() {
        command.current_dir(dir);
    }
    command
        .spawn()
        .with_context(|| format!("launch {}", target.display()))?;
    Ok(())
}

fn session_catalog() -> Catalog {
    LocalizationTable::engine_languages().select(locale::system_language().as_deref())
}

/// Interactive or unattended install. Returns the process exit code.
pub fn install(args: &InstallArgs, session: &mut Session<'_>) -> u8 {
    let mut catalog = session_catalog();
    match install_steps(args, session, &mut catalog) {
        Ok(()) => 0,
        Err(stop) => finish(session, &catalog, stop),
    }
}

fn install_steps(
    args: &InstallArgs,
    session: &mut Session<'_>,
    catalog: &mut Catalog,
) -> Result<(), Stop> {
    let package = open_package(args.package.as_deref())?;
    let index = package.index();
    let app = &index.app;
    let scope = args
        .scope
        .or(session.settings.default_scope)
        .unwrap_or(app.scope);
    let locations = (session.locate)(scope)?;
    if let Err(err) = logging::init(&locations.state, &session.settings.log_level) {
        eprintln!("logging disabled: {err:#}");
    }
    info!(app = %app.id, version = %app.version, %scope, "setup started");

    *catalog = choose_language(args, session, index)?;
    catalog.set_var("app_name", app.name.as_str());
    catalog.set_var("version", app.version.as_str());
    catalog.set_var("publisher", app.publisher.as_str());
    session.prompter.use_catalog(catalog);
    session.say(&catalog.get("SetupTitle"));

    let dir = choose_dir(args, session, catalog, &locations, index)?;
    catalog.set_var("dir", dir.display().to_string());
    let selected = choose_tasks(args, session, catalog, &index.tasks)?;

    if !session.prompter.confirm(&catalog.get("ReadyPrompt"), true)? {
        return Err(InstallError::Cancelled.into());
    }

    let layout = locations.layout(dir);
    let mut options = InstallOptions::new(layout.clone(), scope, catalog.clone());
    options.tasks = selected;
    options.allow_downgrade = args.allow_downgrade;
    options.copy_attempts = session.settings.copy_attempts;
    options.parallel_copy = session.settings.parallel_copy;
    options.uninstaller = session.uninstaller.clone();

    session.say(&catalog.get("Installing"));
    let host = (session.host)(&locations.state);
    let outcome = Installer::new(&package, options, &host).run()?;
    for warning in &outcome.warnings {
        let path = warning.path.display().to_string();
        session.say(&catalog.format(
            "TaskWarning",
            &[
                ("task", warning.action.as_str()),
                ("path", path.as_str()),
                ("reason", warning.message.as_str()),
            ],
        ));
    }
    session.say(&catalog.get("FinishedInstall"));

    offer_launch(args, session, catalog, &layout, index);
    Ok(())
}

fn open_package(path: Option<&Path>) -> Result<Package, InstallError> {
    match path {
        Some(path) => Package::open(path),
        None => Package::embedded()?.ok_or_else(|| {
            InstallError::package("no package embedded in this executable; pass --package")
        }),
    }
}

fn choose_language(
    args: &InstallArgs,
    session: &mut Session<'_>,
    index: &PackageIndex,
) -> Result<Catalog> {
    let table = index.table();
    let requested = args.language.clone().or_else(locale::system_language);
    if args.language.is_some() || table.languages().len() < 2 {
        return Ok(table.select(requested.as_deref()));
    }
    let names: Vec<String> = table.languages().iter().map(|l| l.name.clone()).collect();
    let default = requested
        .as_deref()
        .and_then(|tag| table.position(tag))
        .unwrap_or(0);
    let question = table.select(requested.as_deref()).get("SelectLanguagePrompt");
    let chosen = session.prompter.choose(&question, &names, default)?;
    let code = table
        .languages()
        .get(chosen)
        .map(|entry| entry.code.clone());
    Ok(table.select(code.as_deref()))
}

/// An earlier install's directory wins over the scope default so upgrades
/// land in place.
fn choose_dir(
    args: &InstallArgs,
    session: &mut Session<'_>,
    catalog: &Catalog,
    locations: &Locations,
    index: &PackageIndex,
) -> Result<PathBuf> {
    let dir = match &args.dir {
        Some(dir) => dir.clone(),
        None => {
            let record_path = paths::record_path(&locations.state, &index.app.id);
            let previous = match record::read_record_if_exists(&record_path) {
                Ok(previous) => previous.map(|r| r.install_root),
                Err(err) => {
                    warn!("ignoring unreadable uninstall record: {err:#}");
                    None
                }
            };
            let default = match previous {
                Some(dir) => dir,
                None => locations.default_install_root(index.app.dir_name())?,
            };
            let answer = session
                .prompter
                .input(&catalog.get("SelectDirPrompt"), &default.display().to_string())?;
            PathBuf::from(answer)
        }
    };
    if dir.is_absolute() {
        return Ok(dir);
    }
    let cwd = std::env::current_dir().context("current directory")?;
    Ok(cwd.join(dir))
}

fn choose_tasks(
    args: &InstallArgs,
    session: &mut Session<'_>,
    catalog: &Catalog,
    all: &[Task],
) -> Result<BTreeSet<String>, Stop> {
    if let Some(list) = &args.tasks {
        let ids: Vec<String> = list
            .iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        return tasks::check_selection(all, &ids).map_err(Stop::Usage);
    }
    let mut selected = tasks::default_selection(all);
    if all.is_empty() || !session.prompter.is_interactive() {
        return Ok(selected);
    }
    session.say(&catalog.get("SelectTasksPrompt"));
    for task in all {
        let wanted = session
            .prompter
            .confirm(&catalog.get(&task.description), task.default_enabled)?;
        if wanted {
            selected.insert(task.id.clone());
        } else {
            selected.remove(&task.id);
        }
    }
    Ok(selected)
}

/// Unattended runs launch only with `--launch`.
fn offer_launch(
    args: &InstallArgs,
    session: &mut Session<'_>,
    catalog: &Catalog,
    layout: &Layout,
    index: &PackageIndex,
) {
    let expander = Expander::new(layout, catalog);
    for entry in &index.run {
        let wanted = if args.no_launch {
            false
        } else if args.launch {
            true
        } else if session.prompter.is_interactive() {
            session
                .prompter
                .confirm(&catalog.get(&entry.description), entry.default_checked)
                .unwrap_or(false)
        } else {
            false
        };
        if !wanted {
            continue;
        }
        let target = match expander.path(&entry.target) {
            Ok(target) => target,
            Err(reason) => {
                warn!(target = %entry.target, "not launched: {reason}");
                continue;
            }
        };
        info!(target = %target.display(), "launching");
        if let Err(err) = (session.launch)(&target, &entry.args) {
            warn!("{err:#}");
            let path = target.display().to_string();
            let reason = format!("{err:#}");
            session.say(&catalog.format(
                "TaskWarning",
                &[
                    ("task", catalog.get(&entry.description).as_str()),
                    ("path", path.as_str()),
                    ("reason", reason.as_str()),
                ],
            ));
        }
    }
}

/// Removes an installed application. Returns the process exit code.
pub fn uninstall(args: &UninstallArgs, session: &mut Session<'_>) -> u8 {
    let mut catalog = session_catalog();
    catalog.set_var("app_id", args.app_id.as_str());
    match uninstall_steps(args, session, &mut catalog) {
        Ok(()) => 0,
        Err(stop) => finish(session, &catalog, stop),
    }
}

fn uninstall_steps(
    args: &UninstallArgs,
    session: &mut Session<'_>,
    catalog: &mut Catalog,
) -> Result<(), Stop> {
    manifest::check_app_id(&args.app_id).map_err(Stop::Usage)?;
    let scope = args
        .scope
        .or(session.settings.default_scope)
        .unwrap_or_default();
    let locations = (session.locate)(scope)?;
    if let Err(err) = logging::init(&locations.state, &session.settings.log_level) {
        eprintln!("logging disabled: {err:#}");
    }
    info!(app = %args.app_id, %scope, "uninstall started");

    let record_path = paths::record_path(&locations.state, &args.app_id);
    let installed = record::read_record_if_exists(&record_path).map_err(|cause| {
        InstallError::Record {
            path: record_path.clone(),
            cause,
        }
    })?;
    let Some(installed) = installed else {
        session.say(&catalog.get("NotInstalled"));
        return Ok(());
    };
    *catalog = LocalizationTable::engine_languages().select(Some(&installed.language));
    catalog.set_var("app_id", args.app_id.as_str());
    catalog.set_var("app_name", installed.app_name.as_str());
    session.prompter.use_catalog(catalog);

    if !args.yes && !session.prompter.confirm(&catalog.get("ConfirmUninstall"), true)? {
        return Err(InstallError::Cancelled.into());
    }

    let host = (session.host)(&locations.state);
    let report = engine::uninstall(&args.app_id, &locations.state, &host)?;
    print_report(session, catalog, &report);
    Ok(())
}

fn print_report(session: &mut Session<'_>, catalog: &Catalog, report: &UninstallReport) {
    if !report.found {
        session.say(&catalog.get("NotInstalled"));
        return;
    }
    if !report.kept_modified.is_empty() {
        let items = join_paths(&report.kept_modified);
        session.say(&catalog.format("UninstallKeptModified", &[("items", items.as_str())]));
    }
    if !report.is_partial() {
        session.say(&catalog.get("UninstallDone"));
        return;
    }
    let items: Vec<&str> = report.failures.iter().map(|f| f.item.as_str()).collect();
    let items = items.join(", ");
    session.say(&catalog.format("UninstallPartial", &[("items", items.as_str())]));
    let remedies: BTreeSet<&str> = report.failures.iter().map(|f| f.remedy_key).collect();
    for remedy in remedies {
        session.say(&catalog.get(remedy));
    }
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn finish(session: &mut Session<'_>, catalog: &Catalog, stop: Stop) -> u8 {
    match stop {
        Stop::Usage(message) => {
            error!("{message}");
            session.say(&message);
            EXIT_USAGE
        }
        Stop::Install(err) => {
            error!("{err}");
            let subject = err.subject().unwrap_or_default();
            session.say(&catalog.format(err.message_key(), &[("subject", subject.as_str())]));
            session.say(&catalog.get(err.remedy_key()));
            err.exit_code()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_invocation_installs() {
        let cli = Cli::try_parse_from([
            "setup",
            "--package",
            "demo.swpkg",
            "--tasks",
            "desktopicon,startmenu",
            "--yes",
            "--no-launch",
        ])
        .unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.install.package, Some(PathBuf::from("demo.swpkg")));
        assert_eq!(
            cli.install.tasks,
            Some(vec!["desktopicon".to_string(), "startmenu".to_string()])
        );
        assert!(cli.install.yes);
        assert!(cli.install.no_launch);
        assert!(!cli.install.launch);
    }

    #[test]
    fn launch_flags_override_each_other() {
        let cli = Cli::try_parse_from(["setup", "--no-launch", "--launch"]).unwrap();
        assert!(cli.install.launch);
        assert!(!cli.install.no_launch);
    }

    #[test]
    fn uninstall_subcommand_parses() {
        let cli = Cli::try_parse_from([
            "uninstall.exe",
            "uninstall",
            "--app-id",
            "com.example.app",
            "--scope",
            "machine",
            "-y",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Uninstall(args)) => {
                assert_eq!(args.app_id, "com.example.app");
                assert_eq!(args.scope, Some(Scope::Machine));
                assert!(args.yes);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn uninstall_requires_app_id() {
        assert!(Cli::try_parse_from(["setup", "uninstall"]).is_err());
    }

    #[test]
    fn uninstall_rejects_app_ids_that_are_not_file_names() {
        for bad in ["../../etc/passwd", "a/b", "..", "App setup"] {
            assert!(
                Cli::try_parse_from(["setup", "uninstall", "--app-id", bad]).is_err(),
                "{bad}"
            );
        }
        assert!(Cli::try_parse_from(["setup", "uninstall", "--app-id", "App_setup-2.x"]).is_ok());
    }

    #[test]
    fn install_errors_render_message_and_remedy() {
        let catalog = LocalizationTable::engine_languages().select(Some("en"));
        let mut out = Vec::new();
        let mut prompter = Unattended;
        let mut session = Session {
            settings: Settings::default(),
            locate: &|_| Err(anyhow::anyhow!("unused")),
            host: &Host::system,
            prompter: &mut prompter,
            out: &mut out,
            uninstaller: None,
            launch: &|_, _| Ok(()),
        };
        let err = InstallError::Validation(crate::error::ValidationError::Downgrade {
            installed: "2.0.0".to_string(),
            incoming: "1.0.0".to_string(),
        });
        let code = finish(&mut session, &catalog, Stop::Install(err));
        assert_eq!(code, crate::error::EXIT_DOWNGRADE);
        let shown = String::from_utf8(out).unwrap();
        assert!(shown.contains("newer version"));
        assert!(shown.contains("--allow-downgrade"));
    }
}
