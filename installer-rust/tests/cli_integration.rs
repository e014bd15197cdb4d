use anyhow::Result;
use shipwright_installer::{
    cli::{self, InstallArgs, Session, UninstallArgs},
    config::Settings,
    engine::{Host, SystemDisk},
    error::{EXIT_USAGE, EXIT_USER_CANCELLED},
    package,
    paths::{self, Locations, Scope},
    prompt::{Prompter, TerminalPrompter, Unattended},
    registry::FileRegistry,
    shortcuts::{ShortcutMaker, ShortcutSpec},
};
use std::{
    cell::RefCell,
    fs,
    io::{self, Cursor},
    path::{Path, PathBuf},
};

struct FileShortcuts;

impl ShortcutMaker for FileShortcuts {
    fn create(&self, spec: &ShortcutSpec) -> Result<PathBuf> {
        let path = spec.path()?;
        fs::create_dir_all(&spec.dir)?;
        fs::write(&path, spec.target.display().to_string())?;
        Ok(path)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => Ok(other?),
        }
    }
}

/// Shortcuts that can be created but not removed.
struct PinnedShortcuts;

impl ShortcutMaker for PinnedShortcuts {
    fn create(&self, spec: &ShortcutSpec) -> Result<PathBuf> {
        FileShortcuts.create(spec)
    }

    fn remove(&self, _path: &Path) -> Result<()> {
        Err(io::Error::from(io::ErrorKind::PermissionDenied).into())
    }
}

fn host(state: &Path) -> Host {
    Host {
        registry: Box::new(FileRegistry::open(paths::registry_path(state))),
        shortcuts: Box::new(FileShortcuts),
        disk: Box::new(SystemDisk),
    }
}

fn build_artifact(dir: &Path) -> PathBuf {
    fs::create_dir_all(dir.join("build")).unwrap();
    fs::write(dir.join("build").join("app.bin"), "binary").unwrap();
    let manifest = dir.join("setup.toml");
    fs::write(
        &manifest,
        r#"
[app]
id = "App_setup"
name = "App"
version = "1.0.0"
executable = "{app}/app.bin"

[[files]]
source = "build/app.bin"
dest = "{app}"

[[languages]]
code = "en"
name = "English"

[[languages]]
code = "de"
name = "Deutsch"

[[tasks]]
id = "desktopicon"
description = "CreateDesktopIcon"
default_enabled = true

[[tasks]]
id = "startmenu"
description = "CreateProgramMenuEntry"

[[shortcuts]]
name = "App"
target = "{app}/app.bin"
location = "desktop"
task = "desktopicon"

[[shortcuts]]
name = "{cm:UninstallProgram}"
target = "{app}/app.bin"
location = "program-menu"
task = "startmenu"

[[run]]
target = "{app}/app.bin"
description = "LaunchProgram"
"#,
    )
    .unwrap();
    package::build(&manifest, &dir.join("dist"), None).unwrap()
}

struct Run {
    code: u8,
    output: String,
    launched: Vec<PathBuf>,
}

fn run_install(root: &Path, args: &InstallArgs, prompter: &mut dyn Prompter) -> Run {
    let launched = RefCell::new(Vec::new());
    let mut out = Vec::new();
    let code = {
        let locate = |_: Scope| -> Result<Locations> { Ok(Locations::under(root)) };
        let launch = |target: &Path, _args: &[String]| -> Result<()> {
            launched.borrow_mut().push(target.to_path_buf());
            Ok(())
        };
        let mut session = Session {
            settings: Settings::default(),
            locate: &locate,
            host: &host,
            prompter,
            out: &mut out,
            uninstaller: None,
            launch: &launch,
        };
        cli::install(args, &mut session)
    };
    Run {
        code,
        output: String::from_utf8(out).unwrap(),
        launched: launched.into_inner(),
    }
}

fn run_uninstall(root: &Path, args: &UninstallArgs) -> Run {
    run_uninstall_with(root, args, &host)
}

fn run_uninstall_with(root: &Path, args: &UninstallArgs, host: &dyn Fn(&Path) -> Host) -> Run {
    let mut out = Vec::new();
    let mut prompter = Unattended;
    let locate = |_: Scope| -> Result<Locations> { Ok(Locations::under(root)) };
    let code = {
        let mut session = Session {
            settings: Settings::default(),
            locate: &locate,
            host,
            prompter: &mut prompter,
            out: &mut out,
            uninstaller: None,
            launch: &|_, _| Ok(()),
        };
        cli::uninstall(args, &mut session)
    };
    Run {
        code,
        output: String::from_utf8(out).unwrap(),
        launched: Vec::new(),
    }
}

fn scripted(answers: &str) -> TerminalPrompter<Cursor<Vec<u8>>, Vec<u8>> {
    TerminalPrompter::new(Cursor::new(answers.as_bytes().to_vec()), Vec::new())
}

#[test]
fn interactive_install_in_german() {
    let tmp = tempfile::tempdir().unwrap();
    let artifact = build_artifact(&tmp.path().join("src"));
    let root = tmp.path().join("machine");
    let args = InstallArgs {
        package: Some(artifact),
        ..InstallArgs::default()
    };

    // language, directory, two tasks, ready, launch
    let mut prompter = scripted("2\n\n\nj\nja\nn\n");
    let run = run_install(&root, &args, &mut prompter);
    assert_eq!(run.code, 0, "{}", run.output);
    assert!(run.output.contains("App wurde installiert."), "{}", run.output);
    assert!(run.launched.is_empty());

    let locations = Locations::under(&root);
    let app = locations.default_install_root("App").unwrap();
    assert_eq!(fs::read_to_string(app.join("app.bin")).unwrap(), "binary");
    let ext = shipwright_installer::shortcuts::SHORTCUT_EXT;
    assert!(locations.desktop.join(format!("App.{ext}")).exists());
    assert!(locations.programs.join(format!("App deinstallieren.{ext}")).exists());

    let removed = run_uninstall(
        &root,
        &UninstallArgs {
            app_id: "App_setup".to_string(),
            scope: None,
            yes: true,
        },
    );
    assert_eq!(removed.code, 0);
    assert!(
        removed.output.contains("App wurde von Ihrem Computer entfernt."),
        "{}",
        removed.output
    );
    assert!(!app.exists());
}

#[test]
fn unattended_install_launches_only_when_asked() {
    let tmp = tempfile::tempdir().unwrap();
    let artifact = build_artifact(&tmp.path().join("src"));
    let root = tmp.path().join("machine");
    let args = InstallArgs {
        package: Some(artifact),
        language: Some("en".to_string()),
        tasks: Some(Vec::new()),
        yes: true,
        launch: true,
        ..InstallArgs::default()
    };

    let run = run_install(&root, &args, &mut Unattended);
    assert_eq!(run.code, 0, "{}", run.output);
    assert!(run.output.contains("App has been installed."));
    let app = Locations::under(&root).default_install_root("App").unwrap();
    assert_eq!(run.launched, vec![app.join("app.bin")]);
    assert!(!Locations::under(&root).desktop.exists());

    let uninstall = UninstallArgs {
        app_id: "App_setup".to_string(),
        scope: None,
        yes: true,
    };
    let first = run_uninstall(&root, &uninstall);
    assert!(first.output.contains("App was removed from your computer."));
    let second = run_uninstall(&root, &uninstall);
    assert_eq!(second.code, 0);
    assert!(second.output.contains("App_setup"), "{}", second.output);
}

#[test]
fn partial_uninstall_reports_remedy_and_succeeds() {
    let tmp = tempfile::tempdir().unwrap();
    let artifact = build_artifact(&tmp.path().join("src"));
    let root = tmp.path().join("machine");
    let args = InstallArgs {
        package: Some(artifact),
        language: Some("en".to_string()),
        tasks: Some(vec!["desktopicon".to_string()]),
        yes: true,
        ..InstallArgs::default()
    };
    assert_eq!(run_install(&root, &args, &mut Unattended).code, 0);

    let uninstall = UninstallArgs {
        app_id: "App_setup".to_string(),
        scope: None,
        yes: true,
    };
    let pinned = |state: &Path| -> Host {
        Host {
            shortcuts: Box::new(PinnedShortcuts),
            ..host(state)
        }
    };
    let run = run_uninstall_with(&root, &uninstall, &pinned);
    assert_eq!(run.code, 0, "{}", run.output);
    assert!(run.output.contains("Some items could not be removed"), "{}", run.output);
    assert!(run.output.contains("Close the application and retry."), "{}", run.output);
    let state = Locations::under(&root).state;
    assert!(paths::record_path(&state, "App_setup").exists());

    let retry = run_uninstall(&root, &uninstall);
    assert_eq!(retry.code, 0);
    assert!(retry.output.contains("App was removed from your computer."), "{}", retry.output);
    assert!(!paths::record_path(&state, "App_setup").exists());
}

#[test]
fn declining_the_ready_prompt_changes_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let artifact = build_artifact(&tmp.path().join("src"));
    let root = tmp.path().join("machine");
    let args = InstallArgs {
        package: Some(artifact),
        ..InstallArgs::default()
    };

    let mut prompter = scripted("1\n\n\n\nn\n");
    let run = run_install(&root, &args, &mut prompter);
    assert_eq!(run.code, EXIT_USER_CANCELLED);
    assert!(run.output.contains("Setup was cancelled"), "{}", run.output);
    let app = Locations::under(&root).default_install_root("App").unwrap();
    assert!(!app.exists());
}

#[test]
fn uninstall_refuses_ids_outside_the_record_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("machine");
    let state = Locations::under(&root).state;
    let outside = state.join("victim.json");
    fs::create_dir_all(&state).unwrap();
    fs::write(&outside, "{}").unwrap();

    let run = run_uninstall(
        &root,
        &UninstallArgs {
            app_id: "../victim".to_string(),
            scope: None,
            yes: true,
        },
    );
    assert_eq!(run.code, EXIT_USAGE);
    assert!(run.output.contains("only ASCII letters"), "{}", run.output);
    assert_eq!(fs::read_to_string(&outside).unwrap(), "{}");
}

#[test]
fn unknown_task_is_a_usage_error() {
    let tmp = tempfile::tempdir().unwrap();
    let artifact = build_artifact(&tmp.path().join("src"));
    let args = InstallArgs {
        package: Some(artifact),
        language: Some("en".to_string()),
        tasks: Some(vec!["desktopicon".to_string(), "nope".to_string()]),
        yes: true,
        ..InstallArgs::default()
    };
    let run = run_install(&tmp.path().join("machine"), &args, &mut Unattended);
    assert_eq!(run.code, EXIT_USAGE);
    assert!(run.output.contains("unknown task `nope`"), "{}", run.output);
}

#[test]
fn unreadable_package_is_reported_with_remedy() {
    let tmp = tempfile::tempdir().unwrap();
    let bogus = tmp.path().join("broken.zip");
    fs::write(&bogus, "not a zip").unwrap();
    let args = InstallArgs {
        package: Some(bogus),
        yes: true,
        ..InstallArgs::default()
    };
    let run = run_install(&tmp.path().join("machine"), &args, &mut Unattended);
    assert_eq!(run.code, EXIT_USAGE);
    assert!(
        run.output.contains("Download the setup package again")
            || run.output.contains("Laden Sie das Setup-Paket erneut herunter"),
        "{}",
        run.output
    );
}
