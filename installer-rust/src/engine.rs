//! Transactional install and uninstall runs.
//!
//! An install moves through `Validating -> CopyingFiles -> Registering ->
//! RunningTasks -> Committed`. Every mutation is journaled as it happens;
//! a failure or cancellation before `Committed` rolls the journal back in
//! reverse order and leaves the machine as it was.

use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use semver::Version;
use std::{
    cmp::Ordering as CmpOrdering,
    collections::{BTreeMap, BTreeSet},
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, info, warn};

use crate::{
    config,
    error::{is_locked, InstallError, ValidationError},
    fs_ops, lock,
    locale::Catalog,
    manifest::{FileOp, OverwritePolicy},
    package::Package,
    paths::{self, Layout, Scope},
    record::{self, FileRecord, UninstallRecord, RECORD_FORMAT},
    registration::{self, PlannedWrite, RegistryWrite, RevertOutcome},
    registry::{FileRegistry, RegistryStore},
    shortcuts::{ShortcutMaker, SystemShortcuts},
    tasks::{self, PostInstallAction, TaskWarning},
    template::{DestRoot, Expander},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Validating,
    CopyingFiles,
    Registering,
    RunningTasks,
    Committed,
    RollingBack,
    Uninstalling,
    Done,
}

/// Shared flag checked between steps. Cancelling after `Committed` has no
/// effect.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub enum InstallEvent<'e> {
    Phase(Phase),
    FileDone {
        dest: &'e Path,
        done: usize,
        total: usize,
    },
    Warning(&'e TaskWarning),
}

pub type Observer = dyn Fn(&InstallEvent<'_>) + Sync;

pub trait DiskProbe: Send + Sync {
    fn check_writable(&self, dir: &Path) -> io::Result<()>;
    fn available(&self, dir: &Path) -> Result<u64>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDisk;

impl DiskProbe for SystemDisk {
    fn check_writable(&self, dir: &Path) -> io::Result<()> {
        fs_ops::probe_writable(dir)
    }

    fn available(&self, dir: &Path) -> Result<u64> {
        fs_ops::available_space(dir)
    }
}

/// Machine services the engine mutates.
pub struct Host {
    pub registry: Box<dyn RegistryStore>,
    pub shortcuts: Box<dyn ShortcutMaker>,
    pub disk: Box<dyn DiskProbe>,
}

impl Host {
    pub fn system(state: &Path) -> Self {
        Self {
            registry: Box::new(FileRegistry::open(paths::registry_path(state))),
            shortcuts: Box::new(SystemShortcuts),
            disk: Box::new(SystemDisk),
        }
    }
}

pub struct InstallOptions {
    pub layout: Layout,
    pub scope: Scope,
    pub catalog: Catalog,
    pub tasks: BTreeSet<String>,
    pub allow_downgrade: bool,
    pub copy_attempts: usize,
    pub parallel_copy: bool,
    /// Copied into the install directory as the uninstaller.
    pub uninstaller: Option<PathBuf>,
}

impl InstallOptions {
    pub fn new(layout: Layout, scope: Scope, catalog: Catalog) -> Self {
        Self {
            layout,
            scope,
            catalog,
            tasks: BTreeSet::new(),
            allow_downgrade: false,
            copy_attempts: 3,
            parallel_copy: false,
            uninstaller: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub record_path: PathBuf,
    pub installed: usize,
    pub skipped: usize,
    pub warnings: Vec<TaskWarning>,
    pub upgraded_from: Option<String>,
}

pub fn uninstaller_file_name() -> String {
    format!("uninstall{}", std::env::consts::EXE_SUFFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionRelation {
    Same,
    Older,
    Newer,
    Unknown,
}

/// How `incoming` relates to `installed`.
pub fn compare_versions(installed: &str, incoming: &str) -> VersionRelation {
    if installed.trim() == incoming.trim() {
        return VersionRelation::Same;
    }
    let installed = Version::parse(installed.trim());
    let incoming = Version::parse(incoming.trim());
    match (installed, incoming) {
        (Ok(installed), Ok(incoming)) => match incoming.cmp(&installed) {
            CmpOrdering::Greater => VersionRelation::Newer,
            CmpOrdering::Less => VersionRelation::Older,
            CmpOrdering::Equal => VersionRelation::Same,
        },
        _ => VersionRelation::Unknown,
    }
}

/// Mutations of one run, in the order they happened.
#[derive(Debug, Default)]
struct Journal {
    created_files: Vec<PathBuf>,
    /// (original, backup)
    backups: Vec<(PathBuf, PathBuf)>,
    created_dirs: Vec<PathBuf>,
    /// Keyed by position in the package so parallel copies record in
    /// declaration order.
    files: Vec<(usize, FileRecord)>,
    registry: Vec<RegistryWrite>,
    shortcuts: Vec<PathBuf>,
    uninstaller: Option<PathBuf>,
}

impl Journal {
    fn dirs_outermost_first(&self) -> Vec<PathBuf> {
        let mut dirs = self.created_dirs.clone();
        dirs.sort_by(|a, b| {
            a.components()
                .count()
                .cmp(&b.components().count())
                .then_with(|| a.cmp(b))
        });
        dirs.dedup();
        dirs
    }
}

/// Resolved before anything is touched.
struct Plan {
    previous: Option<UninstallRecord>,
    associations: Vec<(String, Vec<PlannedWrite>)>,
    uninstall_entry: Vec<PlannedWrite>,
    actions: Vec<PostInstallAction>,
    /// (source, destination)
    uninstaller: Option<(PathBuf, PathBuf)>,
}

pub struct Installer<'a> {
    package: &'a Package,
    options: InstallOptions,
    host: &'a Host,
    cancel: CancelToken,
    observer: Option<&'a Observer>,
    phase: Phase,
}

impl<'a> Installer<'a> {
    pub fn new(package: &'a Package, options: InstallOptions, host: &'a Host) -> Self {
        Self {
            package,
            options,
            host,
            cancel: CancelToken::default(),
            observer: None,
            phase: Phase::Idle,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_observer(mut self, observer: &'a Observer) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn set_phase(&mut self, phase: Phase) {
        info!(?phase, app = %self.package.index().app.id, "phase");
        self.phase = phase;
        if let Some(observer) = self.observer {
            observer(&InstallEvent::Phase(phase));
        }
    }

    fn check_cancel(&self) -> Result<(), InstallError> {
        if self.cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }
        Ok(())
    }

    pub fn run(&mut self) -> Result<InstallOutcome, InstallError> {
        let package = self.package;
        let app = &package.index().app;
        let _lock = lock::acquire(&app.id, &self.options.layout.locks_dir())?;

        self.set_phase(Phase::Validating);
        let plan = self.validate()?;
        self.check_cancel()?;

        let mut journal = Journal::default();
        match self.apply(&plan, &mut journal) {
            Ok(outcome) => {
                self.set_phase(Phase::Committed);
                for (_, backup) in &journal.backups {
                    if let Err(err) = fs_ops::remove_file_with_retry(backup, self.options.copy_attempts) {
                        warn!(path = %backup.display(), "backup not removed: {err:#}");
                    }
                }
                info!(
                    app = %app.id,
                    version = %app.version,
                    installed = outcome.installed,
                    skipped = outcome.skipped,
                    "install committed"
                );
                Ok(outcome)
            }
            Err(err) => {
                warn!(app = %app.id, "install failed, rolling back: {err}");
                self.rollback(&journal);
                Err(err)
            }
        }
    }

    fn validate(&self) -> Result<Plan, InstallError> {
        let index = self.package.index();
        let app = &index.app;
        let layout = &self.options.layout;

        let previous = match record::read_record_if_exists(&layout.record_path(&app.id)) {
            Ok(previous) => previous,
            Err(err) => {
                warn!("ignoring unreadable uninstall record: {err:#}");
                None
            }
        };
        if let Some(previous) = &previous {
            let relation = compare_versions(&previous.version, &app.version);
            if relation == VersionRelation::Older && !self.options.allow_downgrade {
                return Err(ValidationError::Downgrade {
                    installed: previous.version.clone(),
                    incoming: app.version.clone(),
                }
                .into());
            }
        }

        let expander = Expander::new(layout, &self.options.catalog);
        let mut associations = Vec::new();
        for rule in &index.associations {
            let writes = registration::apply(rule, &expander).map_err(InstallError::package)?;
            associations.push((rule.program_id.trim().to_string(), writes));
        }
        let actions = tasks::plan(&index.shortcuts, &self.options.tasks, &expander)
            .map_err(InstallError::package)?;

        let uninstaller = self
            .options
            .uninstaller
            .as_ref()
            .map(|src| (src.clone(), layout.app.join(uninstaller_file_name())));
        let command = uninstaller
            .as_ref()
            .map(|(_, dest)| dest.display().to_string())
            .or_else(|| paths::self_path().ok().map(|p| p.display().to_string()))
            .unwrap_or_else(|| "shipwright-installer".to_string());
        let uninstall_string = format!(
            "\"{command}\" uninstall --app-id {} --scope {}",
            app.id, self.options.scope
        );
        let uninstall_entry = registration::uninstall_entry(
            app,
            &layout.app.display().to_string(),
            &uninstall_string,
        );

        let mut required: BTreeMap<DestRoot, u64> = BTreeMap::new();
        required.insert(DestRoot::App, 0);
        for op in &index.files {
            *required.entry(op.dest.root).or_default() += op.size;
        }
        if let Some((src, _)) = &uninstaller {
            let size = fs::metadata(src)
                .map_err(|err| {
                    InstallError::package(format!("uninstaller {}: {err}", src.display()))
                })?
                .len();
            *required.entry(DestRoot::App).or_default() += size;
        }
        for (root, bytes) in &required {
            self.check_dir(layout.root(*root), *bytes)?;
        }
        self.check_dir(&layout.state, 0)?;

        Ok(Plan {
            previous,
            associations,
            uninstall_entry,
            actions,
            uninstaller,
        })
    }

    fn check_dir(&self, dir: &Path, required: u64) -> Result<(), ValidationError> {
        self.host
            .disk
            .check_writable(dir)
            .map_err(|source| ValidationError::PermissionDenied {
                path: dir.to_path_buf(),
                source,
            })?;
        if required == 0 {
            return Ok(());
        }
        match self.host.disk.available(dir) {
            Ok(available) if available < required => Err(ValidationError::InsufficientSpace {
                path: dir.to_path_buf(),
                required,
                available,
            }),
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(path = %dir.display(), "free space unknown: {err:#}");
                Ok(())
            }
        }
    }

    fn apply(&mut self, plan: &Plan, journal: &mut Journal) -> Result<InstallOutcome, InstallError> {
        self.set_phase(Phase::CopyingFiles);
        let (installed, skipped) = self.copy_files(plan, journal)?;
        self.check_cancel()?;

        self.set_phase(Phase::Registering);
        self.register(plan, journal)?;
        self.check_cancel()?;

        self.set_phase(Phase::RunningTasks);
        let (created, warnings) = tasks::execute(&plan.actions, self.host.shortcuts.as_ref());
        journal.shortcuts.extend(created);
        if let Some(observer) = self.observer {
            for warning in &warnings {
                observer(&InstallEvent::Warning(warning));
            }
        }
        self.check_cancel()?;

        let record_path = self.commit(plan, journal)?;
        Ok(InstallOutcome {
            record_path,
            installed,
            skipped,
            warnings,
            upgraded_from: plan.previous.as_ref().map(|p| p.version.clone()),
        })
    }

    fn copy_files(&self, plan: &Plan, journal: &mut Journal) -> Result<(usize, usize), InstallError> {
        let files = &self.package.index().files;
        let ctx = CopyContext {
            package: self.package,
            layout: &self.options.layout,
            attempts: self.options.copy_attempts,
            cancel: &self.cancel,
            journal: Mutex::new(std::mem::take(journal)),
            done: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            total: files.len(),
            observer: self.observer,
        };

        let result = if self.options.parallel_copy {
            files
                .par_iter()
                .enumerate()
                .try_for_each(|(index, op)| ctx.install(index, op))
        } else {
            files
                .iter()
                .enumerate()
                .try_for_each(|(index, op)| ctx.install(index, op))
        };
        let result = result.and_then(|()| match &plan.uninstaller {
            Some((src, dest)) => ctx
                .install_uninstaller(src, dest)
                .map_err(|cause| InstallError::Copy {
                    path: dest.clone(),
                    cause,
                }),
            None => Ok(()),
        });

        let done = ctx.done.load(Ordering::SeqCst);
        let skipped = ctx.skipped.load(Ordering::SeqCst);
        *journal = ctx.journal.into_inner().unwrap_or_else(PoisonError::into_inner);
        result?;
        Ok((done - skipped, skipped))
    }

    fn register(&self, plan: &Plan, journal: &mut Journal) -> Result<(), InstallError> {
        let store = self.host.registry.as_ref();
        let app = &self.package.index().app;
        let perform = |journal: &mut Journal, planned: &PlannedWrite, program_id: Option<&str>| {
            let write = registration::perform(store, planned, program_id).map_err(|cause| {
                InstallError::Registration {
                    key: planned.key.clone(),
                    cause,
                }
            })?;
            journal.registry.push(write);
            Ok::<(), InstallError>(())
        };

        for (program_id, writes) in &plan.associations {
            let claim = registration::claim(&app.id, &app.version, program_id);
            perform(journal, &claim, Some(program_id.as_str()))?;
            for planned in writes {
                self.check_cancel()?;
                perform(journal, planned, Some(program_id.as_str()))?;
            }
        }
        for planned in &plan.uninstall_entry {
            perform(journal, planned, None)?;
        }
        Ok(())
    }

    fn commit(&self, plan: &Plan, journal: &mut Journal) -> Result<PathBuf, InstallError> {
        let app = &self.package.index().app;
        let layout = &self.options.layout;
        let path = layout.record_path(&app.id);

        let mut files = journal.files.clone();
        files.sort_by_key(|(index, _)| *index);
        let mut record = UninstallRecord {
            format: RECORD_FORMAT,
            app_id: app.id.clone(),
            app_name: app.name.clone(),
            version: app.version.clone(),
            publisher: app.publisher.clone(),
            scope: self.options.scope,
            install_root: layout.app.clone(),
            language: self.options.catalog.code().to_string(),
            installed_at_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::from_secs(0))
                .as_secs(),
            installer_version: config::VERSION.to_string(),
            files: files.into_iter().map(|(_, file)| file).collect(),
            dirs: journal.dirs_outermost_first(),
            registry: journal.registry.clone(),
            claims: plan.associations.iter().map(|(id, _)| id.clone()).collect(),
            shortcuts: journal.shortcuts.clone(),
            uninstaller: journal.uninstaller.clone(),
        };
        if let Some(previous) = &plan.previous {
            record.merge_previous(previous);
        }
        record::write_record(&path, &record, self.options.copy_attempts)
            .map_err(|cause| InstallError::Commit {
                path: path.clone(),
                cause,
            })?;
        Ok(path)
    }

    fn rollback(&mut self, journal: &Journal) {
        self.set_phase(Phase::RollingBack);
        let attempts = self.options.copy_attempts;

        for path in journal.shortcuts.iter().rev() {
            if let Err(err) = self.host.shortcuts.remove(path) {
                warn!(path = %path.display(), "rollback: shortcut not removed: {err:#}");
            }
        }
        if let Err(err) = registration::undo(self.host.registry.as_ref(), &journal.registry) {
            warn!("rollback: registry not fully restored: {err:#}");
        }
        for path in journal.created_files.iter().rev() {
            if let Err(err) = fs_ops::remove_file_with_retry(path, attempts) {
                warn!(path = %path.display(), "rollback: file not removed: {err:#}");
            }
        }
        for (original, backup) in journal.backups.iter().rev() {
            if let Err(err) = restore_backup(original, backup, attempts) {
                warn!(path = %original.display(), "rollback: backup not restored: {err:#}");
            }
        }
        for dir in journal.dirs_outermost_first().iter().rev() {
            if let Err(err) = fs_ops::remove_dir_if_empty(dir) {
                warn!(path = %dir.display(), "rollback: directory not removed: {err:#}");
            }
        }
        info!("rollback finished");
    }
}

fn backup_path(dest: &Path) -> Result<PathBuf> {
    let parent = dest.parent().context("dest has no parent")?;
    let name = dest
        .file_name()
        .context("dest has no filename")?
        .to_string_lossy();
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    Ok(parent.join(format!(".{name}.backup-{nonce}")))
}

fn restore_backup(original: &Path, backup: &Path, attempts: usize) -> Result<()> {
    fs_ops::remove_file_with_retry(original, attempts)?;
    fs::rename(backup, original)
        .with_context(|| format!("restore {} -> {}", backup.display(), original.display()))
}

struct CopyContext<'c> {
    package: &'c Package,
    layout: &'c Layout,
    attempts: usize,
    cancel: &'c CancelToken,
    journal: Mutex<Journal>,
    done: AtomicUsize,
    skipped: AtomicUsize,
    total: usize,
    observer: Option<&'c Observer>,
}

impl CopyContext<'_> {
    fn journal(&self) -> MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn install(&self, index: usize, op: &FileOp) -> Result<(), InstallError> {
        if self.cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }
        let dest = op.dest.resolve(self.layout);
        let written = self
            .install_file(index, op, &dest)
            .map_err(|cause| InstallError::Copy {
                path: dest.clone(),
                cause,
            })?;
        if !written {
            self.skipped.fetch_add(1, Ordering::SeqCst);
        }
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(observer) = self.observer {
            observer(&InstallEvent::FileDone {
                dest: &dest,
                done,
                total: self.total,
            });
        }
        Ok(())
    }

    /// Returns false when the existing file is kept.
    fn install_file(&self, index: usize, op: &FileOp, dest: &Path) -> Result<bool> {
        if dest.is_dir() {
            bail!("{} is a directory", dest.display());
        }
        let exists = dest.exists();
        if exists {
            if op.install_once {
                debug!(path = %dest.display(), "shared resource present, skipped");
                return Ok(false);
            }
            match op.overwrite {
                OverwritePolicy::Always => {}
                OverwritePolicy::SkipIfExists => {
                    debug!(path = %dest.display(), "exists, skipped");
                    return Ok(false);
                }
                OverwritePolicy::KeepIfNewer => {
                    if fs_ops::file_mtime_unix(dest)? > op.mtime_unix {
                        debug!(path = %dest.display(), "existing file is newer, kept");
                        return Ok(false);
                    }
                }
            }
        }

        let bytes = self.package.read_payload(op)?;
        self.place(dest, &bytes, exists)?;
        fs_ops::set_mtime_unix(dest, op.mtime_unix)?;
        self.journal().files.push((
            index,
            FileRecord {
                path: dest.to_path_buf(),
                size: bytes.len() as u64,
                sha256: fs_ops::sha256_bytes(&bytes),
                persistent: op.install_once,
            },
        ));
        debug!(path = %dest.display(), size = bytes.len(), "installed");
        Ok(true)
    }

    fn install_uninstaller(&self, src: &Path, dest: &Path) -> Result<()> {
        if src == dest {
            return Ok(());
        }
        if dest.is_dir() {
            bail!("{} is a directory", dest.display());
        }
        let bytes = fs::read(src).with_context(|| format!("read {}", src.display()))?;
        self.place(dest, &bytes, dest.exists())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dest, fs::Permissions::from_mode(0o755))
                .with_context(|| format!("chmod {}", dest.display()))?;
        }
        self.journal().uninstaller = Some(dest.to_path_buf());
        Ok(())
    }

    /// Journals before writing, so rollback also covers a partial write.
    fn place(&self, dest: &Path, bytes: &[u8], exists: bool) -> Result<()> {
        if let Some(parent) = dest.parent() {
            let created = fs_ops::create_dirs_recording(parent)?;
            self.journal().created_dirs.extend(created);
        }
        if exists {
            let backup = backup_path(dest)?;
            fs::rename(dest, &backup)
                .with_context(|| format!("rename {} -> {}", dest.display(), backup.display()))?;
            self.journal().backups.push((dest.to_path_buf(), backup));
        } else {
            self.journal().created_files.push(dest.to_path_buf());
        }
        fs_ops::write_bytes_with_retry(dest, bytes, self.attempts)
    }
}

/// Something uninstall could not remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UninstallFailure {
    pub item: String,
    pub message: String,
    pub remedy_key: &'static str,
}

#[derive(Debug, Clone, Default)]
pub struct UninstallReport {
    pub app_id: String,
    pub app_name: Option<String>,
    /// False when no record existed; nothing was done.
    pub found: bool,
    pub removed_files: usize,
    pub kept_persistent: Vec<PathBuf>,
    /// Changed since install, so left alone.
    pub kept_modified: Vec<PathBuf>,
    pub registry: RevertOutcome,
    pub failures: Vec<UninstallFailure>,
}

impl UninstallReport {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    fn fail(&mut self, item: impl Into<String>, err: &anyhow::Error) {
        let item = item.into();
        let remedy_key = if is_locked(err) {
            "RemedyCloseApp"
        } else {
            "RemedyManualCleanup"
        };
        warn!(item = %item, "not removed: {err:#}");
        self.failures.push(UninstallFailure {
            item,
            message: format!("{err:#}"),
            remedy_key,
        });
    }

    fn absorb(&mut self, outcome: RevertOutcome) {
        self.registry.restored.extend(outcome.restored);
        self.registry.deleted.extend(outcome.deleted);
        self.registry.still_claimed.extend(outcome.still_claimed);
    }
}

/// Removes everything the record of `app_id` lists. Missing items are
/// skipped; a missing record is a successful no-op. The record is kept when
/// anything could not be removed, so a later run can finish the job.
pub fn uninstall(app_id: &str, state: &Path, host: &Host) -> Result<UninstallReport, InstallError> {
    let _lock = lock::acquire(app_id, &paths::locks_dir(state))?;
    let record_path = paths::record_path(state, app_id);
    let mut report = UninstallReport {
        app_id: app_id.to_string(),
        ..UninstallReport::default()
    };

    let record = match record::read_record_if_exists(&record_path) {
        Ok(Some(record)) => record,
        Ok(None) => {
            info!(app = %app_id, "not installed, nothing to do");
            return Ok(report);
        }
        Err(cause) => {
            return Err(InstallError::Record {
                path: record_path,
                cause,
            })
        }
    };
    report.found = true;
    report.app_name = Some(record.app_name.clone());
    info!(phase = ?Phase::Uninstalling, app = %app_id, version = %record.version, "phase");

    for path in &record.shortcuts {
        if let Err(err) = host.shortcuts.remove(path) {
            report.fail(path.display().to_string(), &err);
        }
    }

    revert_registry(&record, host.registry.as_ref(), &mut report);

    for file in &record.files {
        if file.persistent {
            report.kept_persistent.push(file.path.clone());
            continue;
        }
        if !file.path.exists() {
            continue;
        }
        match fs_ops::sha256_file(&file.path) {
            Ok(hash) if hash != file.sha256 => {
                info!(path = %file.path.display(), "modified after install, kept");
                report.kept_modified.push(file.path.clone());
                continue;
            }
            Ok(_) => {}
            Err(err) => {
                report.fail(file.path.display().to_string(), &err);
                continue;
            }
        }
        match fs_ops::remove_file_with_retry(&file.path, 3) {
            Ok(()) => report.removed_files += 1,
            Err(err) => report.fail(file.path.display().to_string(), &err),
        }
    }

    if let Some(uninstaller) = &record.uninstaller {
        // a running executable cannot always delete itself
        if let Err(err) = fs_ops::remove_file_with_retry(uninstaller, 1) {
            warn!(path = %uninstaller.display(), "uninstaller left in place: {err:#}");
        }
    }

    let mut dirs = record.dirs.clone();
    dirs.sort_by_key(|d| d.components().count());
    for dir in dirs.iter().rev() {
        match fs_ops::remove_dir_if_empty(dir) {
            Ok(true) => {}
            Ok(false) => debug!(path = %dir.display(), "directory not empty, kept"),
            Err(err) => warn!(path = %dir.display(), "directory not removed: {err:#}"),
        }
    }

    if report.is_partial() {
        warn!(
            app = %app_id,
            failures = report.failures.len(),
            "uninstall incomplete, record kept"
        );
    } else if let Err(err) = record::remove_record(&record_path) {
        report.fail(record_path.display().to_string(), &err);
    }
    info!(phase = ?Phase::Done, app = %app_id, removed = report.removed_files, "phase");
    Ok(report)
}

fn revert_registry(record: &UninstallRecord, store: &dyn RegistryStore, report: &mut UninstallReport) {
    for program_id in &record.claims {
        let writes: Vec<RegistryWrite> = record
            .registry
            .iter()
            .filter(|w| {
                w.program_id
                    .as_deref()
                    .is_some_and(|id| id.eq_ignore_ascii_case(program_id))
            })
            .cloned()
            .collect();
        match registration::revert(store, &record.app_id, program_id, &writes) {
            Ok(outcome) => report.absorb(outcome),
            Err(err) => report.fail(registration::program_key(program_id), &err),
        }
    }

    let exclusive: Vec<RegistryWrite> = record
        .registry
        .iter()
        .filter(|w| w.program_id.is_none())
        .cloned()
        .collect();
    match registration::revert_exclusive(store, &exclusive) {
        Ok(outcome) => report.absorb(outcome),
        Err(err) => report.fail(registration::uninstall_key(&record.app_id), &err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_versions_orders_semver() {
        assert_eq!(compare_versions("1.0.0", "1.0.0"), VersionRelation::Same);
        assert_eq!(compare_versions("1.0.0", "1.2.0"), VersionRelation::Newer);
        assert_eq!(compare_versions("2.0.0", "1.9.9"), VersionRelation::Older);
        assert_eq!(compare_versions("1.0.0-beta.2", "1.0.0"), VersionRelation::Newer);
        assert_eq!(compare_versions("garbage", "1.0.0"), VersionRelation::Unknown);
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::default();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn journal_orders_dirs_by_depth() {
        let journal = Journal {
            created_dirs: vec![
                PathBuf::from("/a/b/c"),
                PathBuf::from("/a"),
                PathBuf::from("/a/b"),
                PathBuf::from("/a"),
            ],
            ..Journal::default()
        };
        assert_eq!(
            journal.dirs_outermost_first(),
            vec![PathBuf::from("/a"), PathBuf::from("/a/b"), PathBuf::from("/a/b/c")]
        );
    }

    #[test]
    fn restore_backup_puts_original_back() {
        let tmp = tempfile::tempdir().unwrap();
        let original = tmp.path().join("app.cfg");
        fs::write(&original, "old").unwrap();
        let backup = backup_path(&original).unwrap();
        fs::rename(&original, &backup).unwrap();
        fs::write(&original, "new").unwrap();

        restore_backup(&original, &backup, 1).unwrap();
        assert_eq!(fs::read_to_string(&original).unwrap(), "old");
        assert!(!backup.exists());
    }
}
