//! Optional post-install actions and their gating.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, path::PathBuf};
use tracing::{info, warn};

use crate::{
    shortcuts::{ShortcutMaker, ShortcutSpec},
    template::Expander,
};

/// A checkbox shown before installing. Lives for one run only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Task {
    pub id: String,
    /// Message key.
    pub description: String,
    #[serde(default)]
    pub default_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShortcutLocation {
    Desktop,
    ProgramMenu,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Shortcut {
    /// Display name; may reference messages with `{cm:Key}`.
    pub name: String,
    pub target: String,
    pub location: ShortcutLocation,
    /// Created only when this task is selected. Ungated shortcuts always are.
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

/// "Launch now" offered on the final page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RunEntry {
    pub target: String,
    /// Message key.
    pub description: String,
    #[serde(default = "default_true")]
    pub default_checked: bool,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostInstallAction {
    pub task: Option<String>,
    pub shortcut: ShortcutSpec,
}

/// A post-install action that failed. Never fails the install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskWarning {
    pub action: String,
    pub path: PathBuf,
    pub message: String,
}

pub fn default_selection(tasks: &[Task]) -> BTreeSet<String> {
    tasks
        .iter()
        .filter(|task| task.default_enabled)
        .map(|task| task.id.clone())
        .collect()
}

/// Rejects ids that name no task.
pub fn check_selection(tasks: &[Task], selected: &[String]) -> Result<BTreeSet<String>, String> {
    let mut out = BTreeSet::new();
    for id in selected {
        let id = id.trim();
        if id.is_empty() {
            continue;
        }
        let task = tasks
            .iter()
            .find(|task| task.id.eq_ignore_ascii_case(id))
            .ok_or_else(|| format!("unknown task `{id}`"))?;
        out.insert(task.id.clone());
    }
    Ok(out)
}

/// Post-install actions for `selected`, in declaration order.
pub fn plan(
    shortcuts: &[Shortcut],
    selected: &BTreeSet<String>,
    expander: &Expander<'_>,
) -> Result<Vec<PostInstallAction>, String> {
    let mut actions = Vec::new();
    for shortcut in shortcuts {
        if let Some(task) = &shortcut.task {
            let task = task.trim();
            if !selected.iter().any(|id| id.eq_ignore_ascii_case(task)) {
                continue;
            }
        }
        let dir = match shortcut.location {
            ShortcutLocation::Desktop => expander.layout.desktop.clone(),
            ShortcutLocation::ProgramMenu => expander.layout.programs.clone(),
        };
        let icon = match &shortcut.icon {
            Some(icon) => Some(expander.path(icon)?),
            None => None,
        };
        actions.push(PostInstallAction {
            task: shortcut.task.clone(),
            shortcut: ShortcutSpec {
                dir,
                name: expander.text(&shortcut.name)?,
                target: expander.path(&shortcut.target)?,
                icon,
            },
        });
    }
    Ok(actions)
}

/// Runs every action; failures become warnings. Returns the shortcuts that
/// were created.
pub fn execute(
    actions: &[PostInstallAction],
    maker: &dyn ShortcutMaker,
) -> (Vec<PathBuf>, Vec<TaskWarning>) {
    let mut created = Vec::new();
    let mut warnings = Vec::new();
    for action in actions {
        let label = action
            .task
            .clone()
            .unwrap_or_else(|| action.shortcut.name.clone());
        match maker.create(&action.shortcut) {
            Ok(path) => {
                info!(path = %path.display(), "shortcut created");
                created.push(path);
            }
            Err(err) => {
                let path = action
                    .shortcut
                    .path()
                    .unwrap_or_else(|_| action.shortcut.dir.clone());
                warn!(task = %label, path = %path.display(), "shortcut failed: {err:#}");
                warnings.push(TaskWarning {
                    action: label,
                    path,
                    message: format!("{err:#}"),
                });
            }
        }
    }
    (created, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{locale::LocalizationTable, paths::Locations};
    use anyhow::bail;
    use std::path::Path;

    fn tasks() -> Vec<Task> {
        vec![
            Task {
                id: "desktopicon".to_string(),
                description: "CreateDesktopIcon".to_string(),
                default_enabled: false,
            },
            Task {
                id: "menuentry".to_string(),
                description: "CreateProgramMenuEntry".to_string(),
                default_enabled: true,
            },
        ]
    }

    fn shortcuts() -> Vec<Shortcut> {
        vec![
            Shortcut {
                name: "App".to_string(),
                target: "{app}/app.bin".to_string(),
                location: ShortcutLocation::Desktop,
                task: Some("desktopicon".to_string()),
                icon: None,
            },
            Shortcut {
                name: "{cm:UninstallProgram}".to_string(),
                target: "{app}/uninstall.bin".to_string(),
                location: ShortcutLocation::ProgramMenu,
                task: None,
                icon: Some("{app}/app.bin".to_string()),
            },
        ]
    }

    #[test]
    fn default_and_checked_selection() {
        let tasks = tasks();
        assert_eq!(
            default_selection(&tasks).into_iter().collect::<Vec<_>>(),
            vec!["menuentry".to_string()]
        );
        let picked = check_selection(&tasks, &["DesktopIcon".to_string()]).unwrap();
        assert!(picked.contains("desktopicon"));
        assert!(check_selection(&tasks, &["quicklaunch".to_string()]).is_err());
    }

    #[test]
    fn plan_gates_shortcuts_on_selected_tasks() {
        let layout = Locations::under(Path::new("/sandbox")).layout(PathBuf::from("/sandbox/App"));
        let mut catalog = LocalizationTable::builtin_only().select(None);
        catalog.set_var("app_name", "App");
        let expander = Expander::new(&layout, &catalog);

        let none = plan(&shortcuts(), &BTreeSet::new(), &expander).unwrap();
        assert_eq!(none.len(), 1);
        assert_eq!(none[0].shortcut.dir, layout.programs);
        assert_eq!(none[0].shortcut.name, "Uninstall App");

        let selected: BTreeSet<_> = ["desktopicon".to_string()].into_iter().collect();
        let both = plan(&shortcuts(), &selected, &expander).unwrap();
        assert_eq!(both.len(), 2);
        assert_eq!(both[0].shortcut.dir, layout.desktop);
        assert_eq!(both[0].shortcut.target, layout.app.join("app.bin"));
    }

    #[test]
    fn task_gate_ignores_case() {
        let layout = Locations::under(Path::new("/sandbox")).layout(PathBuf::from("/sandbox/App"));
        let catalog = LocalizationTable::builtin_only().select(None);
        let expander = Expander::new(&layout, &catalog);
        let mut gated = shortcuts();
        gated[0].task = Some("DesktopIcon".to_string());

        let selected = check_selection(&tasks(), &["desktopicon".to_string()]).unwrap();
        let actions = plan(&gated[..1], &selected, &expander).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].shortcut.dir, layout.desktop);
    }

    struct Failing;

    impl ShortcutMaker for Failing {
        fn create(&self, _spec: &ShortcutSpec) -> Result<PathBuf> {
            bail!("desktop is read-only")
        }

        fn remove(&self, _path: &Path) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failures_become_warnings() {
        let action = PostInstallAction {
            task: Some("desktopicon".to_string()),
            shortcut: ShortcutSpec {
                dir: PathBuf::from("/sandbox/desktop"),
                name: "App".to_string(),
                target: PathBuf::from("/sandbox/App/app.bin"),
                icon: None,
            },
        };
        let (created, warnings) = execute(&[action], &Failing);
        assert!(created.is_empty());
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].action, "desktopicon");
        assert!(warnings[0].message.contains("read-only"));
    }
}
