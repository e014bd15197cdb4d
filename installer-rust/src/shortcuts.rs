use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

use crate::fs_ops;

#[cfg(windows)]
pub const SHORTCUT_EXT: &str = "lnk";
#[cfg(not(windows))]
pub const SHORTCUT_EXT: &str = "desktop";

/// A shortcut to create in `dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortcutSpec {
    pub dir: PathBuf,
    pub name: String,
    pub target: PathBuf,
    pub icon: Option<PathBuf>,
}

impl ShortcutSpec {
    pub fn path(&self) -> Result<PathBuf> {
        shortcut_path(&self.dir, &self.name)
    }
}

pub trait ShortcutMaker: Send + Sync {
    /// Creates or overwrites the shortcut and returns its path.
    fn create(&self, spec: &ShortcutSpec) -> Result<PathBuf>;
    /// Missing shortcuts are not an error.
    fn remove(&self, path: &Path) -> Result<()>;
}

pub fn shortcut_path(dir: &Path, name: &str) -> Result<PathBuf> {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|ch| match ch {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect();
    let cleaned = cleaned.trim_end_matches(['.', ' ']);
    if cleaned.is_empty() {
        bail!("shortcut name is empty");
    }
    Ok(dir.join(format!("{cleaned}.{SHORTCUT_EXT}")))
}

/// Shortcuts native to the running platform.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemShortcuts;

impl ShortcutMaker for SystemShortcuts {
    fn create(&self, spec: &ShortcutSpec) -> Result<PathBuf> {
        let path = spec.path()?;
        std::fs::create_dir_all(&spec.dir)
            .with_context(|| format!("create {}", spec.dir.display()))?;
        write_shortcut(&path, spec)?;
        Ok(path)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        fs_ops::remove_file_with_retry(path, 3)
    }
}

#[cfg(windows)]
fn write_shortcut(lnk_path: &Path, spec: &ShortcutSpec) -> Result<()> {
    use std::process::Command;

    let lnk = ps_quote(&lnk_path.display().to_string());
    let tgt = ps_quote(&spec.target.display().to_string());
    let mut script = format!(
        "$WshShell = New-Object -ComObject WScript.Shell; \
         $Shortcut = $WshShell.CreateShortcut({lnk}); \
         $Shortcut.TargetPath = {tgt}; "
    );
    if let Some(dir) = spec.target.parent() {
        let wd = ps_quote(&dir.display().to_string());
        script.push_str(&format!("$Shortcut.WorkingDirectory = {wd}; "));
    }
    if let Some(icon) = &spec.icon {
        let icon = ps_quote(&icon.display().to_string());
        script.push_str(&format!("$Shortcut.IconLocation = {icon}; "));
    }
    script.push_str("$Shortcut.Save();");

    let status = Command::new("powershell")
        .arg("-NoProfile")
        .arg("-Command")
        .arg(script)
        .status()
        .context("run powershell")?;
    if !status.success() {
        bail!("failed to create shortcut (exit {:?})", status.code());
    }
    Ok(())
}

#[cfg(windows)]
fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(not(windows))]
fn write_shortcut(path: &Path, spec: &ShortcutSpec) -> Result<()> {
    fs_ops::write_bytes_with_retry(path, desktop_entry(spec).as_bytes(), 3)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .with_context(|| format!("chmod {}", path.display()))?;
    }
    Ok(())
}

/// freedesktop.org launcher file.
#[cfg(not(windows))]
fn desktop_entry(spec: &ShortcutSpec) -> String {
    let mut out = String::from("[Desktop Entry]\nType=Application\n");
    out.push_str(&format!("Name={}\n", spec.name.trim()));
    out.push_str(&format!("Exec={}\n", exec_quote(&spec.target.display().to_string())));
    if let Some(dir) = spec.target.parent() {
        out.push_str(&format!("Path={}\n", dir.display()));
    }
    if let Some(icon) = &spec.icon {
        out.push_str(&format!("Icon={}\n", icon.display()));
    }
    out.push_str("Terminal=false\n");
    out
}

#[cfg(not(windows))]
fn exec_quote(value: &str) -> String {
    let escaped: String = value
        .chars()
        .flat_map(|ch| match ch {
            '"' | '`' | '$' | '\\' => vec!['\\', ch],
            ch => vec![ch],
        })
        .collect();
    format!("\"{escaped}\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortcut_path_adds_platform_extension() {
        let base = PathBuf::from("menu");
        let out = shortcut_path(&base, "MyApp").unwrap();
        assert_eq!(out, base.join(format!("MyApp.{SHORTCUT_EXT}")));
    }

    #[test]
    fn shortcut_path_sanitizes_and_rejects_empty_names() {
        let base = PathBuf::from("menu");
        let out = shortcut_path(&base, "My: App?").unwrap();
        assert_eq!(out, base.join(format!("My_ App_.{SHORTCUT_EXT}")));
        let err = shortcut_path(&base, " ").unwrap_err();
        assert!(err.to_string().contains("shortcut name is empty"));
    }

    #[cfg(not(windows))]
    #[test]
    fn creates_and_removes_desktop_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = ShortcutSpec {
            dir: tmp.path().join("desktop"),
            name: "My App".to_string(),
            target: tmp.path().join("app dir").join("app.bin"),
            icon: None,
        };
        let path = SystemShortcuts.create(&spec).unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("[Desktop Entry]"));
        assert!(body.contains("Name=My App"));
        assert!(body.contains("app dir"));

        // overwriting is allowed
        SystemShortcuts.create(&spec).unwrap();

        SystemShortcuts.remove(&path).unwrap();
        assert!(!path.exists());
        SystemShortcuts.remove(&path).unwrap();
    }
}
