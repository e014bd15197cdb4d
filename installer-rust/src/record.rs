use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io,
    path::{Path, PathBuf},
};
use tracing::debug;

use crate::{fs_ops, paths::Scope, registration::RegistryWrite};

pub const RECORD_FORMAT: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRecord {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
    /// Install-once resources are left in place on uninstall.
    #[serde(default)]
    pub persistent: bool,
}

/// Everything an install changed, written at commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UninstallRecord {
    pub format: u32,
    pub app_id: String,
    pub app_name: String,
    pub version: String,
    #[serde(default)]
    pub publisher: String,
    pub scope: Scope,
    pub install_root: PathBuf,
    pub language: String,
    pub installed_at_unix: u64,
    #[serde(default)]
    pub installer_version: String,
    #[serde(default)]
    pub files: Vec<FileRecord>,
    /// Directories created by the install, outermost first.
    #[serde(default)]
    pub dirs: Vec<PathBuf>,
    #[serde(default)]
    pub registry: Vec<RegistryWrite>,
    /// Program ids this application claims.
    #[serde(default)]
    pub claims: Vec<String>,
    #[serde(default)]
    pub shortcuts: Vec<PathBuf>,
    #[serde(default)]
    pub uninstaller: Option<PathBuf>,
}

impl UninstallRecord {
    /// Folds the record of an earlier install of the same application into
    /// this one, so that uninstall still returns to the state before the
    /// first install.
    pub fn merge_previous(&mut self, previous: &UninstallRecord) {
        for old in &previous.files {
            match self.files.iter_mut().find(|f| f.path == old.path) {
                Some(current) => current.persistent |= old.persistent,
                None => self.files.push(old.clone()),
            }
        }

        let mut dirs = previous.dirs.clone();
        for dir in self.dirs.drain(..) {
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
        self.dirs = dirs;

        let mut registry: Vec<RegistryWrite> = previous
            .registry
            .iter()
            .filter(|old| !self.registry.iter().any(|new| new.same_slot(old)))
            .cloned()
            .collect();
        for mut write in self.registry.drain(..) {
            if let Some(old) = previous.registry.iter().find(|old| old.same_slot(&write)) {
                write.previous = old.previous.clone();
                write.created_key |= old.created_key;
            }
            registry.push(write);
        }
        self.registry = registry;

        for id in &previous.claims {
            if !self.claims.iter().any(|c| c.eq_ignore_ascii_case(id)) {
                self.claims.push(id.clone());
            }
        }
        for path in &previous.shortcuts {
            if !self.shortcuts.contains(path) {
                self.shortcuts.push(path.clone());
            }
        }
        if self.uninstaller.is_none() {
            self.uninstaller = previous.uninstaller.clone();
        }
    }
}

pub fn read_record(path: &Path) -> Result<UninstallRecord> {
    let s = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&s).with_context(|| format!("parse {}", path.display()))
}

pub fn read_record_if_exists(path: &Path) -> Result<Option<UninstallRecord>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(
            serde_json::from_str(&s).with_context(|| format!("parse {}", path.display()))?,
        )),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

pub fn write_record(path: &Path, record: &UninstallRecord, attempts: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let contents = serde_json::to_string_pretty(record).context("serialize uninstall record")?;
    fs_ops::write_bytes_with_retry(path, contents.as_bytes(), attempts)
}

pub fn remove_record(path: &Path) -> Result<()> {
    fs_ops::remove_file_with_retry(path, 3)?;
    if let Some(parent) = path.parent() {
        match fs_ops::remove_dir_if_empty(parent) {
            Ok(true) => {}
            Ok(false) => debug!(path = %parent.display(), "other records remain"),
            Err(err) => debug!(path = %parent.display(), "record directory kept: {err:#}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(key: &str, data: &str, previous: Option<&str>, created_key: bool) -> RegistryWrite {
        RegistryWrite {
            key: key.to_string(),
            name: String::new(),
            data: data.to_string(),
            previous: previous.map(str::to_string),
            created_key,
            owned: false,
            program_id: Some("App_setup".to_string()),
        }
    }

    fn record(version: &str) -> UninstallRecord {
        UninstallRecord {
            format: RECORD_FORMAT,
            app_id: "App_setup".to_string(),
            app_name: "App".to_string(),
            version: version.to_string(),
            publisher: String::new(),
            scope: Scope::User,
            install_root: PathBuf::from("/sandbox/App"),
            language: "en".to_string(),
            installed_at_unix: 1,
            installer_version: "0.3.0".to_string(),
            files: Vec::new(),
            dirs: Vec::new(),
            registry: Vec::new(),
            claims: Vec::new(),
            shortcuts: Vec::new(),
            uninstaller: None,
        }
    }

    #[test]
    fn write_read_remove_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("uninstall").join("App_setup.json");
        assert!(read_record_if_exists(&path).unwrap().is_none());

        write_record(&path, &record("1.0.0"), 3).unwrap();
        assert_eq!(read_record(&path).unwrap(), record("1.0.0"));

        remove_record(&path).unwrap();
        assert!(!path.exists());
        assert!(!path.parent().unwrap().exists());
    }

    #[test]
    fn remove_record_keeps_directory_shared_with_other_records() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("uninstall");
        let first = dir.join("App_setup.json");
        let second = dir.join("Other_setup.json");
        write_record(&first, &record("1.0.0"), 3).unwrap();
        write_record(&second, &record("2.0.0"), 3).unwrap();

        remove_record(&first).unwrap();
        assert!(!first.exists());
        assert!(second.exists());
        remove_record(&second).unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn merge_keeps_state_from_before_first_install() {
        let mut first = record("1.0.0");
        first.files.push(FileRecord {
            path: PathBuf::from("/sandbox/App/old.dat"),
            size: 1,
            sha256: "a".to_string(),
            persistent: false,
        });
        first.dirs.push(PathBuf::from("/sandbox/App"));
        first.registry.push(write(r"Software\Classes\.proj", "App_setup", Some("Other"), false));
        first.claims.push("App_setup".to_string());

        let mut second = record("1.1.0");
        second.dirs.push(PathBuf::from("/sandbox/App/docs"));
        // the reinstall saw its own earlier value as "previous"
        second.registry.push(write(r"Software\Classes\.PROJ", "App_setup", Some("App_setup"), false));

        second.merge_previous(&first);

        assert_eq!(second.files.len(), 1);
        assert_eq!(
            second.dirs,
            vec![PathBuf::from("/sandbox/App"), PathBuf::from("/sandbox/App/docs")]
        );
        assert_eq!(second.registry.len(), 1);
        assert_eq!(second.registry[0].previous.as_deref(), Some("Other"));
        assert_eq!(second.claims, vec!["App_setup".to_string()]);
    }
}
