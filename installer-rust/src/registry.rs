//! Registry-like key/value store holding file associations, ownership claims
//! and uninstall entries.
//!
//! Keys are backslash-separated paths compared case-insensitively. A key
//! exists when it has been written or any key below it has.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use crate::fs_ops;

pub type Values = BTreeMap<String, String>;

pub trait RegistryStore: Send + Sync {
    fn key_exists(&self, key: &str) -> Result<bool>;
    fn get(&self, key: &str, name: &str) -> Result<Option<String>>;
    /// Creates the key if needed.
    fn set(&self, key: &str, name: &str, data: &str) -> Result<()>;
    fn delete_value(&self, key: &str, name: &str) -> Result<()>;
    /// Removes the key and everything below it.
    fn delete_key(&self, key: &str) -> Result<()>;
    fn values(&self, key: &str) -> Result<Values>;
    /// No values and no subkeys.
    fn is_empty(&self, key: &str) -> Result<bool>;
}

fn fold(key: &str) -> String {
    key.trim_matches('\\').to_ascii_lowercase()
}

fn is_below(candidate: &str, key: &str) -> bool {
    candidate
        .strip_prefix(key)
        .is_some_and(|rest| rest.starts_with('\\'))
}

/// In-memory hive, shared by the file-backed store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hive {
    keys: BTreeMap<String, Values>,
}

impl Hive {
    pub fn key_exists(&self, key: &str) -> bool {
        let key = fold(key);
        self.keys.contains_key(&key) || self.keys.keys().any(|k| is_below(k, &key))
    }

    pub fn get(&self, key: &str, name: &str) -> Option<String> {
        self.keys
            .get(&fold(key))
            .and_then(|values| values.get(&name.to_ascii_lowercase()))
            .cloned()
    }

    pub fn set(&mut self, key: &str, name: &str, data: &str) {
        self.keys
            .entry(fold(key))
            .or_default()
            .insert(name.to_ascii_lowercase(), data.to_string());
    }

    pub fn delete_value(&mut self, key: &str, name: &str) {
        if let Some(values) = self.keys.get_mut(&fold(key)) {
            values.remove(&name.to_ascii_lowercase());
        }
    }

    pub fn delete_key(&mut self, key: &str) {
        let key = fold(key);
        self.keys.retain(|k, _| k != &key && !is_below(k, &key));
    }

    pub fn values(&self, key: &str) -> Values {
        self.keys.get(&fold(key)).cloned().unwrap_or_default()
    }

    pub fn is_empty(&self, key: &str) -> bool {
        let key = fold(key);
        let no_values = self.keys.get(&key).map_or(true, |v| v.is_empty());
        no_values && !self.keys.keys().any(|k| is_below(k, &key))
    }
}

/// A hive persisted as JSON. Every mutation is a read-modify-write with an
/// atomic replace.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    path: PathBuf,
    attempts: usize,
}

impl FileRegistry {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            attempts: 3,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Hive> {
        if !self.path.exists() {
            return Ok(Hive::default());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse {}", self.path.display()))
    }

    fn save(&self, hive: &Hive) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(hive).context("serialize registry")?;
        fs_ops::write_bytes_with_retry(&self.path, contents.as_bytes(), self.attempts)
    }

    fn update(&self, op: impl FnOnce(&mut Hive)) -> Result<()> {
        let mut hive = self.load()?;
        op(&mut hive);
        self.save(&hive)
    }
}

impl RegistryStore for FileRegistry {
    fn key_exists(&self, key: &str) -> Result<bool> {
        Ok(self.load()?.key_exists(key))
    }

    fn get(&self, key: &str, name: &str) -> Result<Option<String>> {
        Ok(self.load()?.get(key, name))
    }

    fn set(&self, key: &str, name: &str, data: &str) -> Result<()> {
        self.update(|hive| hive.set(key, name, data))
    }

    fn delete_value(&self, key: &str, name: &str) -> Result<()> {
        self.update(|hive| hive.delete_value(key, name))
    }

    fn delete_key(&self, key: &str) -> Result<()> {
        self.update(|hive| hive.delete_key(key))
    }

    fn values(&self, key: &str) -> Result<Values> {
        Ok(self.load()?.values(key))
    }

    fn is_empty(&self, key: &str) -> Result<bool> {
        Ok(self.load()?.is_empty(key))
    }
}
