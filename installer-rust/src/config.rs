use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fs, path::Path};

use crate::paths::Scope;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const SETTINGS_FILE: &str = "shipwright.toml";
pub const LOG_ENV: &str = "SHIPWRIGHT_LOG";
pub const PARALLEL_COPY_ENV: &str = "SHIPWRIGHT_PARALLEL_COPY";

/// Installer settings, read from `shipwright.toml` next to the installer
/// executable. Every field is optional.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub log_level: String,
    pub copy_attempts: usize,
    pub parallel_copy: bool,
    /// Overrides the package's default scope when `--scope` is not given.
    pub default_scope: Option<Scope>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            copy_attempts: 3,
            parallel_copy: false,
            default_scope: None,
        }
    }
}

impl Settings {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(SETTINGS_FILE);
        let mut settings = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("read {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parse {}", path.display()))?
        } else {
            Settings::default()
        };
        settings.apply_overrides(|name| std::env::var(name).ok());
        Ok(settings)
    }

    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(level) = var(LOG_ENV).filter(|v| !v.trim().is_empty()) {
            self.log_level = level.trim().to_string();
        }
        if let Some(flag) = var(PARALLEL_COPY_ENV) {
            match flag.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.parallel_copy = true,
                "0" | "false" | "no" | "off" => self.parallel_copy = false,
                _ => {}
            }
        }
        self.copy_attempts = self.copy_attempts.max(1);
    }
}
