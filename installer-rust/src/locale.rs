use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Messages = BTreeMap<String, String>;

const BUILTIN_EN: &str = include_str!("../lang/en.toml");
const BUILTIN_DE: &str = include_str!("../lang/de.toml");

pub const DEFAULT_LANGUAGE: &str = "en";

/// One selectable language and the package's messages for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LanguageEntry {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub messages: Messages,
}

impl LanguageEntry {
    pub fn english() -> Self {
        Self {
            code: DEFAULT_LANGUAGE.to_string(),
            name: "English".to_string(),
            messages: Messages::new(),
        }
    }
}

/// Engine messages shipped with the installer, layered under the package's.
pub fn builtin_messages(code: &str) -> Option<Messages> {
    let raw = match primary_subtag(&normalize_tag(code)) {
        "en" => BUILTIN_EN,
        "de" => BUILTIN_DE,
        _ => return None,
    };
    toml::from_str(raw).ok()
}

/// `de_DE.UTF-8` -> `de-de`
pub fn normalize_tag(tag: &str) -> String {
    let tag = tag.split(['.', '@']).next().unwrap_or_default();
    tag.trim().replace('_', "-").to_ascii_lowercase()
}

fn primary_subtag(tag: &str) -> &str {
    tag.split('-').next().unwrap_or(tag)
}

/// Language of the current session as reported by the environment.
pub fn system_language() -> Option<String> {
    ["LC_ALL", "LC_MESSAGES", "LANG"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|value| normalize_tag(&value))
        .find(|tag| !tag.is_empty() && tag != "c" && tag != "posix")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalizationTable {
    entries: Vec<LanguageEntry>,
}

impl LocalizationTable {
    /// The first entry is the default language. An empty list falls back to
    /// the built-in English catalog.
    pub fn new(entries: Vec<LanguageEntry>) -> Self {
        if entries.is_empty() {
            return Self::builtin_only();
        }
        Self { entries }
    }

    pub fn builtin_only() -> Self {
        Self {
            entries: vec![LanguageEntry::english()],
        }
    }

    /// Every language with a built-in catalog. Used when no package is at
    /// hand, e.g. while uninstalling.
    pub fn engine_languages() -> Self {
        Self {
            entries: vec![
                LanguageEntry::english(),
                LanguageEntry {
                    code: "de".to_string(),
                    name: "Deutsch".to_string(),
                    messages: Messages::new(),
                },
            ],
        }
    }

    pub fn languages(&self) -> &[LanguageEntry] {
        &self.entries
    }

    pub fn default_entry(&self) -> &LanguageEntry {
        &self.entries[0]
    }

    /// Exact tag first, then the primary subtag (`de-AT` finds `de`).
    pub fn find(&self, requested: &str) -> Option<&LanguageEntry> {
        let wanted = normalize_tag(requested);
        if wanted.is_empty() {
            return None;
        }
        self.entries
            .iter()
            .find(|entry| normalize_tag(&entry.code) == wanted)
            .or_else(|| {
                let primary = primary_subtag(&wanted);
                self.entries
                    .iter()
                    .find(|entry| primary_subtag(&normalize_tag(&entry.code)) == primary)
            })
    }

    pub fn position(&self, requested: &str) -> Option<usize> {
        let found = self.find(requested)?;
        self.entries.iter().position(|entry| entry == found)
    }

    /// Picks the active catalog. Unknown or missing tags always yield the
    /// default entry.
    pub fn select(&self, requested: Option<&str>) -> Catalog {
        let default = self.default_entry();
        let entry = requested
            .and_then(|tag| self.find(tag))
            .unwrap_or(default);

        let mut active = builtin_messages(&entry.code).unwrap_or_default();
        active.extend(entry.messages.clone());

        let mut fallback = builtin_messages(DEFAULT_LANGUAGE).unwrap_or_default();
        fallback.extend(builtin_messages(&default.code).unwrap_or_default());
        fallback.extend(default.messages.clone());

        Catalog {
            code: entry.code.clone(),
            active,
            fallback,
            vars: BTreeMap::new(),
        }
    }

    /// True when `key` resolves in the default language.
    pub fn knows(&self, key: &str) -> bool {
        let default = self.default_entry();
        default.messages.contains_key(key)
            || builtin_messages(&default.code).is_some_and(|m| m.contains_key(key))
            || builtin_messages(DEFAULT_LANGUAGE).is_some_and(|m| m.contains_key(key))
    }
}

/// Messages of the language chosen for this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    code: String,
    active: Messages,
    fallback: Messages,
    vars: BTreeMap<String, String>,
}

impl Catalog {
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Session-wide placeholder such as `app_name`, applied to every message.
    pub fn set_var(&mut self, name: &str, value: impl Into<String>) {
        self.vars.insert(name.to_string(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.active.contains_key(key) || self.fallback.contains_key(key)
    }

    /// Unknown keys render as themselves so a missing translation never
    /// hides a message.
    pub fn get(&self, key: &str) -> String {
        self.format(key, &[])
    }

    pub fn format(&self, key: &str, args: &[(&str, &str)]) -> String {
        let raw = self
            .active
            .get(key)
            .or_else(|| self.fallback.get(key))
            .map(String::as_str)
            .unwrap_or(key);
        let mut out = raw.to_string();
        for (name, value) in args {
            out = out.replace(&format!("{{{name}}}"), value);
        }
        for (name, value) in &self.vars {
            out = out.replace(&format!("{{{name}}}"), value);
        }
        out
    }
}
