//! Destination and text templates.
//!
//! Paths in a manifest start with a root token (`{app}`, `{fonts}`,
//! `{desktop}`, `{programs}`) followed by a `/`-separated relative path.
//! Free text may additionally reference catalog messages with `{cm:Key}`.

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Component, Path, PathBuf},
};

use crate::{locale::Catalog, paths::Layout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestRoot {
    App,
    Fonts,
    Desktop,
    Programs,
}

impl DestRoot {
    pub const ALL: [DestRoot; 4] = [
        DestRoot::App,
        DestRoot::Fonts,
        DestRoot::Desktop,
        DestRoot::Programs,
    ];

    pub fn token(self) -> &'static str {
        match self {
            DestRoot::App => "app",
            DestRoot::Fonts => "fonts",
            DestRoot::Desktop => "desktop",
            DestRoot::Programs => "programs",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|root| root.token() == token)
    }
}

/// A destination below one of the well-known roots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawDestPath")]
pub struct DestPath {
    pub root: DestRoot,
    /// `/`-separated, never absolute, never containing `..`.
    pub rel: String,
}

/// Wire form of [`DestPath`]; `rel` is re-normalized on load.
#[derive(Deserialize)]
struct RawDestPath {
    root: DestRoot,
    rel: String,
}

impl TryFrom<RawDestPath> for DestPath {
    type Error = String;

    fn try_from(raw: RawDestPath) -> Result<Self, Self::Error> {
        Ok(Self {
            root: raw.root,
            rel: normalize_rel(&raw.rel)?,
        })
    }
}

impl DestPath {
    pub fn parse(template: &str) -> Result<Self, String> {
        let trimmed = template.trim();
        let rest = trimmed
            .strip_prefix('{')
            .ok_or_else(|| format!("`{trimmed}` must start with a root such as {{app}}"))?;
        let (token, rel) = rest
            .split_once('}')
            .ok_or_else(|| format!("`{trimmed}` has an unterminated root"))?;
        let root = DestRoot::from_token(token)
            .ok_or_else(|| format!("unknown destination root {{{token}}}"))?;
        let rel = normalize_rel(rel)?;
        Ok(Self { root, rel })
    }

    pub fn join(&self, name: &str) -> Result<Self, String> {
        let extra = normalize_rel(name)?;
        let rel = match (self.rel.is_empty(), extra.is_empty()) {
            (true, _) => extra,
            (false, true) => self.rel.clone(),
            (false, false) => format!("{}/{}", self.rel, extra),
        };
        Ok(Self {
            root: self.root,
            rel,
        })
    }

    pub fn resolve(&self, layout: &Layout) -> PathBuf {
        let mut out = layout.root(self.root).to_path_buf();
        for part in self.rel.split('/').filter(|p| !p.is_empty()) {
            out.push(part);
        }
        out
    }

    /// Collision key: file systems on the main target are case-insensitive.
    pub fn key(&self) -> String {
        format!("{}/{}", self.root.token(), self.rel.to_lowercase())
    }
}

impl fmt::Display for DestPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rel.is_empty() {
            write!(f, "{{{}}}", self.root.token())
        } else {
            write!(f, "{{{}}}/{}", self.root.token(), self.rel)
        }
    }
}

fn normalize_rel(rel: &str) -> Result<String, String> {
    let rel = rel.replace('\\', "/");
    let mut parts = Vec::new();
    for component in Path::new(&rel).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(format!("`{rel}` must stay inside its root"));
            }
        }
    }
    Ok(parts.join("/"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token<'a> {
    Text(&'a str),
    Root(DestRoot),
    Message(&'a str),
}

fn tokenize(text: &str) -> Result<Vec<Token<'_>>, String> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find('{') {
        if start > 0 {
            out.push(Token::Text(&rest[..start]));
        }
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| format!("unterminated `{{` in `{text}`"))?;
        let name = &after[..end];
        if let Some(key) = name.strip_prefix("cm:") {
            if key.is_empty() {
                return Err(format!("empty message reference in `{text}`"));
            }
            out.push(Token::Message(key));
        } else {
            let root = DestRoot::from_token(name)
                .ok_or_else(|| format!("unknown constant {{{name}}} in `{text}`"))?;
            out.push(Token::Root(root));
        }
        rest = &after[end + 1..];
    }
    if !rest.is_empty() {
        out.push(Token::Text(rest));
    }
    Ok(out)
}

/// Message keys referenced by `{cm:...}` in `text`.
pub fn message_refs(text: &str) -> Result<Vec<String>, String> {
    Ok(tokenize(text)?
        .into_iter()
        .filter_map(|token| match token {
            Token::Message(key) => Some(key.to_string()),
            _ => None,
        })
        .collect())
}

/// Resolves templates for one install run.
#[derive(Debug, Clone, Copy)]
pub struct Expander<'a> {
    pub layout: &'a Layout,
    pub catalog: &'a Catalog,
}

impl<'a> Expander<'a> {
    pub fn new(layout: &'a Layout, catalog: &'a Catalog) -> Self {
        Self { layout, catalog }
    }

    /// Expands constants and message references. Path segments following a
    /// root constant get native separators.
    pub fn text(&self, template: &str) -> Result<String, String> {
        let mut out = String::new();
        let mut native_run = false;
        for token in tokenize(template)? {
            match token {
                Token::Root(root) => {
                    out.push_str(&self.layout.root(root).display().to_string());
                    native_run = true;
                }
                Token::Message(key) => {
                    out.push_str(&self.catalog.get(key));
                    native_run = false;
                }
                Token::Text(text) if native_run => {
                    let cut = text
                        .find(|c: char| c.is_whitespace() || c == '"' || c == ',')
                        .unwrap_or(text.len());
                    out.push_str(&text[..cut].replace('/', std::path::MAIN_SEPARATOR_STR));
                    out.push_str(&text[cut..]);
                    native_run = false;
                }
                Token::Text(text) => out.push_str(text),
            }
        }
        Ok(out)
    }

    pub fn path(&self, template: &str) -> Result<PathBuf, String> {
        Ok(DestPath::parse(template)?.resolve(self.layout))
    }
}
