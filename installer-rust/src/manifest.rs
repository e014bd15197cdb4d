//! The declarative input document and its expansion into concrete file
//! operations.

use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};
use walkdir::WalkDir;

use crate::{
    error::ManifestError,
    paths::Scope,
    registration::AssociationRule,
    tasks::{RunEntry, Shortcut, Task},
    template::{DestPath, DestRoot},
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AppInfo {
    /// Unique identifier; keys the uninstall record and the install lock.
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub publisher: String,
    /// Main executable, e.g. `{app}/app.bin`.
    pub executable: String,
    /// Directory name below the per-scope program folder. Defaults to `name`.
    #[serde(default)]
    pub dir_name: Option<String>,
    #[serde(default)]
    pub scope: Scope,
}

impl AppInfo {
    pub fn dir_name(&self) -> &str {
        self.dir_name
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or(&self.name)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        require_field("app.id", &self.id)?;
        require_field("app.name", &self.name)?;
        require_field("app.version", &self.version)?;
        require_field("app.executable", &self.executable)?;
        check_app_id(&self.id).map_err(|reason| ManifestError::invalid("app.id", reason))?;
        semver::Version::parse(self.version.trim())
            .map_err(|err| ManifestError::invalid("app.version", err.to_string()))?;
        let exe = DestPath::parse(&self.executable)
            .map_err(|reason| ManifestError::invalid("app.executable", reason))?;
        if exe.root != DestRoot::App || exe.rel.is_empty() {
            return Err(ManifestError::invalid(
                "app.executable",
                "must name a file below {app}",
            ));
        }
        Ok(())
    }
}

/// App ids name files in the state directory.
pub fn check_app_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("app id is empty".to_string());
    }
    if !id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_'))
        || id.chars().all(|ch| ch == '.')
    {
        return Err(format!(
            "`{id}`: only ASCII letters, digits, '.', '-' and '_' are allowed"
        ));
    }
    Ok(())
}

pub fn require_field(name: &str, value: &str) -> Result<(), ManifestError> {
    if value.trim().is_empty() {
        return Err(ManifestError::invalid(name, "is required"));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverwritePolicy {
    #[default]
    Always,
    KeepIfNewer,
    SkipIfExists,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct InstallEntry {
    /// File or directory, relative to the manifest.
    pub source: PathBuf,
    /// Destination directory template, e.g. `{app}` or `{fonts}`.
    pub dest: String,
    /// Renames a single-file source.
    #[serde(default)]
    pub dest_name: Option<String>,
    #[serde(default)]
    pub overwrite: OverwritePolicy,
    #[serde(default)]
    pub recursive: bool,
    /// Shared resource: installed only when absent, never removed.
    #[serde(default)]
    pub install_once: bool,
}

/// One concrete file to place on the target machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileOp {
    #[serde(skip)]
    pub source: PathBuf,
    pub payload: String,
    pub dest: DestPath,
    pub overwrite: OverwritePolicy,
    pub install_once: bool,
    pub size: u64,
    pub mtime_unix: u64,
    #[serde(default)]
    pub sha256: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LanguageSource {
    pub code: String,
    pub name: String,
    /// TOML file of `Key = "text"` pairs, relative to the manifest.
    #[serde(default)]
    pub catalog: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ManifestDocument {
    pub app: AppInfo,
    #[serde(default)]
    pub files: Vec<InstallEntry>,
    #[serde(default)]
    pub associations: Vec<AssociationRule>,
    #[serde(default)]
    pub languages: Vec<LanguageSource>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub shortcuts: Vec<Shortcut>,
    #[serde(default)]
    pub run: Vec<RunEntry>,
}

impl ManifestDocument {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let raw = fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Expands entries into file operations in declared order. Directory entries
/// yield one operation per file, sorted by relative path.
pub fn expand(entries: &[InstallEntry], base: &Path) -> Result<Vec<FileOp>, ManifestError> {
    let mut ops = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        let field = format!("files[{index}]");
        let source = base.join(&entry.source);
        if !source.exists() {
            return Err(ManifestError::ResourceNotFound(source));
        }
        let dest_dir = DestPath::parse(&entry.dest)
            .map_err(|reason| ManifestError::invalid(format!("{field}.dest"), reason))?;

        if source.is_dir() {
            if !entry.recursive {
                return Err(ManifestError::invalid(
                    format!("{field}.source"),
                    format!("{} is a directory; set recursive = true", source.display()),
                ));
            }
            if entry.dest_name.is_some() {
                return Err(ManifestError::invalid(
                    format!("{field}.dest_name"),
                    "only applies to single files",
                ));
            }
            for item in WalkDir::new(&source).sort_by_file_name() {
                let item = item.map_err(|err| ManifestError::Io {
                    path: source.clone(),
                    source: err.into(),
                })?;
                if !item.file_type().is_file() {
                    continue;
                }
                let rel = item
                    .path()
                    .strip_prefix(&source)
                    .unwrap_or(item.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                let dest = dest_dir
                    .join(&rel)
                    .map_err(|reason| ManifestError::invalid(format!("{field}.source"), reason))?;
                ops.push(file_op(item.path(), dest, entry)?);
            }
        } else {
            let name = match &entry.dest_name {
                Some(name) => name.clone(),
                None => source
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .ok_or_else(|| {
                        ManifestError::invalid(format!("{field}.source"), "has no file name")
                    })?,
            };
            let dest = dest_dir
                .join(&name)
                .map_err(|reason| ManifestError::invalid(format!("{field}.dest_name"), reason))?;
            ops.push(file_op(&source, dest, entry)?);
        }
    }
    ensure_unique(&ops)?;
    Ok(ops)
}

fn file_op(source: &Path, dest: DestPath, entry: &InstallEntry) -> Result<FileOp, ManifestError> {
    let io_err = |source_err: std::io::Error| ManifestError::Io {
        path: source.to_path_buf(),
        source: source_err,
    };
    let meta = fs::metadata(source).map_err(io_err)?;
    let mtime_unix = meta
        .modified()
        .map_err(io_err)?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Ok(FileOp {
        source: source.to_path_buf(),
        payload: format!("payload/{}/{}", dest.root.token(), dest.rel),
        dest,
        overwrite: entry.overwrite,
        install_once: entry.install_once,
        size: meta.len(),
        mtime_unix,
        sha256: String::new(),
    })
}

pub fn ensure_unique(ops: &[FileOp]) -> Result<(), ManifestError> {
    let mut seen = HashSet::new();
    for op in ops {
        if !seen.insert(op.dest.key()) {
            return Err(ManifestError::DuplicateDestination(op.dest.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(source: &str, dest: &str) -> InstallEntry {
        InstallEntry {
            source: PathBuf::from(source),
            dest: dest.to_string(),
            dest_name: None,
            overwrite: OverwritePolicy::Always,
            recursive: false,
            install_once: false,
        }
    }

    fn build_tree(root: &Path) {
        fs::create_dir_all(root.join("build").join("data").join("nested")).unwrap();
        fs::write(root.join("build").join("app.bin"), "bin").unwrap();
        fs::write(root.join("build").join("app.cfg"), "cfg").unwrap();
        fs::write(root.join("build").join("data").join("b.txt"), "b").unwrap();
        fs::write(root.join("build").join("data").join("a.txt"), "a").unwrap();
        fs::write(root.join("build").join("data").join("nested").join("c.txt"), "c").unwrap();
    }

    #[test]
    fn expand_preserves_declared_order_and_structure() {
        let tmp = tempfile::tempdir().unwrap();
        build_tree(tmp.path());
        let mut data = entry("build/data", "{app}/data");
        data.recursive = true;
        let entries = vec![entry("build/app.bin", "{app}"), data, entry("build/app.cfg", "{app}")];

        let ops = expand(&entries, tmp.path()).unwrap();
        let dests: Vec<_> = ops.iter().map(|op| op.dest.to_string()).collect();
        assert_eq!(
            dests,
            vec![
                "{app}/app.bin",
                "{app}/data/a.txt",
                "{app}/data/b.txt",
                "{app}/data/nested/c.txt",
                "{app}/app.cfg",
            ]
        );
        assert_eq!(ops[0].size, 3);
        assert_eq!(ops[0].payload, "payload/app/app.bin");
    }

    #[test]
    fn expand_yields_distinct_destinations() {
        let tmp = tempfile::tempdir().unwrap();
        build_tree(tmp.path());
        let mut data = entry("build/data", "{app}");
        data.recursive = true;
        let mut renamed = entry("build/app.bin", "{app}/bin");
        renamed.dest_name = Some("tool.bin".to_string());
        let entries = vec![entry("build/app.bin", "{app}"), renamed, data];

        let ops = expand(&entries, tmp.path()).unwrap();
        let keys: HashSet<_> = ops.iter().map(|op| op.dest.key()).collect();
        assert_eq!(keys.len(), ops.len());
    }

    #[test]
    fn missing_source_is_resource_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = expand(&[entry("nope.bin", "{app}")], tmp.path()).unwrap_err();
        assert!(matches!(err, ManifestError::ResourceNotFound(p) if p.ends_with("nope.bin")));
    }

    #[test]
    fn colliding_destinations_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        build_tree(tmp.path());
        let mut upper = entry("build/app.cfg", "{app}");
        upper.dest_name = Some("APP.BIN".to_string());
        let err = expand(&[entry("build/app.bin", "{app}"), upper], tmp.path()).unwrap_err();
        assert!(matches!(err, ManifestError::DuplicateDestination(_)));
    }

    #[test]
    fn directory_without_recursive_flag_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        build_tree(tmp.path());
        let err = expand(&[entry("build/data", "{app}")], tmp.path()).unwrap_err();
        assert!(err.to_string().contains("recursive"));
    }

    #[test]
    fn app_info_validation() {
        let mut app = AppInfo {
            id: "App_setup".to_string(),
            name: "App".to_string(),
            version: "1.2.0".to_string(),
            publisher: String::new(),
            executable: "{app}/app.bin".to_string(),
            dir_name: None,
            scope: Scope::User,
        };
        assert!(app.validate().is_ok());
        assert_eq!(app.dir_name(), "App");

        app.version = "one".to_string();
        assert!(app.validate().is_err());
        app.version = "1.2.0".to_string();
        app.id = "bad id".to_string();
        assert!(app.validate().is_err());
        app.id = "App_setup".to_string();
        app.executable = "{fonts}/x.ttf".to_string();
        assert!(app.validate().is_err());
    }

    #[test]
    fn parses_overwrite_policy_in_kebab_case() {
        let doc: ManifestDocument = toml::from_str(
            r#"
            [app]
            id = "App_setup"
            name = "App"
            version = "1.0.0"
            executable = "{app}/app.bin"

            [[files]]
            source = "build/app.cfg"
            dest = "{app}"
            overwrite = "keep-if-newer"
            "#,
        )
        .unwrap();
        assert_eq!(doc.files[0].overwrite, OverwritePolicy::KeepIfNewer);
        assert_eq!(doc.app.scope, Scope::User);
    }
}
