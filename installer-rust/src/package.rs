//! The installable artifact.
//!
//! A package is a zip archive holding `package.json` (the fully expanded,
//! validated definition) and one `payload/<root>/<path>` entry per file
//! operation. It can be appended to an installer executable, followed by a
//! 16-byte trailer: the archive length as `u64` little-endian and the magic
//! `SHIPWRK1`.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs,
    io::{Cursor, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info};
use zip::{write::FileOptions, CompressionMethod, ZipArchive, ZipWriter};

use crate::{
    error::{InstallError, ManifestError},
    fs_ops,
    locale::{normalize_tag, LanguageEntry, LocalizationTable, Messages},
    manifest::{self, AppInfo, FileOp, ManifestDocument},
    paths,
    registration::AssociationRule,
    tasks::{RunEntry, Shortcut, Task},
    template::{message_refs, DestPath},
};

pub const PACKAGE_FORMAT: u32 = 1;
pub const INDEX_NAME: &str = "package.json";
pub const TRAILER_MAGIC: &[u8; 8] = b"SHIPWRK1";
const TRAILER_LEN: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageIndex {
    pub format: u32,
    pub app: AppInfo,
    pub files: Vec<FileOp>,
    #[serde(default)]
    pub associations: Vec<AssociationRule>,
    #[serde(default)]
    pub languages: Vec<LanguageEntry>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub shortcuts: Vec<Shortcut>,
    #[serde(default)]
    pub run: Vec<RunEntry>,
}

impl PackageIndex {
    pub fn table(&self) -> LocalizationTable {
        LocalizationTable::new(self.languages.clone())
    }

    pub fn payload_size(&self) -> u64 {
        self.files.iter().map(|op| op.size).sum()
    }

    /// Cross-checks everything that refers to something else: message keys,
    /// task ids, templates and program ids.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.format != PACKAGE_FORMAT {
            return Err(ManifestError::invalid(
                "format",
                format!("unsupported package format {}", self.format),
            ));
        }
        self.app.validate()?;
        for (index, op) in self.files.iter().enumerate() {
            if op.dest.rel.is_empty() {
                return Err(ManifestError::invalid(
                    format!("files[{index}].dest"),
                    format!("`{}` names a root, not a file", op.dest),
                ));
            }
        }
        manifest::ensure_unique(&self.files)?;

        let mut codes = HashSet::new();
        for (index, language) in self.languages.iter().enumerate() {
            let code = normalize_tag(&language.code);
            if code.is_empty() || language.name.trim().is_empty() {
                return Err(ManifestError::invalid(
                    format!("languages[{index}]"),
                    "code and name are required",
                ));
            }
            if !codes.insert(code) {
                return Err(ManifestError::invalid(
                    format!("languages[{index}].code"),
                    format!("duplicate language `{}`", language.code),
                ));
            }
        }

        let table = self.table();
        let known_key = |field: String, key: &str| -> Result<(), ManifestError> {
            if table.knows(key) {
                Ok(())
            } else {
                Err(ManifestError::invalid(field, format!("unknown message key `{key}`")))
            }
        };
        let template = |field: String, text: &str| -> Result<(), ManifestError> {
            for key in message_refs(text).map_err(|reason| ManifestError::invalid(&field, reason))? {
                known_key(field.clone(), &key)?;
            }
            Ok(())
        };
        let dest = |field: String, text: &str| -> Result<(), ManifestError> {
            DestPath::parse(text)
                .map(|_| ())
                .map_err(|reason| ManifestError::invalid(field, reason))
        };

        let mut task_ids = HashSet::new();
        for (index, task) in self.tasks.iter().enumerate() {
            let id = task.id.trim().to_ascii_lowercase();
            if id.is_empty() || id.contains([',', ' ']) {
                return Err(ManifestError::invalid(
                    format!("tasks[{index}].id"),
                    "must be a non-empty name without commas or spaces",
                ));
            }
            if !task_ids.insert(id) {
                return Err(ManifestError::invalid(
                    format!("tasks[{index}].id"),
                    format!("duplicate task `{}`", task.id),
                ));
            }
            known_key(format!("tasks[{index}].description"), &task.description)?;
        }

        let mut program_ids = HashSet::new();
        let mut extensions = HashSet::new();
        for (index, rule) in self.associations.iter().enumerate() {
            rule.validate(index)?;
            if !program_ids.insert(rule.program_id.trim().to_ascii_lowercase()) {
                return Err(ManifestError::DuplicateProgramId(rule.program_id.clone()));
            }
            if !extensions.insert(rule.extension.trim().to_ascii_lowercase()) {
                return Err(ManifestError::invalid(
                    format!("associations[{index}].extension"),
                    format!("`{}` is associated twice", rule.extension),
                ));
            }
            known_key(format!("associations[{index}].description"), &rule.description)?;
            template(format!("associations[{index}].icon"), &rule.icon)?;
            template(format!("associations[{index}].command"), &rule.command)?;
        }

        for (index, shortcut) in self.shortcuts.iter().enumerate() {
            template(format!("shortcuts[{index}].name"), &shortcut.name)?;
            dest(format!("shortcuts[{index}].target"), &shortcut.target)?;
            if let Some(icon) = &shortcut.icon {
                dest(format!("shortcuts[{index}].icon"), icon)?;
            }
            if let Some(task) = &shortcut.task {
                if !task_ids.contains(&task.trim().to_ascii_lowercase()) {
                    return Err(ManifestError::invalid(
                        format!("shortcuts[{index}].task"),
                        format!("unknown task `{task}`"),
                    ));
                }
            }
        }

        for (index, entry) in self.run.iter().enumerate() {
            dest(format!("run[{index}].target"), &entry.target)?;
            known_key(format!("run[{index}].description"), &entry.description)?;
        }
        Ok(())
    }
}

/// Loads, expands, hashes and validates a manifest. Nothing is written.
pub fn prepare(manifest_path: &Path) -> Result<PackageIndex, ManifestError> {
    let doc = ManifestDocument::load(manifest_path)?;
    let base = manifest_path.parent().unwrap_or(Path::new("."));
    doc.app.validate()?;

    let mut languages = Vec::new();
    for source in &doc.languages {
        let messages = match &source.catalog {
            Some(rel) => load_catalog(&base.join(rel))?,
            None => Messages::new(),
        };
        languages.push(LanguageEntry {
            code: source.code.trim().to_string(),
            name: source.name.trim().to_string(),
            messages,
        });
    }

    let mut files = manifest::expand(&doc.files, base)?;
    for op in &mut files {
        let bytes = fs::read(&op.source).map_err(|source| ManifestError::Io {
            path: op.source.clone(),
            source,
        })?;
        op.size = bytes.len() as u64;
        op.sha256 = fs_ops::sha256_bytes(&bytes);
    }

    let index = PackageIndex {
        format: PACKAGE_FORMAT,
        app: doc.app,
        files,
        associations: doc.associations,
        languages,
        tasks: doc.tasks,
        shortcuts: doc.shortcuts,
        run: doc.run,
    };
    index.validate()?;
    Ok(index)
}

fn load_catalog(path: &Path) -> Result<Messages, ManifestError> {
    if !path.exists() {
        return Err(ManifestError::ResourceNotFound(path.to_path_buf()));
    }
    let raw = fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ManifestError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Zip bytes for a prepared index. Payload is read from each operation's
/// source file.
pub fn archive_bytes(index: &PackageIndex) -> Result<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file(INDEX_NAME, options)?;
    let json = serde_json::to_vec_pretty(index).context("serialize package index")?;
    zip.write_all(&json)?;

    for op in &index.files {
        let bytes = fs::read(&op.source).with_context(|| format!("read {}", op.source.display()))?;
        if fs_ops::sha256_bytes(&bytes) != op.sha256 {
            bail!("{} changed while packaging", op.source.display());
        }
        zip.start_file(op.payload.as_str(), options)?;
        zip.write_all(&bytes)?;
        debug!(payload = %op.payload, size = bytes.len(), "added to archive");
    }
    Ok(zip.finish()?.into_inner())
}

/// `stub` + `archive` + trailer.
pub fn append_to_stub(stub: &[u8], archive: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(stub.len() + archive.len() + TRAILER_LEN);
    out.extend_from_slice(stub);
    out.extend_from_slice(archive);
    out.extend_from_slice(&(archive.len() as u64).to_le_bytes());
    out.extend_from_slice(TRAILER_MAGIC);
    out
}

/// `<name>-<version>-setup.zip`, or the platform's executable name when a
/// stub is used.
pub fn artifact_name(app: &AppInfo, executable: bool) -> String {
    let base = format!(
        "{}-{}-setup",
        sanitize_file_name(&app.name),
        app.version.trim()
    );
    match (executable, cfg!(windows)) {
        (false, _) => format!("{base}.zip"),
        (true, true) => format!("{base}.exe"),
        (true, false) => base,
    }
}

pub fn sanitize_file_name(name: &str) -> String {
    let mut out = String::new();
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    let out = out.trim_end_matches('.').to_string();
    if out.is_empty() {
        "ShipwrightApp".to_string()
    } else {
        out
    }
}

/// Validates the manifest completely, then writes the artifact into
/// `out_dir`. Returns the artifact path.
pub fn build(manifest_path: &Path, out_dir: &Path, stub: Option<&Path>) -> Result<PathBuf> {
    let index = prepare(manifest_path)?;
    let archive = archive_bytes(&index)?;

    let (bytes, executable) = match stub {
        Some(stub) => {
            let stub_bytes = fs::read(stub).with_context(|| format!("read {}", stub.display()))?;
            (append_to_stub(&stub_bytes, &archive), true)
        }
        None => (archive, false),
    };

    fs::create_dir_all(out_dir).with_context(|| format!("create {}", out_dir.display()))?;
    let dest = out_dir.join(artifact_name(&index.app, executable));
    fs_ops::write_bytes_with_retry(&dest, &bytes, 3)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if executable {
            fs::set_permissions(&dest, fs::Permissions::from_mode(0o755))
                .with_context(|| format!("chmod {}", dest.display()))?;
        }
    }
    info!(
        artifact = %dest.display(),
        files = index.files.len(),
        bytes = bytes.len(),
        "package written"
    );
    Ok(dest)
}

#[derive(Debug, Clone)]
struct SharedBytes(Arc<[u8]>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// An opened package, ready to be installed.
#[derive(Clone, Debug)]
pub struct Package {
    index: PackageIndex,
    archive: ZipArchive<Cursor<SharedBytes>>,
}

impl Package {
    pub fn open(path: &Path) -> Result<Self, InstallError> {
        let bytes = fs::read(path)
            .map_err(|err| InstallError::package(format!("read {}: {err}", path.display())))?;
        Self::from_bytes(&bytes)
    }

    /// The package appended to the running executable, if any.
    pub fn embedded() -> Result<Option<Self>, InstallError> {
        let exe = paths::self_path().map_err(|err| InstallError::package(format!("{err:#}")))?;
        let bytes = fs::read(&exe)
            .map_err(|err| InstallError::package(format!("read {}: {err}", exe.display())))?;
        if !has_trailer(&bytes) {
            return Ok(None);
        }
        Self::from_bytes(&bytes).map(Some)
    }

    /// Accepts a bare archive or an executable with an appended one.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, InstallError> {
        let archive = locate_archive(bytes).map_err(InstallError::package)?;
        let shared = SharedBytes(Arc::from(archive));
        let mut archive = ZipArchive::new(Cursor::new(shared))
            .map_err(|err| InstallError::package(format!("open archive: {err}")))?;

        let index: PackageIndex = {
            let mut entry = archive
                .by_name(INDEX_NAME)
                .map_err(|err| InstallError::package(format!("{INDEX_NAME}: {err}")))?;
            let mut raw = Vec::new();
            entry
                .read_to_end(&mut raw)
                .map_err(|err| InstallError::package(format!("{INDEX_NAME}: {err}")))?;
            serde_json::from_slice(&raw)
                .map_err(|err| InstallError::package(format!("{INDEX_NAME}: {err}")))?
        };
        index
            .validate()
            .map_err(|err| InstallError::package(err.to_string()))?;

        let names: HashSet<&str> = archive.file_names().collect();
        if let Some(missing) = index.files.iter().find(|op| !names.contains(op.payload.as_str())) {
            return Err(InstallError::package(format!("missing payload {}", missing.payload)));
        }

        Ok(Self { index, archive })
    }

    pub fn index(&self) -> &PackageIndex {
        &self.index
    }

    /// Bundled content of `op`, checked against its recorded hash.
    pub fn read_payload(&self, op: &FileOp) -> Result<Vec<u8>> {
        let mut archive = self.archive.clone();
        let mut entry = archive
            .by_name(&op.payload)
            .with_context(|| format!("payload {}", op.payload))?;
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .with_context(|| format!("read payload {}", op.payload))?;
        if !op.sha256.is_empty() && fs_ops::sha256_bytes(&bytes) != op.sha256 {
            bail!("payload {} is corrupt", op.payload);
        }
        Ok(bytes)
    }
}

fn has_trailer(bytes: &[u8]) -> bool {
    bytes.len() >= TRAILER_LEN && &bytes[bytes.len() - 8..] == TRAILER_MAGIC
}

fn locate_archive(bytes: &[u8]) -> Result<&[u8], String> {
    if !has_trailer(bytes) {
        return Ok(bytes);
    }
    let end = bytes.len() - TRAILER_LEN;
    let mut len = [0u8; 8];
    len.copy_from_slice(&bytes[end..end + 8]);
    let len = usize::try_from(u64::from_le_bytes(len))
        .map_err(|_| "archive length out of range".to_string())?;
    let start = end
        .checked_sub(len)
        .ok_or_else(|| "archive length exceeds file size".to_string())?;
    Ok(&bytes[start..end])
}
