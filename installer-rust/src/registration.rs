//! File-type associations and the uninstall entry, expressed as registry
//! writes that can be undone exactly.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::ManifestError, manifest::AppInfo, registry::RegistryStore, template::Expander,
};

pub const CLASSES_ROOT: &str = r"Software\Classes";
pub const CLAIMS_ROOT: &str = r"Software\Shipwright\Claims";
pub const UNINSTALL_ROOT: &str = r"Software\Microsoft\Windows\CurrentVersion\Uninstall";

/// Placeholder in the open command that receives the invoked file.
pub const FILE_PLACEHOLDER: &str = "%1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AssociationRule {
    pub extension: String,
    pub program_id: String,
    /// Message key of the file type's display name.
    pub description: String,
    pub icon: String,
    pub command: String,
}

impl AssociationRule {
    pub fn validate(&self, index: usize) -> Result<(), ManifestError> {
        let field = |name: &str| format!("associations[{index}].{name}");
        let ext = self.extension.trim();
        if !ext.starts_with('.') || ext.len() < 2 {
            return Err(ManifestError::invalid(
                field("extension"),
                format!("`{ext}` must start with a dot"),
            ));
        }
        if ext.contains(['\\', '/', ' ']) {
            return Err(ManifestError::invalid(
                field("extension"),
                format!("`{ext}` contains a separator or space"),
            ));
        }
        let id = self.program_id.trim();
        if id.is_empty() || id.contains('\\') {
            return Err(ManifestError::invalid(
                field("program_id"),
                "must be a non-empty name without backslashes",
            ));
        }
        if self.description.trim().is_empty() {
            return Err(ManifestError::invalid(field("description"), "is required"));
        }
        if self.command.matches(FILE_PLACEHOLDER).count() != 1 {
            return Err(ManifestError::invalid(
                field("command"),
                format!("must contain {FILE_PLACEHOLDER} exactly once"),
            ));
        }
        Ok(())
    }

    pub fn extension_key(&self) -> String {
        format!(r"{CLASSES_ROOT}\{}", self.extension.trim())
    }

    pub fn program_key(&self) -> String {
        program_key(&self.program_id)
    }
}

pub fn program_key(program_id: &str) -> String {
    format!(r"{CLASSES_ROOT}\{}", program_id.trim())
}

pub fn claims_key(program_id: &str) -> String {
    format!(r"{CLAIMS_ROOT}\{}", program_id.trim())
}

pub fn uninstall_key(app_id: &str) -> String {
    format!(r"{UNINSTALL_ROOT}\{app_id}")
}

/// A value this package wants to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedWrite {
    pub key: String,
    pub name: String,
    pub data: String,
    /// Lives below the program id and is shared by all its claimants.
    pub owned: bool,
}

impl PlannedWrite {
    fn new(key: String, name: &str, data: String, owned: bool) -> Self {
        Self {
            key,
            name: name.to_string(),
            data,
            owned,
        }
    }
}

/// A value that was written, with what it replaced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryWrite {
    pub key: String,
    pub name: String,
    pub data: String,
    pub previous: Option<String>,
    pub created_key: bool,
    #[serde(default)]
    pub owned: bool,
    #[serde(default)]
    pub program_id: Option<String>,
}

impl RegistryWrite {
    pub fn is_claim(&self) -> bool {
        self.key
            .to_ascii_lowercase()
            .starts_with(&CLAIMS_ROOT.to_ascii_lowercase())
    }

    pub fn same_slot(&self, other: &RegistryWrite) -> bool {
        self.key.eq_ignore_ascii_case(&other.key) && self.name.eq_ignore_ascii_case(&other.name)
    }
}

/// The four layered writes of one association: extension -> program id,
/// display name, icon, open command.
pub fn apply(rule: &AssociationRule, expander: &Expander<'_>) -> Result<Vec<PlannedWrite>, String> {
    let program_key = rule.program_key();
    Ok(vec![
        PlannedWrite::new(rule.extension_key(), "", rule.program_id.trim().to_string(), false),
        PlannedWrite::new(program_key.clone(), "", expander.catalog.get(&rule.description), true),
        PlannedWrite::new(
            format!(r"{program_key}\DefaultIcon"),
            "",
            expander.text(&rule.icon)?,
            true,
        ),
        PlannedWrite::new(
            format!(r"{program_key}\shell\open\command"),
            "",
            expander.text(&rule.command)?,
            true,
        ),
    ])
}

/// Values that make the installation visible to the platform's uninstall
/// mechanism.
pub fn uninstall_entry(
    app: &AppInfo,
    install_location: &str,
    uninstall_string: &str,
) -> Vec<PlannedWrite> {
    let key = uninstall_key(&app.id);
    let mut writes = vec![
        PlannedWrite::new(key.clone(), "DisplayName", app.name.clone(), true),
        PlannedWrite::new(key.clone(), "DisplayVersion", app.version.clone(), true),
        PlannedWrite::new(key.clone(), "InstallLocation", install_location.to_string(), true),
        PlannedWrite::new(key.clone(), "UninstallString", uninstall_string.to_string(), true),
    ];
    if !app.publisher.trim().is_empty() {
        writes.push(PlannedWrite::new(key, "Publisher", app.publisher.clone(), true));
    }
    writes
}

pub fn claim(app_id: &str, version: &str, program_id: &str) -> PlannedWrite {
    PlannedWrite::new(claims_key(program_id), app_id, version.to_string(), true)
}

pub fn claimants(store: &dyn RegistryStore, program_id: &str) -> Result<Vec<String>> {
    Ok(store.values(&claims_key(program_id))?.into_keys().collect())
}

pub fn perform(
    store: &dyn RegistryStore,
    planned: &PlannedWrite,
    program_id: Option<&str>,
) -> Result<RegistryWrite> {
    let created_key = !store.key_exists(&planned.key)?;
    let previous = store.get(&planned.key, &planned.name)?;
    store.set(&planned.key, &planned.name, &planned.data)?;
    debug!(key = %planned.key, name = %planned.name, "registry value written");
    Ok(RegistryWrite {
        key: planned.key.clone(),
        name: planned.name.clone(),
        data: planned.data.clone(),
        previous,
        created_key,
        owned: planned.owned,
        program_id: program_id.map(str::to_string),
    })
}

/// Puts every slot back exactly as it was before `writes` happened. Used by
/// rollback, where nothing else can have touched the values in between.
pub fn undo(store: &dyn RegistryStore, writes: &[RegistryWrite]) -> Result<()> {
    for write in writes.iter().rev() {
        match &write.previous {
            Some(previous) => store.set(&write.key, &write.name, previous)?,
            None => store.delete_value(&write.key, &write.name)?,
        }
        if write.created_key && store.is_empty(&write.key)? {
            store.delete_key(&write.key)?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevertOutcome {
    pub restored: Vec<String>,
    pub deleted: Vec<String>,
    /// Program ids left in place because another application still claims
    /// them.
    pub still_claimed: Vec<String>,
}

/// Reverts one program id's writes for `app_id`, honouring other claimants.
pub fn revert(
    store: &dyn RegistryStore,
    app_id: &str,
    program_id: &str,
    writes: &[RegistryWrite],
) -> Result<RevertOutcome> {
    let claims = claims_key(program_id);
    store.delete_value(&claims, app_id)?;
    if store.is_empty(&claims)? {
        store.delete_key(&claims)?;
    }
    let others_remain = !claimants(store, program_id)?.is_empty();

    let mut outcome = revert_writes(store, program_id, writes, others_remain)?;
    if others_remain {
        outcome.still_claimed.push(program_id.to_string());
    }
    Ok(outcome)
}

/// Reverts writes that belong to this application alone.
pub fn revert_exclusive(store: &dyn RegistryStore, writes: &[RegistryWrite]) -> Result<RevertOutcome> {
    revert_writes(store, "", writes, false)
}

fn revert_writes(
    store: &dyn RegistryStore,
    program_id: &str,
    writes: &[RegistryWrite],
    others_remain: bool,
) -> Result<RevertOutcome> {
    let mut outcome = RevertOutcome::default();
    for write in writes.iter().rev().filter(|w| !w.is_claim()) {
        let current = store.get(&write.key, &write.name)?;
        let ours = current.as_deref() == Some(write.data.as_str());
        let slot = format!(r"{}\{}", write.key, write.name);

        if others_remain {
            // hand the slot back to whoever held it before us
            if let (true, Some(previous)) = (ours, &write.previous) {
                store.set(&write.key, &write.name, previous)?;
                outcome.restored.push(slot);
            }
            continue;
        }

        if write.owned {
            if current.is_some() {
                store.delete_value(&write.key, &write.name)?;
                outcome.deleted.push(slot);
            }
        } else if ours {
            match &write.previous {
                Some(previous) if !previous.eq_ignore_ascii_case(program_id) => {
                    store.set(&write.key, &write.name, previous)?;
                    outcome.restored.push(slot);
                }
                _ => {
                    store.delete_value(&write.key, &write.name)?;
                    outcome.deleted.push(slot);
                }
            }
        }
        // an earlier claimant of the same program id may have created the key
        let inherited = write
            .previous
            .as_deref()
            .is_some_and(|p| p.eq_ignore_ascii_case(program_id));
        if (write.created_key || write.owned || inherited)
            && store.key_exists(&write.key)?
            && store.is_empty(&write.key)?
        {
            store.delete_key(&write.key)?;
            outcome.deleted.push(write.key.clone());
        }
    }
    Ok(outcome)
}
