use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::template::DestRoot;

/// Dev/test override: every location is placed under this directory.
pub const ROOT_ENV: &str = "SHIPWRIGHT_ROOT";
pub const STATE_DIR_ENV: &str = "SHIPWRIGHT_STATE_DIR";

const VENDOR_DIR: &str = "Shipwright";

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    User,
    Machine,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::User => f.write_str("user"),
            Scope::Machine => f.write_str("machine"),
        }
    }
}

pub fn self_path() -> Result<PathBuf> {
    std::env::current_exe().context("current_exe")
}

/// Well-known directories for one install scope, before an install root is
/// chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locations {
    pub install_base: PathBuf,
    pub fonts: PathBuf,
    pub desktop: PathBuf,
    pub programs: PathBuf,
    pub state: PathBuf,
}

impl Locations {
    pub fn resolve(scope: Scope) -> Result<Self> {
        if let Ok(root) = std::env::var(ROOT_ENV) {
            if !root.trim().is_empty() {
                return Ok(Self::under(Path::new(&root)));
            }
        }
        let mut locations = match scope {
            Scope::User => user_locations()?,
            Scope::Machine => machine_locations()?,
        };
        if let Ok(state) = std::env::var(STATE_DIR_ENV) {
            if !state.trim().is_empty() {
                locations.state = PathBuf::from(state);
            }
        }
        Ok(locations)
    }

    pub fn under(root: &Path) -> Self {
        Self {
            install_base: root.join("programs-data"),
            fonts: root.join("fonts"),
            desktop: root.join("desktop"),
            programs: root.join("start-menu"),
            state: root.join("state"),
        }
    }

    pub fn default_install_root(&self, dir_name: &str) -> Result<PathBuf> {
        if dir_name.trim().is_empty() {
            bail!("install directory name is empty");
        }
        Ok(self.install_base.join(dir_name.trim()))
    }

    pub fn layout(&self, app: PathBuf) -> Layout {
        Layout {
            app,
            fonts: self.fonts.clone(),
            desktop: self.desktop.clone(),
            programs: self.programs.clone(),
            state: self.state.clone(),
        }
    }
}

/// Concrete directories of one install run. Destination templates resolve
/// against this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub app: PathBuf,
    pub fonts: PathBuf,
    pub desktop: PathBuf,
    pub programs: PathBuf,
    pub state: PathBuf,
}

impl Layout {
    pub fn root(&self, root: DestRoot) -> &Path {
        match root {
            DestRoot::App => &self.app,
            DestRoot::Fonts => &self.fonts,
            DestRoot::Desktop => &self.desktop,
            DestRoot::Programs => &self.programs,
        }
    }

    pub fn record_path(&self, app_id: &str) -> PathBuf {
        record_path(&self.state, app_id)
    }

    pub fn locks_dir(&self) -> PathBuf {
        locks_dir(&self.state)
    }
}

pub fn record_path(state: &Path, app_id: &str) -> PathBuf {
    state.join("uninstall").join(format!("{app_id}.json"))
}

pub fn registry_path(state: &Path) -> PathBuf {
    state.join("registry.json")
}

pub fn locks_dir(state: &Path) -> PathBuf {
    state.join("locks")
}

fn user_locations() -> Result<Locations> {
    let local = dirs::data_local_dir().context("no local data directory for this user")?;
    let home = dirs::home_dir().context("no home directory for this user")?;
    let desktop = dirs::desktop_dir().unwrap_or_else(|| home.join("Desktop"));

    let (install_base, fonts, programs) = if cfg!(windows) {
        let roaming = dirs::data_dir().context("APPDATA not set")?;
        (
            local.join("Programs"),
            local.join("Microsoft").join("Windows").join("Fonts"),
            roaming
                .join("Microsoft")
                .join("Windows")
                .join("Start Menu")
                .join("Programs"),
        )
    } else {
        (
            local.clone(),
            dirs::font_dir().unwrap_or_else(|| local.join("fonts")),
            local.join("applications"),
        )
    };

    Ok(Locations {
        install_base,
        fonts,
        desktop,
        programs,
        state: local.join(VENDOR_DIR),
    })
}

fn machine_locations() -> Result<Locations> {
    let desktop = dirs::desktop_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Desktop")))
        .context("no desktop directory")?;

    if cfg!(windows) {
        let program_files = env_dir("ProgramFiles", r"C:\Program Files");
        let program_data = env_dir("ProgramData", r"C:\ProgramData");
        let windir = env_dir("WINDIR", r"C:\Windows");
        return Ok(Locations {
            install_base: program_files,
            fonts: windir.join("Fonts"),
            desktop,
            programs: program_data
                .join("Microsoft")
                .join("Windows")
                .join("Start Menu")
                .join("Programs"),
            state: program_data.join(VENDOR_DIR),
        });
    }

    let fonts = if cfg!(target_os = "macos") {
        PathBuf::from("/Library/Fonts")
    } else {
        PathBuf::from("/usr/local/share/fonts")
    };
    Ok(Locations {
        install_base: PathBuf::from("/opt"),
        fonts,
        desktop,
        programs: PathBuf::from("/usr/share/applications"),
        state: PathBuf::from("/var/lib/shipwright"),
    })
}

fn env_dir(name: &str, fallback: &str) -> PathBuf {
    std::env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(fallback))
}
