use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::registry::RegistrySettings;

pub const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub mods_dir: PathBuf,
    #[serde(default)]
    pub game_dir: PathBuf,
    pub overwrite_dir: PathBuf,
    #[serde(default = "default_game_name")]
    pub game_name: String,
    #[serde(default = "default_true")]
    pub display_foreign: bool,
    #[serde(default = "default_dlc_plugins")]
    pub dlc_plugins: Vec<String>,
    #[serde(default = "default_steam_app_id")]
    pub steam_app_id: String,
    #[serde(default)]
    pub workshop_dir: Option<PathBuf>,
    #[serde(default = "default_nexus_game_domain")]
    pub nexus_game_domain: String,
    #[serde(default)]
    pub nexus_api_key: Option<String>,
    #[serde(skip)]
    path: PathBuf,
}

impl AppConfig {
    /// Loads the config from the per-user data dir, creating it on first run.
    pub fn load_or_create() -> Result<Self> {
        let base_dir = base_data_dir()?;
        Self::load_from(&base_dir.join(CONFIG_FILE_NAME))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path).context("read app config")?;
            let mut config: AppConfig = serde_json::from_str(&raw).context("parse app config")?;
            config.path = path.to_path_buf();
            return Ok(config);
        }

        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let config = AppConfig::with_base(&base_dir, path);
        config.save()?;
        Ok(config)
    }

    fn with_base(base_dir: &Path, path: &Path) -> Self {
        AppConfig {
            mods_dir: base_dir.join("mods"),
            game_dir: PathBuf::new(),
            overwrite_dir: base_dir.join("overwrite"),
            game_name: default_game_name(),
            display_foreign: true,
            dlc_plugins: default_dlc_plugins(),
            steam_app_id: default_steam_app_id(),
            workshop_dir: None,
            nexus_game_domain: default_nexus_game_domain(),
            nexus_api_key: None,
            path: path.to_path_buf(),
        }
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("create app data dir")?;
        }
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(&self.path, raw).context("write app config")?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory holding the config, categories and the log file.
    pub fn data_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }

    pub fn game_data_dir(&self) -> PathBuf {
        self.game_dir.join("data")
    }

    fn resolved_workshop_dir(&self) -> Option<PathBuf> {
        if let Some(dir) = &self.workshop_dir {
            return Some(dir.clone());
        }
        let library = self.game_dir.parent()?.parent()?;
        Some(library.join("workshop"))
    }

    pub fn workshop_manifest(&self) -> Option<PathBuf> {
        let dir = self.resolved_workshop_dir()?;
        Some(dir.join(format!("appworkshop_{}.acf", self.steam_app_id)))
    }

    pub fn workshop_content_dir(&self) -> Option<PathBuf> {
        let dir = self.resolved_workshop_dir()?;
        Some(dir.join("content").join(&self.steam_app_id))
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            mods_dir: self.mods_dir.clone(),
            data_dir: self.game_data_dir(),
            overwrite_dir: self.overwrite_dir.clone(),
            game_name: self.game_name.clone(),
            display_foreign: self.display_foreign,
            dlc_plugins: self.dlc_plugins.clone(),
            workshop_manifest: self.workshop_manifest(),
            workshop_content_dir: self.workshop_content_dir(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_game_name() -> String {
    "Skyrim".to_string()
}

fn default_dlc_plugins() -> Vec<String> {
    ["Dawnguard.esm", "HearthFires.esm", "Dragonborn.esm"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_steam_app_id() -> String {
    "72850".to_string()
}

fn default_nexus_game_domain() -> String {
    "skyrim".to_string()
}

fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("modroster"))
}
