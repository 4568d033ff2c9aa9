use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_ARCHIVE_URL: &str =
    "https://github.com/Detanup01/gbe_fork/releases/latest/download/emu-win-release.7z";
pub const DEFAULT_APP_LIST_URL: &str = "https://api.steampowered.com/ISteamApps/GetAppList/v2/";
pub const DEFAULT_STORE_API_URL: &str = "https://store.steampowered.com/api/appdetails";
pub const DEFAULT_COMMUNITY_URL: &str = "https://steamcommunity.com/stats";
pub const DEFAULT_STEAMDB_URL: &str = "https://steamdb.info/app";

/// User-editable settings, stored as `config/settings.json` under the app data dir.
///
/// Every field has a default so a partial (or missing) file is fine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Where `<Game> (<AppID>)` folders are created. `None` = working directory.
    pub output_dir: Option<PathBuf>,
    /// Holds `goldberg_emu/` and the optional `steam_settings/` template.
    /// `None` = `<AppData>/assets`.
    pub assets_dir: Option<PathBuf>,
    pub emulator_archive_url: String,
    pub app_list_url: String,
    pub store_api_url: String,
    pub community_url: String,
    pub steamdb_url: String,
    pub worker_threads: usize,
    /// e.g. `wine` to run `generate_interfaces_*.exe` on Linux.
    pub interface_tool_wrapper: Option<String>,
    pub download_icons: bool,
    pub language: String,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            assets_dir: None,
            emulator_archive_url: DEFAULT_ARCHIVE_URL.to_string(),
            app_list_url: DEFAULT_APP_LIST_URL.to_string(),
            store_api_url: DEFAULT_STORE_API_URL.to_string(),
            community_url: DEFAULT_COMMUNITY_URL.to_string(),
            steamdb_url: DEFAULT_STEAMDB_URL.to_string(),
            worker_threads: 2,
            interface_tool_wrapper: None,
            download_icons: true,
            language: "english".to_string(),
        }
    }
}

impl GeneratorConfig {
    pub fn settings_path(config_dir: &Path) -> PathBuf {
        config_dir.join("settings.json")
    }

    /// Reads `settings.json`; a missing file yields the defaults.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = Self::settings_path(config_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        let cfg: Self = serde_json::from_str(&text)?;
        Ok(cfg)
    }

    pub fn save(&self, config_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(config_dir)?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(Self::settings_path(config_dir), json)?;
        Ok(())
    }

    /// Configured output folder, else the working directory, else the home folder.
    pub fn resolved_output_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.output_dir {
            return Ok(dir.clone());
        }
        match std::env::current_dir() {
            Ok(dir) => Ok(dir),
            Err(e) => dirs::home_dir().ok_or(Error::Io(e)),
        }
    }

    pub fn resolved_assets_dir(&self, app_data: &Path) -> PathBuf {
        self.assets_dir
            .clone()
            .unwrap_or_else(|| app_data.join("assets"))
    }
}

fn username_path(config_dir: &Path) -> PathBuf {
    config_dir.join("username.txt")
}

/// Last entered account name, or an empty string.
pub fn load_username(config_dir: &Path) -> Result<String> {
    let path = username_path(config_dir);
    if !path.exists() {
        return Ok(String::new());
    }
    Ok(std::fs::read_to_string(path)?.trim().to_string())
}

pub fn save_username(config_dir: &Path, username: &str) -> Result<()> {
    std::fs::create_dir_all(config_dir)?;
    std::fs::write(username_path(config_dir), username.trim())?;
    Ok(())
}
