//! Configuration loading and root folder resolution

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Optional settings read from the TOML config file
///
/// All fields are optional; missing values fall back to compiled defaults
/// or environment variables at the call site.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    pub root_folder: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_upload_bytes: Option<u64>,
    pub max_concurrent_jobs: Option<usize>,
    pub invoke_timeout_secs: Option<u64>,
    pub max_generate_duration_secs: Option<f64>,
    pub free_tier_max_duration_secs: Option<f64>,
}

/// Root folder resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable `SONICFIX_ROOT`
/// 3. TOML config file `root_folder` key
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(cli_arg: Option<&Path>) -> PathBuf {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var("SONICFIX_ROOT") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    // Priority 3: TOML config file
    if let Ok(config) = load_toml_config() {
        if let Some(root) = config.root_folder {
            return root;
        }
    }

    // Priority 4: OS-dependent compiled default
    default_root_folder()
}

/// Load the TOML config file, if one exists
pub fn load_toml_config() -> Result<TomlConfig> {
    let path = config_file_path()?;
    let content = std::fs::read_to_string(&path)?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Default configuration file path for the platform
pub fn config_file_path() -> Result<PathBuf> {
    let user_config = dirs::config_dir()
        .map(|d| d.join("sonicfix").join("config.toml"))
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;

    if user_config.exists() {
        return Ok(user_config);
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/sonicfix/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }
    }

    Err(Error::Config(format!(
        "Config file not found: {}",
        user_config.display()
    )))
}

/// OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("sonicfix"))
        .unwrap_or_else(|| PathBuf::from("./sonicfix_data"))
}

/// Create the root folder and its storage subdirectories if missing
pub fn ensure_root_folder(root: &Path) -> Result<()> {
    for sub in ["uploads", "outputs", "tmp"] {
        std::fs::create_dir_all(root.join(sub))?;
    }
    Ok(())
}

/// Path of the SQLite database inside the root folder
pub fn database_path(root: &Path) -> PathBuf {
    root.join("sonicfix.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_argument_wins() {
        let root = resolve_root_folder(Some(Path::new("/tmp/sonicfix-test")));
        assert_eq!(root, PathBuf::from("/tmp/sonicfix-test"));
    }

    #[test]
    fn ensure_root_folder_creates_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        ensure_root_folder(&root).unwrap();
        assert!(root.join("uploads").is_dir());
        assert!(root.join("outputs").is_dir());
        assert!(root.join("tmp").is_dir());
    }

    #[test]
    fn database_path_is_under_root() {
        let p = database_path(Path::new("/var/lib/sonicfix"));
        assert_eq!(p, PathBuf::from("/var/lib/sonicfix/sonicfix.db"));
    }
}
