//! Platform configuration and data paths
//!
//! Uses the directories crate for platform-appropriate locations:
//! - Linux: `~/.config/scenario-harness/`, `~/.local/share/scenario-harness/`
//! - macOS: `~/Library/Application Support/scenario-harness/`
//! - Windows: `%APPDATA%\scenario-harness\`

use std::io;
use std::path::PathBuf;

/// Name used for the application directories
const APP_NAME: &str = "scenario-harness";

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", APP_NAME)
}

/// Get the configuration directory path
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Get the data directory (history lives here)
pub fn data_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
}

/// Default location of the run history file
pub fn history_path() -> Option<PathBuf> {
    data_dir().map(|dir| dir.join("history.json"))
}

/// Get the path to the log directory
pub fn log_dir() -> Option<PathBuf> {
    data_dir().map(|dir| dir.join("logs"))
}

/// Ensure a directory exists, creating parents as needed
pub fn ensure_dir(dir: &std::path::Path) -> io::Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_is_toml() {
        if let Some(path) = config_path() {
            assert_eq!(path.extension().and_then(|e| e.to_str()), Some("toml"));
        }
    }

    #[test]
    fn test_log_dir_under_data_dir() {
        if let (Some(data), Some(logs)) = (data_dir(), log_dir()) {
            assert!(logs.starts_with(data));
        }
    }
}
