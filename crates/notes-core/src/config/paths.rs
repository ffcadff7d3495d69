//! Standard locations for the notes tree and the backup daemon's config

use std::path::PathBuf;

/// Directory name under the platform config dir
const APP_DIRECTORY: &str = "notes-backup";

/// Get the default notes directory
///
/// Returns: `~/Documents/notes` (or the platform's documents folder)
pub fn default_notes_directory() -> PathBuf {
    dirs::document_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Documents")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("notes")
}

/// Get the default config file path
///
/// Returns: `~/.config/notes-backup/config.yaml` on Linux
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIRECTORY)
        .join("config.yaml")
}
