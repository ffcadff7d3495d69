//! Configuration for the notes backup daemon
//!
//! - Generic YAML config loading/saving
//! - Default notes and config locations
//! - The daemon's settings tree
//!
//! # Usage
//!
//! ```ignore
//! use notes_core::config::{default_config_path, load_or_init_config, AppConfig};
//!
//! // First run writes the defaults so there is a file to edit
//! let config: AppConfig = load_or_init_config(&default_config_path());
//! ```

mod app;
mod io;
mod paths;

pub use app::{AppConfig, BackupConfig, MonitorConfig, UnmountConfig};
pub use io::{load_config, load_or_init_config, save_config};
pub use paths::{default_config_path, default_notes_directory};
