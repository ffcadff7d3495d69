//! Notes tree provisioning
//!
//! Each topic is a folder directly under the notes directory. Folders for
//! configured topics are created at startup so the tree always exists before
//! the first backup walks it.

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TopicError {
    #[error("Invalid topic name {0:?}: must be a single folder name")]
    InvalidName(String),

    #[error("Failed to create topic folder {path}: {source}")]
    CreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A topic name is usable if it is exactly one normal path component
pub fn is_valid_topic_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Create `<notes_directory>/<topic>` for every topic, returning the folders
///
/// Existing folders are left untouched. Stops at the first invalid name or
/// failed creation.
pub fn ensure_topic_directories(notes_directory: &Path, topics: &[String]) -> Result<Vec<PathBuf>, TopicError> {
    let mut folders = Vec::with_capacity(topics.len());

    for topic in topics {
        if !is_valid_topic_name(topic) {
            return Err(TopicError::InvalidName(topic.clone()));
        }

        let path = notes_directory.join(topic);
        if !path.is_dir() {
            log::info!("Creating topic folder {}", path.display());
            std::fs::create_dir_all(&path).map_err(|source| TopicError::CreateFailed {
                path: path.clone(),
                source,
            })?;
        }
        folders.push(path);
    }

    Ok(folders)
}
