//! Which paths are worth looking at.

use docket_config::Settings;
use std::path::Path;

/// Name-based filter applied before anything touches the disk.
///
/// Rejects hidden files, browser partial downloads (by suffix, case
/// insensitive) and NTFS alternate data streams such as
/// `report.pdf:Zone.Identifier`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    ignored_suffixes: Vec<String>,
}

impl Default for Filter {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl Filter {
    pub fn new<S: AsRef<str>>(ignored_suffixes: impl IntoIterator<Item = S>) -> Self {
        let ignored_suffixes = ignored_suffixes
            .into_iter()
            .map(|s| s.as_ref().trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self { ignored_suffixes }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.ignored_suffixes)
    }

    pub fn accepts_name(&self, name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.contains(':') {
            return false;
        }
        let lower = name.to_lowercase();
        !self.ignored_suffixes.iter().any(|suffix| lower.ends_with(suffix.as_str()))
    }

    /// Only the final component of `path` is considered.
    pub fn accepts(&self, path: &Path) -> bool {
        path.file_name().is_some_and(|name| self.accepts_name(&name.to_string_lossy()))
    }
}
