//! Layered settings loading.
//!
//! Providers are merged in order, later ones winning:
//!
//! 1. Built-in defaults ([`Settings::default`]).
//! 2. A configuration file (TOML, YAML or JSON, picked by extension).
//! 3. Environment variables prefixed with `DOCKET_`; nested keys use `__`,
//!    e.g. `DOCKET_STABILITY__ATTEMPTS=4`.

use crate::error::{ErrorKind, Result};
use crate::settings::Settings;
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use std::path::{Path, PathBuf};
use tracing::instrument;

pub const ENV_PREFIX: &str = "DOCKET_";

/// Something that can hand out a fresh, validated copy of the [`Settings`].
///
/// The organizer calls this on every invocation instead of holding on to
/// (potentially stale) credentials.
pub trait SettingsSource: Send + Sync {
    fn load(&self) -> Result<Settings>;
}

/// A fixed set of settings; mostly useful for tests and embedding.
impl SettingsSource for Settings {
    fn load(&self) -> Result<Settings> {
        self.validate()?;
        Ok(self.clone())
    }
}

/// Loads [`Settings`] from defaults, a file and the environment.
#[derive(Debug, Clone, Default)]
pub struct Loader {
    file: Option<PathBuf>,
    explicit: bool,
    env: bool,
}

impl Loader {
    /// Loader using the platform configuration file (if present) and the
    /// environment.
    pub fn new() -> Self {
        Self {
            file: Self::default_file(),
            explicit: false,
            env: true,
        }
    }

    /// Use a specific configuration file. Unlike the default location, an
    /// explicit file that doesn't exist is an error.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self.explicit = true;
        self
    }

    /// Ignore `DOCKET_*` environment variables.
    pub fn without_env(mut self) -> Self {
        self.env = false;
        self
    }

    /// `<config dir>/docket/config.toml` for the current platform.
    pub fn default_file() -> Option<PathBuf> {
        ProjectDirs::from("", "", "docket").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Build the merged [`Figment`] without extracting it.
    pub fn figment(&self) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = &self.file {
            if path.is_file() {
                figment = match extension(path).as_deref() {
                    Some("toml") => figment.merge(Toml::file(path)),
                    Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
                    Some("json") => figment.merge(Json::file(path)),
                    other => exn::bail!(ErrorKind::UnsupportedFormat(other.unwrap_or_default().to_string())),
                };
            } else if self.explicit {
                exn::bail!(ErrorKind::NotFound(path.clone()));
            } else {
                tracing::debug!(path = %path.display(), "No configuration file; using defaults and environment");
            }
        }
        if self.env {
            figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        }
        Ok(figment)
    }
}

impl SettingsSource for Loader {
    #[instrument(skip(self), fields(file = ?self.file))]
    fn load(&self) -> Result<Settings> {
        let settings: Settings = self.figment()?.extract().or_raise(|| ErrorKind::Parse)?;
        settings.validate()?;
        Ok(settings)
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase)
}
