//! CLI configuration
//!
//! Values come from an optional TOML file; command line flags override them.
//!
//! ```toml
//! database = "harbor.db"
//! log_profile = "production"
//! max_attempts = 5
//!
//! [session]
//! flush_mode = "auto"
//! ```

use std::path::{Path, PathBuf};

use keel_core::logging_facility::Profile;
use keel_core::SessionConfig;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CliConfig {
    pub database: PathBuf,
    pub log_profile: Profile,
    /// Upper bound on units of work tried by `conflict`
    pub max_attempts: u32,
    pub session: SessionConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from(".keel/keel.db"),
            log_profile: Profile::Production,
            max_attempts: 3,
            session: SessionConfig::default(),
        }
    }
}

/// Flag values that take precedence over the file
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub database: Option<PathBuf>,
    pub log_profile: Option<Profile>,
    pub max_attempts: Option<u32>,
}

impl CliConfig {
    /// Parse a TOML document
    pub fn from_toml(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }

    /// Read `path` if given, otherwise start from defaults
    pub fn load(path: Option<&Path>) -> Result<Self, Box<dyn std::error::Error>> {
        match path {
            Some(path) => {
                let source = std::fs::read_to_string(path)
                    .map_err(|e| format!("cannot read config {}: {}", path.display(), e))?;
                Ok(Self::from_toml(&source)?)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn apply(mut self, overrides: Overrides) -> Self {
        if let Some(database) = overrides.database {
            self.database = database;
        }
        if let Some(log_profile) = overrides.log_profile {
            self.log_profile = log_profile;
        }
        if let Some(max_attempts) = overrides.max_attempts {
            self.max_attempts = max_attempts;
        }
        self
    }
}
