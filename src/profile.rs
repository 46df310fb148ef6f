use std::io;
use std::path::{Path, PathBuf};

use crate::ssh_config::CredentialIntent;
use crate::switcher::SwapError;

/// Host rewritten when neither the profile nor the command line names one.
pub const DEFAULT_HOST: &str = "github.com";

/// Default profile location (~/.ssh-swap/profile).
pub fn default_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".ssh-swap/profile"))
}

/// The identities a wrapped command switches between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapProfile {
    pub host: String,
    /// Installed before the command starts.
    pub primary: CredentialIntent,
    /// Installed once the command is done (or failed to start).
    pub fallback: CredentialIntent,
}

impl Default for SwapProfile {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            primary: CredentialIntent::default(),
            fallback: CredentialIntent::default(),
        }
    }
}

/// Command-line values that take precedence over the profile file.
#[derive(Debug, Clone, Default)]
pub struct ProfileOverrides {
    pub host: Option<String>,
    pub identity_file: Option<String>,
    pub user: Option<String>,
    pub fallback_identity_file: Option<String>,
    pub fallback_user: Option<String>,
}

impl SwapProfile {
    /// Load a profile. A missing file yields the defaults.
    pub fn load(path: &Path) -> io::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Parse `key=value` lines. Comments, blank lines and unknown keys are ignored.
    pub fn parse(content: &str) -> Self {
        let mut profile = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.starts_with('#') || line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().to_string();
            match key.trim() {
                "host" => profile.host = value,
                "primary_identity_file" => profile.primary.identity_file = value,
                "primary_user" => profile.primary.username = value,
                "fallback_identity_file" => profile.fallback.identity_file = value,
                "fallback_user" => profile.fallback.username = value,
                other => log::debug!("Ignoring unknown profile key {}", other),
            }
        }
        profile
    }

    pub fn apply(&mut self, overrides: ProfileOverrides) {
        let fields = [
            (overrides.host, &mut self.host),
            (overrides.identity_file, &mut self.primary.identity_file),
            (overrides.user, &mut self.primary.username),
            (overrides.fallback_identity_file, &mut self.fallback.identity_file),
            (overrides.fallback_user, &mut self.fallback.username),
        ];
        for (value, field) in fields {
            if let Some(value) = value {
                *field = value;
            }
        }
    }

    /// Both identities must be complete and writable before any file is touched.
    pub fn validate(&self) -> Result<(), SwapError> {
        let missing: Vec<&str> = [
            ("host", self.host.as_str()),
            ("primary_identity_file", self.primary.identity_file.as_str()),
            ("primary_user", self.primary.username.as_str()),
            ("fallback_identity_file", self.fallback.identity_file.as_str()),
            ("fallback_user", self.fallback.username.as_str()),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(key, _)| key)
        .collect();

        if !missing.is_empty() {
            return Err(SwapError::Argument(format!("missing {}", missing.join(", "))));
        }
        self.primary.check().map_err(SwapError::Argument)?;
        self.fallback.check().map_err(SwapError::Argument)
    }
}
