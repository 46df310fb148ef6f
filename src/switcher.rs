use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::ssh_config::{CredentialIntent, ParseError, RewriteSummary, SshConfigFile, WriteError, atomic_write};

/// The step of a credential swap that was being attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Arguments,
    Open,
    Parse,
    Stat,
    Write,
    Commit,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Stage::Arguments => "parsing command line arguments",
            Stage::Open => "opening ssh config file",
            Stage::Parse => "parsing ssh config file",
            Stage::Stat => "getting file mode",
            Stage::Write => "writing data to temp file",
            Stage::Commit => "committing file",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A failed credential swap. The config file is left exactly as it was.
///
/// Displays as `<stage label>: <cause>`.
#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    #[error("{stage}: {0}", stage = Stage::Arguments)]
    Argument(String),
    #[error("{stage}: {file}: {cause}", stage = Stage::Open, file = .path.display())]
    Open { path: PathBuf, cause: io::Error },
    #[error("{stage}: {cause}", stage = Stage::Parse)]
    Parse { path: PathBuf, cause: ParseError },
    #[error("{stage}: {file}: {cause}", stage = Stage::Stat, file = .path.display())]
    Stat { path: PathBuf, cause: io::Error },
    #[error("{stage}: {0}", stage = Stage::Write)]
    Write(WriteError),
    #[error("{stage}: {0}", stage = Stage::Commit)]
    Commit(WriteError),
}

impl SwapError {
    pub fn stage(&self) -> Stage {
        match self {
            SwapError::Argument(_) => Stage::Arguments,
            SwapError::Open { .. } => Stage::Open,
            SwapError::Parse { .. } => Stage::Parse,
            SwapError::Stat { .. } => Stage::Stat,
            SwapError::Write(_) => Stage::Write,
            SwapError::Commit(_) => Stage::Commit,
        }
    }
}

impl From<WriteError> for SwapError {
    fn from(err: WriteError) -> Self {
        if err.is_commit() {
            SwapError::Commit(err)
        } else {
            SwapError::Write(err)
        }
    }
}

/// Rewrite the `IdentityFile`/`User` of every block matching `host` in the config at `config_path`.
/// Either the whole file is replaced with the rewritten config, or it is not touched at all.
pub fn set_host(
    config_path: &Path,
    host: &str,
    intent: &CredentialIntent,
) -> Result<RewriteSummary, SwapError> {
    if intent.is_empty() {
        return Err(SwapError::Argument(
            "please provide a user or identity file".to_string(),
        ));
    }
    intent.check().map_err(SwapError::Argument)?;

    let open_err = |cause| SwapError::Open {
        path: config_path.to_path_buf(),
        cause,
    };
    let mut file = File::open(config_path).map_err(open_err)?;
    let mut content = String::new();
    file.read_to_string(&mut content).map_err(open_err)?;

    let mut config = SshConfigFile::parse_content(&content).map_err(|cause| SwapError::Parse {
        path: config_path.to_path_buf(),
        cause,
    })?;
    let summary = config.apply_intent(host, intent);

    let permissions = file
        .metadata()
        .map_err(|cause| SwapError::Stat {
            path: config_path.to_path_buf(),
            cause,
        })?
        .permissions();
    // Release the read handle before the file is replaced under it
    drop(file);

    // Commit to the path we were given, not whatever the handle resolved to
    atomic_write(config_path, &permissions, config.serialize().as_bytes())?;

    log::info!(
        "Updated {} for {}: {} block(s) matched, {} value(s) changed",
        config_path.display(),
        host,
        summary.blocks_matched,
        summary.values_changed
    );
    Ok(summary)
}

/// A config file and host pair that can be switched between identities.
#[derive(Debug, Clone)]
pub struct CredentialSwitcher {
    config_path: PathBuf,
    host: String,
}

impl CredentialSwitcher {
    pub fn new(config_path: impl Into<PathBuf>, host: impl Into<String>) -> Self {
        Self {
            config_path: config_path.into(),
            host: host.into(),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Install `intent` for this host.
    pub fn switch_to(&self, intent: &CredentialIntent) -> Result<RewriteSummary, SwapError> {
        log::debug!(
            "Switching {} to identity {:?} user {:?}",
            self.host,
            intent.identity_file,
            intent.username
        );
        set_host(&self.config_path, &self.host, intent)
    }
}
