use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use super::model::{ConfigElement, SshConfigFile};

/// Temp file names tried before giving up on finding a free one.
const TEMP_ATTEMPTS: u32 = 16;

/// Failure while replacing a file. The target is untouched in every case.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("creating temp file {}: {cause}", .path.display())]
    CreateTemp { path: PathBuf, cause: io::Error },
    #[error("writing temp file {}: {cause}", .path.display())]
    WriteTemp { path: PathBuf, cause: io::Error },
    #[error("renaming {} to {}: {cause}", .from.display(), .to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        cause: io::Error,
    },
}

impl WriteError {
    /// Whether the data was fully written and only the final rename failed.
    pub fn is_commit(&self) -> bool {
        matches!(self, WriteError::Rename { .. })
    }
}

impl SshConfigFile {
    /// Serialize the config to a string.
    pub fn serialize(&self) -> String {
        let mut lines: Vec<&str> = Vec::new();

        for element in &self.elements {
            match element {
                ConfigElement::GlobalLine(line) => lines.push(line),
                ConfigElement::Block(block) => {
                    lines.push(&block.raw_header_line);
                    lines.extend(block.directives.iter().map(|d| d.raw_line()));
                }
            }
        }

        let eol = if self.crlf { "\r\n" } else { "\n" };
        let mut result = lines.join(eol);
        if self.trailing_newline {
            result.push_str(eol);
        }
        result
    }
}

/// Replace `path` with `content`: write a temp file in the same directory, then rename it over.
pub fn atomic_write(path: &Path, permissions: &Permissions, content: &[u8]) -> Result<(), WriteError> {
    atomic_write_with(path, permissions, |file| file.write_all(content))
}

/// Like [`atomic_write`], with the body of the temp file produced by `write`.
/// If `write` fails, the temp file is removed and `path` is left as it was.
pub fn atomic_write_with<F>(path: &Path, permissions: &Permissions, write: F) -> Result<(), WriteError>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let (tmp_path, mut file) = create_temp(path)?;

    // Permissions go on last so a read-only mode can't get in the way of the write
    let result = write(&mut file)
        .and_then(|()| file.sync_all())
        .and_then(|()| file.set_permissions(permissions.clone()));
    drop(file);
    if let Err(cause) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(WriteError::WriteTemp {
            path: tmp_path,
            cause,
        });
    }

    if let Err(cause) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(WriteError::Rename {
            from: tmp_path,
            to: path.to_path_buf(),
            cause,
        });
    }

    log::debug!("Committed {}", path.display());
    Ok(())
}

/// Hidden sibling of `path`, so the rename never crosses a filesystem.
/// Retries get a numeric suffix.
fn temp_path(path: &Path, attempt: u32) -> PathBuf {
    let name = path.file_name().unwrap_or_default().to_string_lossy();
    let pid = std::process::id();
    if attempt == 0 {
        path.with_file_name(format!(".{}.swap-tmp.{}", name, pid))
    } else {
        path.with_file_name(format!(".{}.swap-tmp.{}.{}", name, pid, attempt))
    }
}

/// Create a new temp file next to `path`. An existing file or symlink under the
/// chosen name is never opened; the next name is tried instead.
fn create_temp(path: &Path) -> Result<(PathBuf, File), WriteError> {
    let mut attempt = 0;
    loop {
        let tmp_path = temp_path(path, attempt);
        match open_new(&tmp_path) {
            Ok(file) => return Ok((tmp_path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && attempt + 1 < TEMP_ATTEMPTS => {
                log::debug!("{} already exists, trying another name", tmp_path.display());
                attempt += 1;
            }
            Err(cause) => {
                return Err(WriteError::CreateTemp {
                    path: tmp_path,
                    cause,
                });
            }
        }
    }
}

#[cfg(unix)]
fn open_new(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    // Private until the final permissions are applied
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_new(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}
