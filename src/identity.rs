//! Client Identity Store
//!
//! The identity is the dedup key on the server, so it must survive client
//! restarts. It lives in a small file next to the game; the first run
//! creates it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// Default identity file name.
pub const DEFAULT_IDENTITY_FILE: &str = ".clientid";

/// Identity file errors.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Reading the identity file failed.
    #[error("failed to read identity file {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Writing a fresh identity failed.
    #[error("failed to write identity file {path}: {source}")]
    Write {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Fresh random identity: 32 lowercase hex characters.
pub fn generate_identity() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Read the identity stored at `path`, creating one if the file is missing
/// or blank.
pub fn load_or_create_identity(path: impl AsRef<Path>) -> Result<String, IdentityError> {
    let path = path.as_ref();

    match fs::read_to_string(path) {
        Ok(contents) => {
            let identity = contents.trim();
            if !identity.is_empty() {
                return Ok(identity.to_string());
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => return Err(IdentityError::Read { path: path.to_path_buf(), source }),
    }

    let identity = generate_identity();
    write_private(path, &identity)
        .map_err(|source| IdentityError::Write { path: path.to_path_buf(), source })?;
    info!("Created client identity in {}", path.display());

    Ok(identity)
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &str) -> io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // `mode` only applies on creation; a pre-existing blank file keeps its bits.
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    file.write_all(contents.as_bytes())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &str) -> io::Result<()> {
    fs::write(path, contents)
}
