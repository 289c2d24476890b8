/*!
 * Pidfile management
 */

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Result, ServerError};

/// Write `pid` as one line, exclusively: a live pidfile means another
/// instance owns the path
pub fn create(path: &Path, pid: u32) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|source| ServerError::Pidfile {
            path: path.to_path_buf(),
            source,
        })?;

    writeln!(file, "{}", pid).map_err(|source| ServerError::Pidfile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Remove the pidfile; a missing file is not an error
pub fn delete(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::error!(path = %path.display(), "could not delete pidfile: {}", e);
        }
    }
}

/// Sibling path holding the upgrading binary's pid during handoff
pub fn newbin_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".newbin");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_writes_one_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pulsar.pid");

        create(&path, 12345).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "12345\n");
    }

    #[test]
    fn test_create_is_exclusive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pulsar.pid");

        create(&path, 1).unwrap();
        let err = create(&path, 2).unwrap_err();
        assert!(matches!(err, ServerError::Pidfile { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pulsar.pid");

        create(&path, 1).unwrap();
        delete(&path);
        assert!(!path.exists());
        delete(&path); // second delete must not blow up
    }

    #[test]
    fn test_newbin_path() {
        assert_eq!(
            newbin_path(Path::new("/run/pulsar.pid")),
            PathBuf::from("/run/pulsar.pid.newbin")
        );
    }
}
