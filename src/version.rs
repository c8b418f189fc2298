use anyhow::{Context, Result};
use std::path::Path;

use crate::error::PatchError;

/// Name of the plain-text version marker at an install root.
pub const VERSION_FILE: &str = "VERSION";

/// Installed version, or `None` when the marker is missing or not an integer.
pub fn read_version(dir: &Path) -> Option<u32> {
    match try_read_version(dir) {
        Ok(v) => Some(v),
        Err(e) => {
            log::info!("{e:#}");
            None
        }
    }
}

/// Like [`read_version`] but keeps the reason.
pub fn try_read_version(dir: &Path) -> Result<u32> {
    let path = dir.join(VERSION_FILE);
    let content = std::fs::read_to_string(&path)
        .map_err(|e| anyhow::Error::new(e).context(PatchError::UnreadableVersion(path.clone())))?;
    let parsed = content.trim().parse::<u32>();
    match parsed {
        Ok(version) => Ok(version),
        Err(_) => Err(PatchError::InvalidVersion { path, content }.into()),
    }
}

pub fn write_version(dir: &Path, version: u32) -> Result<()> {
    let path = dir.join(VERSION_FILE);
    std::fs::write(&path, version.to_string())
        .with_context(|| format!("Failed to write version marker: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_trimmed_integer() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(VERSION_FILE), "57\r\n").unwrap();
        assert_eq!(read_version(dir.path()), Some(57));
    }

    #[test]
    fn missing_marker_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_version(dir.path()), None);
        let err = try_read_version(dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PatchError>(),
            Some(PatchError::UnreadableVersion(_))
        ));
    }

    #[test]
    fn garbage_marker_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        for bad in ["", "v12", "-3", "1.5"] {
            std::fs::write(dir.path().join(VERSION_FILE), bad).unwrap();
            assert_eq!(read_version(dir.path()), None, "{bad:?}");
        }
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        write_version(dir.path(), 9).unwrap();
        assert_eq!(read_version(dir.path()), Some(9));
    }
}
