/// Locator for the sleep-prevention executable.
///
/// The platform binary lives at one well-known path; a missing binary is a
/// startup failure and no alternate paths are ever searched. Tests and
/// embedders may inject a different path at construction.
use std::path::{Path, PathBuf};

/// Well-known location of the caffeinate binary.
pub const CAFFEINATE_PATH: &str = "/usr/bin/caffeinate";

/// Handle to the external executable the session spawns.
#[derive(Debug, Clone)]
pub struct Executable {
    path: PathBuf,
}

impl Executable {
    /// The platform caffeinate binary at its fixed path.
    pub fn caffeinate() -> Self {
        Self {
            path: PathBuf::from(CAFFEINATE_PATH),
        }
    }

    /// An executable at an explicitly injected path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path the session will spawn.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the executable is present on disk.
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }
}

impl Default for Executable {
    fn default() -> Self {
        Self::caffeinate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_points_at_fixed_path() {
        let exec = Executable::default();
        assert_eq!(exec.path(), Path::new(CAFFEINATE_PATH));
    }

    #[test]
    fn test_missing_executable_does_not_exist() {
        let exec = Executable::at("/nonexistent-dir/no-such-binary");
        assert!(!exec.exists());
    }

    #[test]
    fn test_injected_path_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake-caffeinate");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        let exec = Executable::at(&path);
        assert!(exec.exists());
        assert_eq!(exec.path(), path.as_path());
    }

    #[test]
    fn test_directory_is_not_an_executable() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Executable::at(dir.path());
        assert!(!exec.exists());
    }
}
