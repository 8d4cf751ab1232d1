use std::path::{Component, Path, PathBuf};
use std::fs;
use directories::ProjectDirs;
use crate::common::error::{RegistrationError, Result};

/// Picks the base directory that relative storage paths hang off.
#[derive(Debug, Clone)]
pub struct DevMode {
    enabled: bool,
    base_dir: PathBuf,
}

impl DevMode {
    pub fn new(enabled: bool) -> Result<Self> {
        let base_dir = if enabled {
            PathBuf::from("./dev_data")
        } else {
            let dirs = ProjectDirs::from("com", "attendface", "AttendFace")
                .ok_or_else(|| RegistrationError::Storage("Failed to get project dirs".into()))?;
            dirs.data_dir().to_path_buf()
        };

        let mode = Self::with_base_dir(enabled, base_dir)?;
        if enabled {
            tracing::info!("Development mode enabled - data will be saved to: {}",
                           mode.base_dir.display());
        }
        Ok(mode)
    }

    pub fn with_base_dir(enabled: bool, base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir)?;
        if enabled {
            fs::create_dir_all(base_dir.join("logs"))?;
            fs::create_dir_all(base_dir.join("debug"))?;
        }
        Ok(Self { enabled, base_dir })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            normalize(path)
        } else {
            normalize(&self.base_dir.join(path))
        }
    }

    /// Where comparison debug images go; only written in dev mode.
    pub fn get_debug_path(&self, prefix: &str) -> Option<PathBuf> {
        if !self.enabled {
            return None;
        }
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        Some(self.base_dir.join("debug").join(format!("{}_{}.jpg", prefix, timestamp)))
    }
}

/// Drop `.` and fold `..` without touching the filesystem.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                } else {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_paths_under_base() {
        let dir = tempfile::tempdir().unwrap();
        let mode = DevMode::with_base_dir(true, dir.path().to_path_buf()).unwrap();

        assert_eq!(mode.resolve(Path::new("faces/a.jpg")), dir.path().join("faces/a.jpg"));
        assert_eq!(mode.resolve(Path::new("/srv/a.jpg")), PathBuf::from("/srv/a.jpg"));
        assert!(dir.path().join("debug").is_dir());
        assert!(mode.get_debug_path("compare").is_some());
    }

    #[test]
    fn normalizes_dot_components() {
        assert_eq!(normalize(Path::new("./faces/./a.jpg")), PathBuf::from("faces/a.jpg"));
        assert_eq!(normalize(Path::new("/srv/x/../a.jpg")), PathBuf::from("/srv/a.jpg"));
        assert_eq!(normalize(Path::new("../a.jpg")), PathBuf::from("../a.jpg"));

        let mode = DevMode::with_base_dir(false, PathBuf::from("/tmp")).unwrap();
        assert_eq!(mode.resolve(Path::new("./faces/../a.jpg")), PathBuf::from("/tmp/a.jpg"));
    }

    #[test]
    fn no_debug_output_outside_dev_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mode = DevMode::with_base_dir(false, dir.path().to_path_buf()).unwrap();
        assert!(mode.get_debug_path("compare").is_none());
    }
}
