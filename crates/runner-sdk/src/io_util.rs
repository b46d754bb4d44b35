use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// The string comparison semantics for file paths on this platform.
/// On Linux, paths are case-sensitive (ordinal). On macOS and Windows, they are
/// case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilePathComparison {
    CaseSensitive,
    CaseInsensitive,
}

#[cfg(target_os = "linux")]
pub const FILE_PATH_STRING_COMPARISON: FilePathComparison = FilePathComparison::CaseSensitive;
#[cfg(not(target_os = "linux"))]
pub const FILE_PATH_STRING_COMPARISON: FilePathComparison = FilePathComparison::CaseInsensitive;

/// File and path helpers.
pub struct IOUtil;

impl IOUtil {
    /// Read a file and deserialize it from JSON.
    pub fn load_object<T: DeserializeOwned>(path: &Path) -> Result<T> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read file '{}'", path.display()))?;
        let value = serde_json::from_str(&json)
            .with_context(|| format!("Failed to deserialize JSON from '{}'", path.display()))?;
        Ok(value)
    }

    /// Remove a directory tree. Missing directories are not an error.
    pub fn delete_directory(path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        fs::remove_dir_all(path)
            .with_context(|| format!("Failed to delete directory '{}'", path.display()))
    }

    /// Compare two path strings using the platform-appropriate case sensitivity.
    pub fn paths_equal(a: &str, b: &str) -> bool {
        match FILE_PATH_STRING_COMPARISON {
            FilePathComparison::CaseSensitive => a == b,
            FilePathComparison::CaseInsensitive => a.eq_ignore_ascii_case(b),
        }
    }

    /// Join `relative` onto `root` and collapse `.` and `..` segments without
    /// touching the filesystem. An absolute `relative` wins over `root`.
    pub fn resolve_path(root: &Path, relative: &str) -> PathBuf {
        Self::normalize(&root.join(relative))
    }

    /// Collapse `.` and `..` segments lexically.
    pub fn normalize(path: &Path) -> PathBuf {
        let mut out = PathBuf::new();
        for component in path.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    if !out.pop() {
                        out.push("..");
                    }
                }
                other => out.push(other.as_os_str()),
            }
        }
        out
    }

    /// Express `path` relative to `root` using `/` separators.
    ///
    /// Returns `None` when `path` is not `root` itself or a descendant of it.
    pub fn make_relative(path: &Path, root: &Path) -> Option<String> {
        let path = Self::normalize(path);
        let root = Self::normalize(root);
        let mut path_parts = path.components();
        for root_part in root.components() {
            let part = path_parts.next()?;
            let a = part.as_os_str().to_string_lossy();
            let b = root_part.as_os_str().to_string_lossy();
            if !Self::paths_equal(&a, &b) {
                return None;
            }
        }
        let rest: Vec<String> = path_parts
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(rest.join("/"))
    }

    /// Whether `path` equals `root` or lies beneath it.
    pub fn is_under(path: &Path, root: &Path) -> bool {
        Self::make_relative(path, root).is_some()
    }

    /// Replace `\` with `/`.
    pub fn to_forward_slashes(path: &str) -> String {
        path.replace('\\', "/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_path_collapses_dots() {
        let root = Path::new("/work/repo");
        assert_eq!(
            IOUtil::resolve_path(root, "src/../lib/./a.rs"),
            PathBuf::from("/work/repo/lib/a.rs")
        );
        assert_eq!(IOUtil::resolve_path(root, "/abs/file"), PathBuf::from("/abs/file"));
    }

    #[test]
    fn make_relative_inside_and_outside() {
        let root = Path::new("/work/repo");
        assert_eq!(
            IOUtil::make_relative(Path::new("/work/repo/src/main.rs"), root),
            Some("src/main.rs".to_string())
        );
        assert_eq!(IOUtil::make_relative(Path::new("/work/repo"), root), Some(String::new()));
        assert_eq!(IOUtil::make_relative(Path::new("/work/other/main.rs"), root), None);
        assert_eq!(IOUtil::make_relative(Path::new("/work"), root), None);
    }

    #[test]
    fn load_object_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("value.json");
        fs::write(&file, r#"{"a": 1}"#).unwrap();
        let value: serde_json::Value = IOUtil::load_object(&file).unwrap();
        assert_eq!(value["a"], 1);
        assert!(IOUtil::load_object::<serde_json::Value>(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn delete_missing_directory_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        IOUtil::delete_directory(&dir.path().join("nope")).unwrap();
        let nested = dir.path().join("a/b");
        fs::create_dir_all(&nested).unwrap();
        IOUtil::delete_directory(&dir.path().join("a")).unwrap();
        assert!(!nested.exists());
    }
}
