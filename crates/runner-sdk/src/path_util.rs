use crate::io_util::IOUtil;

/// PATH environment variable name (platform-specific).
#[cfg(target_os = "windows")]
pub const PATH_VARIABLE: &str = "Path";
#[cfg(not(target_os = "windows"))]
pub const PATH_VARIABLE: &str = "PATH";

/// Helpers for composing PATH values.
pub struct PathUtil;

impl PathUtil {
    /// The platform-specific PATH entry separator.
    pub fn path_separator() -> char {
        if cfg!(target_os = "windows") {
            ';'
        } else {
            ':'
        }
    }

    /// Build a PATH value with `prepend` entries in front of `current`.
    ///
    /// `prepend` is ordered oldest first, so the most recently added entry
    /// ends up leftmost. Entries already present in `prepend` are not repeated.
    pub fn build_path(prepend: &[String], current: &str) -> String {
        let mut entries: Vec<&str> = Vec::with_capacity(prepend.len() + 1);
        for entry in prepend.iter().rev() {
            if entry.is_empty() || entries.iter().any(|e| IOUtil::paths_equal(e, entry)) {
                continue;
            }
            entries.push(entry);
        }
        if !current.is_empty() {
            entries.push(current);
        }
        entries.join(&Self::path_separator().to_string())
    }
}
