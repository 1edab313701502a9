//! Workspace path confinement
//!
//! Every client-supplied path is normalized lexically and must land inside
//! `/workspace`. The container filesystem is never consulted; symlinked
//! escapes are prevented by the container mount layout, not by this check.

use crate::error::{DaemonError, Result};

/// Root of all file operations inside a container.
pub const WORKSPACE_ROOT: &str = "/workspace";

/// Normalize and confine a path to the workspace.
///
/// Relative paths are taken relative to `/workspace`. `.` and `..`
/// segments are collapsed; any path whose normalized form leaves the
/// workspace is rejected. Validation is idempotent: feeding a returned
/// path back in yields the same path.
pub fn validate_path(path: &str) -> Result<String> {
    if path.trim().is_empty() {
        return Err(security_error(path, "empty path"));
    }
    if path.contains('\0') {
        return Err(security_error(path, "path contains NUL"));
    }

    let absolute = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{WORKSPACE_ROOT}/{path}")
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in absolute.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(security_error(path, "path escapes the filesystem root"));
                }
            }
            other => segments.push(other),
        }
    }

    let normalized = format!("/{}", segments.join("/"));

    if normalized != WORKSPACE_ROOT && !normalized.starts_with(&format!("{WORKSPACE_ROOT}/")) {
        return Err(security_error(
            path,
            &format!("path escapes {WORKSPACE_ROOT}"),
        ));
    }

    Ok(normalized)
}

/// The parent directory of a normalized workspace path.
pub fn parent_dir(normalized: &str) -> String {
    match normalized.rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
    }
}

/// The final component of a normalized workspace path.
pub fn file_name(normalized: &str) -> &str {
    normalized.rsplit('/').next().unwrap_or(normalized)
}

fn security_error(path: &str, reason: &str) -> DaemonError {
    DaemonError::PathSecurity {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_paths_are_anchored() {
        assert_eq!(validate_path("notes.txt").unwrap(), "/workspace/notes.txt");
        assert_eq!(validate_path("a/b/c").unwrap(), "/workspace/a/b/c");
    }

    #[test]
    fn test_absolute_workspace_paths_pass() {
        assert_eq!(validate_path("/workspace").unwrap(), "/workspace");
        assert_eq!(
            validate_path("/workspace/src/main.rs").unwrap(),
            "/workspace/src/main.rs"
        );
    }

    #[test]
    fn test_dot_segments_collapse() {
        assert_eq!(
            validate_path("/workspace/./a/../b").unwrap(),
            "/workspace/b"
        );
        assert_eq!(validate_path("a/./b/..").unwrap(), "/workspace/a");
    }

    #[test]
    fn test_escapes_rejected() {
        assert!(validate_path("/workspace/../etc/passwd").is_err());
        assert!(validate_path("../x").is_err());
        assert!(validate_path("/etc/passwd").is_err());
        assert!(validate_path("a/../../..").is_err());
    }

    #[test]
    fn test_empty_and_nul_rejected() {
        assert!(validate_path("").is_err());
        assert!(validate_path("   ").is_err());
        assert!(validate_path("a\0b").is_err());
    }

    #[test]
    fn test_validation_is_idempotent() {
        for raw in ["notes.txt", "/workspace/a/./b", "a/b/../c"] {
            let once = validate_path(raw).unwrap();
            assert_eq!(validate_path(&once).unwrap(), once);
        }
    }

    #[test]
    fn test_parent_and_file_name() {
        assert_eq!(parent_dir("/workspace/a/b"), "/workspace/a");
        assert_eq!(parent_dir("/workspace/a"), "/workspace");
        assert_eq!(file_name("/workspace/a/b.txt"), "b.txt");
    }
}
