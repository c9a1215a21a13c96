//! Path validation and permission helpers.

use crate::error::{Result, SandboxError};
use std::path::{Component, Path, PathBuf};

/// Sets permissions on the sandbox root (Unix only).
///
/// Served artifacts must stay readable by the web process, so the root is
/// owner-writable and world-readable rather than private.
pub async fn set_sandbox_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        tokio::fs::set_permissions(path, perms)
            .await
            .map_err(|_e| SandboxError::Permission {
                operation: "set sandbox permissions".to_string(),
                path: path.to_path_buf(),
            })?;
    }

    #[cfg(not(unix))]
    {
        if !path.exists() {
            return Err(SandboxError::PathValidation {
                path: path.to_path_buf(),
                reason: "Directory does not exist".to_string(),
            });
        }
    }

    Ok(())
}

/// Validates a caller-supplied relative path and returns it normalised.
///
/// Any parent-directory segment is rejected outright, even one that would
/// resolve back inside the sandbox. `.` segments are dropped.
pub fn validate_relative_path(path: &str) -> Result<PathBuf> {
    let reject = |reason: &str| SandboxError::PathValidation {
        path: PathBuf::from(path),
        reason: reason.to_string(),
    };

    if path.is_empty() {
        return Err(reject("Path cannot be empty"));
    }
    if path.contains('\0') {
        return Err(reject("Path contains null bytes"));
    }
    // Backslashes are segment separators on Windows; treat them as such everywhere
    if path.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(reject("Path contains parent directory segments"));
    }

    let mut normalised = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => normalised.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(reject("Path contains parent directory segments"));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(reject("Absolute paths are not allowed"));
            }
        }
    }

    if normalised.as_os_str().is_empty() {
        return Err(reject("Path resolves to the sandbox root"));
    }

    Ok(normalised)
}

/// Validates that an existing path is within the sandbox once symlinks are resolved.
pub fn validate_path_within_sandbox(resolved_path: &Path, sandbox_base: &Path) -> Result<()> {
    let canonical_base =
        sandbox_base
            .canonicalize()
            .map_err(|e| SandboxError::PathValidation {
                path: sandbox_base.to_path_buf(),
                reason: format!("Failed to resolve sandbox base: {e}"),
            })?;

    let canonical_path =
        resolved_path
            .canonicalize()
            .map_err(|e| SandboxError::PathValidation {
                path: resolved_path.to_path_buf(),
                reason: format!("Failed to resolve path: {e}"),
            })?;

    if !canonical_path.starts_with(&canonical_base) {
        return Err(SandboxError::PathValidation {
            path: resolved_path.to_path_buf(),
            reason: format!(
                "Path escapes sandbox: resolves to '{}' (outside '{}')",
                canonical_path.display(),
                canonical_base.display()
            ),
        });
    }

    Ok(())
}
