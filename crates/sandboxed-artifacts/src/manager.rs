//! Core artifact sandbox implementation.

use crate::{
    error::{Result, SandboxError},
    policy::QuotaPolicy,
    security::{set_sandbox_permissions, validate_path_within_sandbox, validate_relative_path},
};

use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Directory (relative to the base) that holds entries pending deletion.
pub const TRASH_DIR: &str = ".trash";

/// A directory tree whose every path is resolved through traversal checks.
///
/// Removals are rename-then-delete so that a reader either sees the whole
/// entry or nothing at all; writes go through a temporary sibling and a
/// rename for the same reason.
#[derive(Clone, Debug)]
pub struct ArtifactSandbox {
    base_dir: PathBuf,
    quota: QuotaPolicy,
}

impl ArtifactSandbox {
    /// Create a new builder for configuring the sandbox.
    #[must_use]
    pub fn builder() -> ArtifactSandboxBuilder {
        ArtifactSandboxBuilder::new()
    }

    /// Root directory of the sandbox.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Quota policy the sandbox was built with.
    pub fn quota(&self) -> &QuotaPolicy {
        &self.quota
    }

    /// Resolve a relative path to an absolute path inside the sandbox.
    ///
    /// # Errors
    /// Returns `PathValidation` for empty, absolute, null-byte or `..` paths
    /// and for paths into the trash directory.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let normalised = validate_relative_path(relative)?;
        if normalised.starts_with(TRASH_DIR) {
            return Err(SandboxError::PathValidation {
                path: normalised,
                reason: "Path refers to the sandbox trash".to_string(),
            });
        }
        Ok(self.base_dir.join(normalised))
    }

    /// Resolve a path that must already exist, following symlinks.
    ///
    /// # Errors
    /// Returns `NotFound` if nothing exists at the path, or `PathValidation`
    /// if it resolves outside the sandbox.
    pub async fn resolve_existing(&self, relative: &str) -> Result<PathBuf> {
        let path = self.resolve(relative)?;
        if !fs::try_exists(&path).await? {
            return Err(SandboxError::NotFound { path });
        }
        validate_path_within_sandbox(&path, &self.base_dir)?;
        Ok(path)
    }

    /// Whether anything exists at the path.
    pub async fn exists(&self, relative: &str) -> Result<bool> {
        let path = self.resolve(relative)?;
        Ok(fs::try_exists(&path).await?)
    }

    /// Size of a regular file, or `None` if it does not exist.
    pub async fn file_size(&self, relative: &str) -> Result<Option<u64>> {
        let path = self.resolve(relative)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Total bytes of all regular files below a path. Missing paths count as zero.
    ///
    /// Symlinks are not followed.
    pub async fn dir_size(&self, relative: &str) -> Result<u64> {
        let path = self.resolve(relative)?;
        tree_size(&path).await
    }

    /// Sibling path used while a file is being streamed in.
    ///
    /// The parent directory is created so callers can open the file directly.
    pub async fn partial_path(&self, relative: &str) -> Result<PathBuf> {
        let path = self.resolve(relative)?;
        ensure_parent(&path).await?;
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".part");
        Ok(path.with_file_name(name))
    }

    /// Move a completed partial file into its final place.
    pub async fn promote_partial(&self, relative: &str) -> Result<PathBuf> {
        let target = self.resolve(relative)?;
        let partial = self.partial_path(relative).await?;
        fs::rename(&partial, &target).await?;
        Ok(target)
    }

    /// Write a file by writing a temporary sibling and renaming it into place.
    pub async fn write_atomic<C: AsRef<[u8]>>(&self, relative: &str, contents: C) -> Result<PathBuf> {
        let target = self.resolve(relative)?;
        ensure_parent(&target).await?;

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = target.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

        if let Err(e) = fs::write(&temp, contents.as_ref()).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(target)
    }

    /// Remove a single file. Returns `false` if it did not exist.
    pub async fn remove_file(&self, relative: &str) -> Result<bool> {
        let path = self.resolve(relative)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a directory tree so that it disappears in a single rename.
    ///
    /// The tree is moved into the trash first and deleted afterwards; a
    /// failed deletion leaves garbage in the trash but never a half-removed
    /// entry at the original path. Returns `false` if nothing existed.
    pub async fn remove_dir_atomic(&self, relative: &str) -> Result<bool> {
        let path = self.resolve(relative)?;
        if !fs::try_exists(&path).await? {
            return Ok(false);
        }

        let trash = self.base_dir.join(TRASH_DIR);
        fs::create_dir_all(&trash).await?;
        let tombstone = trash.join(uuid::Uuid::new_v4().to_string());
        fs::rename(&path, &tombstone).await?;

        let result = if fs::metadata(&tombstone).await?.is_dir() {
            fs::remove_dir_all(&tombstone).await
        } else {
            fs::remove_file(&tombstone).await
        };
        if let Err(e) = result {
            warn!(
                "Moved {} to trash but failed to delete it: {}",
                path.display(),
                e
            );
        }

        debug!("Removed sandbox entry {}", path.display());
        Ok(true)
    }

    /// Delete anything left in the trash by an interrupted removal.
    pub async fn purge_trash(&self) -> Result<usize> {
        let trash = self.base_dir.join(TRASH_DIR);
        if !fs::try_exists(&trash).await? {
            return Ok(0);
        }

        let mut purged = 0;
        let mut entries = fs::read_dir(&trash).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let result = if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };
            match result {
                Ok(()) => purged += 1,
                Err(e) => warn!("Failed to purge trash entry {}: {}", path.display(), e),
            }
        }
        Ok(purged)
    }

    /// Names of the immediate subdirectories of a directory.
    pub async fn list_dirs(&self, relative: &str) -> Result<Vec<String>> {
        let path = self.resolve(relative)?;
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| SandboxError::DirectoryCreation {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    Ok(())
}

async fn tree_size(root: &Path) -> Result<u64> {
    let meta = match fs::symlink_metadata(root).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    if meta.is_file() {
        return Ok(meta.len());
    }
    if !meta.is_dir() {
        return Ok(0);
    }

    let mut total = 0u64;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            // Removed concurrently
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                match entry.metadata().await {
                    Ok(meta) => total = total.saturating_add(meta.len()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
    Ok(total)
}

/// Builder for [`ArtifactSandbox`].
#[derive(Debug, Default)]
pub struct ArtifactSandboxBuilder {
    base_dir: Option<PathBuf>,
    quota: Option<QuotaPolicy>,
}

impl ArtifactSandboxBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base directory (required).
    pub fn base_directory<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.base_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the quota policy. Defaults to [`QuotaPolicy::default`].
    pub fn quota_policy(mut self, policy: QuotaPolicy) -> Self {
        self.quota = Some(policy);
        self
    }

    /// Create the base directory and clear leftovers from interrupted removals.
    ///
    /// # Errors
    /// Returns `Configuration` if no base directory was set, or an I/O error
    /// if the directory cannot be created.
    pub async fn build(self) -> Result<ArtifactSandbox> {
        let base_dir = self.base_dir.ok_or_else(|| SandboxError::Configuration {
            message: "Base directory is required".to_string(),
        })?;

        fs::create_dir_all(&base_dir)
            .await
            .map_err(|source| SandboxError::DirectoryCreation {
                path: base_dir.clone(),
                source,
            })?;
        set_sandbox_permissions(&base_dir).await?;

        let sandbox = ArtifactSandbox {
            base_dir: base_dir.canonicalize()?,
            quota: self.quota.unwrap_or_default(),
        };

        let purged = sandbox.purge_trash().await?;
        if purged > 0 {
            debug!("Purged {} leftover trash entries", purged);
        }

        Ok(sandbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sandbox(dir: &Path) -> ArtifactSandbox {
        ArtifactSandbox::builder()
            .base_directory(dir)
            .quota_policy(QuotaPolicy::new(1024))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_builder_requires_base_directory() {
        let result = ArtifactSandbox::builder().build().await;
        assert!(matches!(result, Err(SandboxError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_write_atomic_and_sizes() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let temp = tempfile::tempdir()?;
        let sandbox = sandbox(temp.path()).await;

        sandbox.write_atomic("tile/a.bin", b"12345").await?;
        sandbox.write_atomic("tile/nested/b.bin", b"123").await?;

        assert_eq!(sandbox.file_size("tile/a.bin").await?, Some(5));
        assert_eq!(sandbox.file_size("tile/missing.bin").await?, None);
        assert_eq!(sandbox.dir_size("tile").await?, 8);
        assert_eq!(sandbox.dir_size("nothing-here").await?, 0);

        // No temporary siblings are left behind
        let mut names = Vec::new();
        let mut entries = fs::read_dir(temp.path().join("tile")).await?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        assert_eq!(names, vec!["a.bin", "nested"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_dir_atomic() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let temp = tempfile::tempdir()?;
        let sandbox = sandbox(temp.path()).await;

        sandbox.write_atomic("converted/0001_0002/metadata.json", b"{}").await?;
        assert!(sandbox.remove_dir_atomic("converted/0001_0002").await?);
        assert!(!sandbox.exists("converted/0001_0002").await?);
        assert!(!sandbox.remove_dir_atomic("converted/0001_0002").await?);

        // Trash is emptied after a successful removal
        let trash = temp.path().join(TRASH_DIR);
        let mut entries = fs::read_dir(&trash).await?;
        assert!(entries.next_entry().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_partial_promotion() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let temp = tempfile::tempdir()?;
        let sandbox = sandbox(temp.path()).await;

        let partial = sandbox.partial_path("raw/0001_0002/tile.laz").await?;
        assert!(partial.to_string_lossy().ends_with("tile.laz.part"));
        fs::write(&partial, b"laz").await?;

        let final_path = sandbox.promote_partial("raw/0001_0002/tile.laz").await?;
        assert!(final_path.exists());
        assert!(!partial.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_traversal_and_trash() {
        let temp = tempfile::tempdir().unwrap();
        let sandbox = sandbox(temp.path()).await;

        assert!(sandbox.resolve("../escape").is_err());
        assert!(sandbox.resolve("a/../../escape").is_err());
        assert!(sandbox.resolve(".trash/anything").is_err());
        assert!(sandbox.write_atomic("/etc/passwd", b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_build_purges_leftover_trash() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let temp = tempfile::tempdir()?;
        std::fs::create_dir_all(temp.path().join(TRASH_DIR).join("stale"))?;
        std::fs::write(temp.path().join(TRASH_DIR).join("stale/file"), b"x")?;

        let _sandbox = sandbox(temp.path()).await;
        assert!(!temp.path().join(TRASH_DIR).join("stale").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_list_dirs() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let temp = tempfile::tempdir()?;
        let sandbox = sandbox(temp.path()).await;
        sandbox.write_atomic("converted/0002_0001/metadata.json", b"{}").await?;
        sandbox.write_atomic("converted/0001_0001/metadata.json", b"{}").await?;
        sandbox.write_atomic("converted/file.txt", b"x").await?;

        assert_eq!(
            sandbox.list_dirs("converted").await?,
            vec!["0001_0001".to_string(), "0002_0001".to_string()]
        );
        assert!(sandbox.list_dirs("absent").await?.is_empty());
        Ok(())
    }
}
