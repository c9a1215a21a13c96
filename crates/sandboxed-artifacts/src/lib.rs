//! # Sandboxed Artifacts
//!
//! A directory tree for cached artifacts where every caller-supplied path is
//! validated before it reaches the filesystem, and where writes and removals
//! are atomic from a reader's point of view.
//!
//! ## Features
//!
//! - **Traversal-safe paths**: empty, absolute, null-byte and `..` paths are rejected
//! - **Atomic writes**: data lands in a temporary sibling and is renamed into place
//! - **Atomic removals**: trees are renamed into a trash directory before deletion
//! - **Partial files**: streamed downloads use a `.part` sibling until promoted
//! - **Sizing**: recursive byte counts for a subtree
//! - **Quota policy**: a byte ceiling plus a lower target used by eviction
//!
//! ## Basic Usage
//!
//! ```rust
//! use sandboxed_artifacts::{ArtifactSandbox, QuotaPolicy};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let sandbox = ArtifactSandbox::builder()
//!     .base_directory("/var/cache/pointclouds")
//!     .quota_policy(QuotaPolicy::new(50 * 1024 * 1024 * 1024).target_ratio(0.8))
//!     .build()
//!     .await?;
//!
//! sandbox.write_atomic("converted/0042_0017/metadata.json", b"{}").await?;
//! let bytes = sandbox.dir_size("converted/0042_0017").await?;
//! assert_eq!(bytes, 2);
//!
//! sandbox.remove_dir_atomic("converted/0042_0017").await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod manager;
pub mod policy;
pub mod security;

pub use error::{Result, SandboxError};
pub use manager::{ArtifactSandbox, ArtifactSandboxBuilder, TRASH_DIR};
pub use policy::QuotaPolicy;
pub use security::validate_relative_path;
