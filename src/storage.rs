use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::download::ChecksumVerifier;
use crate::error::{Error, Result};

/// Everything the acquisition core needs from the filesystem and cache layout.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Moves a finished temporary file to its final location.
    fn store(&self, temp_path: &Path, final_path: &Path) -> Result<()>;

    fn path_exists(&self, path: &Path) -> bool;

    /// Fails with `ChecksumMismatch` when the file does not match.
    async fn verify_checksum(&self, path: &Path, algorithm: &str, expected_hex: &str)
    -> Result<()>;

    /// Copies `path` into `cache_dir` under the same file name.
    fn save_to_cache(&self, path: &Path, cache_dir: &Path) -> Result<PathBuf>;

    /// Deletes a file or directory tree.
    fn remove(&self, path: &Path) -> Result<()>;

    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Name of the first file found in `dir`, if any.
    fn first_file_name(&self, dir: &Path) -> Option<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FsCacheStorage;

#[async_trait]
impl CacheStorage for FsCacheStorage {
    fn store(&self, temp_path: &Path, final_path: &Path) -> Result<()> {
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }

        if let Err(rename_error) = fs::rename(temp_path, final_path) {
            // Renames fail across filesystems
            debug!(
                "Rename {:?} -> {:?} failed ({}), copying instead",
                temp_path, final_path, rename_error
            );
            if let Err(copy_error) = fs::copy(temp_path, final_path) {
                warn!(
                    "Copy {:?} -> {:?} failed after rename failed: {}",
                    temp_path, final_path, copy_error
                );
                return Err(copy_error.into());
            }
            if let Err(e) = fs::remove_file(temp_path) {
                warn!("Failed to remove temporary file {:?}: {}", temp_path, e);
            }
        }
        Ok(())
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    async fn verify_checksum(
        &self,
        path: &Path,
        algorithm: &str,
        expected_hex: &str,
    ) -> Result<()> {
        if !path.exists() {
            return Err(Error::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        ChecksumVerifier::verify_file(path, algorithm, expected_hex).await
    }

    fn save_to_cache(&self, path: &Path, cache_dir: &Path) -> Result<PathBuf> {
        let file_name = path.file_name().ok_or_else(|| Error::FileNotFound {
            path: path.to_path_buf(),
        })?;
        let target = cache_dir.join(file_name);
        if target == path {
            return Ok(target);
        }

        fs::create_dir_all(cache_dir)?;
        fs::copy(path, &target)?;
        debug!("Saved {:?} to cache {:?}", path, cache_dir);
        Ok(target)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        if path.is_dir() {
            fs::remove_dir_all(path)?;
        } else if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn first_file_name(&self, dir: &Path) -> Option<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .ok()?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names.into_iter().next()
    }
}
