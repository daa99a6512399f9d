use std::path::{Path, PathBuf};
use tracing::debug;

use super::{FileSource, SourceCommon, SourceKind};
use crate::error::Result;
use crate::storage::CacheStorage;

const FILE_SCHEME: &str = "file://";

fn file_url(path: &Path) -> String {
    format!("{}{}", FILE_SCHEME, path.display())
}

fn path_of(url: &str) -> Option<PathBuf> {
    url.strip_prefix(FILE_SCHEME)
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
}

/// A file the user points at on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct UserSource {
    pub(crate) common: SourceCommon,
}

impl UserSource {
    pub fn new(common: SourceCommon) -> Self {
        Self { common }
    }

    /// The placeholder every file gets when its script names no user source.
    pub fn placeholder() -> Self {
        Self::new(SourceCommon::new("user", "N/A"))
    }

    pub fn set_path(&mut self, path: impl AsRef<Path>) {
        self.common.url = file_url(path.as_ref());
    }

    pub fn local_path(&self) -> Option<PathBuf> {
        path_of(&self.common.url)
    }
}

impl FileSource for UserSource {
    fn common(&self) -> &SourceCommon {
        &self.common
    }

    fn kind(&self) -> SourceKind {
        SourceKind::User
    }

    fn is_available(&self) -> bool {
        self.local_path().is_some_and(|path| path.exists())
    }
}

/// A local copy of the file, either in the durable cache or written during a probe.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSource {
    pub(crate) common: SourceCommon,
    durable: bool,
}

impl CacheSource {
    /// An entry already present in the durable cache.
    pub fn durable(source_id: impl Into<String>, path: &Path) -> Self {
        Self {
            common: SourceCommon::new(source_id, file_url(path)),
            durable: true,
        }
    }

    /// Writes `buffer` to `temp_path` and promotes it to `final_path`.
    pub fn from_memory(
        source_id: impl Into<String>,
        buffer: &[u8],
        temp_path: &Path,
        final_path: &Path,
        checksum: Option<String>,
        storage: &dyn CacheStorage,
    ) -> Result<Self> {
        if let Some(parent) = temp_path.parent() {
            storage.create_dir_all(parent)?;
        }
        std::fs::write(temp_path, buffer)?;
        storage.store(temp_path, final_path)?;
        debug!(
            "Kept {} probe bytes as local copy {:?}",
            buffer.len(),
            final_path
        );

        let mut common = SourceCommon::new(source_id, file_url(final_path));
        common.checksum = checksum;
        common.size = Some(buffer.len() as u64);
        Ok(Self {
            common,
            durable: false,
        })
    }

    /// True for durable cache entries, false for copies made mid-probe.
    pub fn is_pga_cache(&self) -> bool {
        self.durable
    }

    pub fn local_path(&self) -> Option<PathBuf> {
        path_of(&self.common.url)
    }
}

impl FileSource for CacheSource {
    fn common(&self) -> &SourceCommon {
        &self.common
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Cache
    }

    fn is_available(&self) -> bool {
        self.local_path().is_some_and(|path| path.exists())
    }
}
