use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::info;

use super::FileAcquisition;
use crate::download::{TransferEngine, TransferProgress, TransferRequest};
use crate::error::{Error, Result};
use crate::jobs::{StopToken, checkpoint};
use crate::source::{FileSource, Source};

impl FileAcquisition {
    /// Gets the file from the active source and verifies it. Returns where it
    /// ended up.
    ///
    /// Downloads go to [`download_file`](Self::download_file) first and are
    /// moved to [`dest_file`](Self::dest_file) once complete. Local sources are
    /// used in place.
    pub async fn fetch(
        &self,
        engine: &dyn TransferEngine,
        stop: &StopToken,
        progress: Option<&mpsc::UnboundedSender<TransferProgress>>,
    ) -> Result<PathBuf> {
        checkpoint(stop)?;

        let request = match self.active_source() {
            Source::Steam(_) => return Err(Error::ExternalSource { kind: "Steam" }),
            Source::Cache(cache) => {
                let path = local_or_missing(cache.local_path(), cache.url())?;
                self.verify_at(&path).await?;
                return Ok(path);
            }
            Source::User(user) => {
                let path = local_or_missing(user.local_path(), user.url())?;
                self.verify_at(&path).await?;
                return Ok(path);
            }
            Source::Download(download) => {
                TransferRequest::new(self.url()).with_referer(download.referer().map(str::to_string))
            }
        };

        self.prepare()?;
        self.remove_previous()?;
        let download_file = self.download_file()?;
        let dest = self.dest_file()?;

        info!("Downloading {} to {:?}", request.url, dest);
        engine
            .download_to(&request, &download_file, stop, progress)
            .await?;
        checkpoint(stop)?;

        self.storage().store(&download_file, &dest)?;
        self.check_hash().await?;
        Ok(dest)
    }
}

fn local_or_missing(path: Option<PathBuf>, url: &str) -> Result<PathBuf> {
    match path {
        Some(path) if path.exists() => Ok(path),
        Some(path) => Err(Error::FileNotFound { path }),
        None => Err(Error::FileNotFound {
            path: PathBuf::from(url),
        }),
    }
}
