pub mod checksum;
pub mod engine;
pub mod progress;

pub use checksum::{ChecksumSpec, ChecksumType, ChecksumVerifier};
pub use engine::{
    EngineSettings, HttpTransfer, HttpTransferEngine, Transfer, TransferEngine, TransferState,
};
pub use progress::{ProgressFormatter, TransferProgress};

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: String,
    pub referer: Option<String>,
    pub resume: bool,
}

impl TransferRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            referer: None,
            resume: true,
        }
    }

    pub fn with_referer(mut self, referer: Option<String>) -> Self {
        self.referer = referer;
        self
    }

    /// Filesystem path for `file://` URLs.
    pub fn local_path(&self) -> Option<&str> {
        self.url.strip_prefix("file://")
    }
}
