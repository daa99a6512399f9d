use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid source id `{source_id}`")]
    InvalidSourceId { source_id: String },

    #[error("no available source found for {file}, yet the download process was started")]
    NoAvailableSource { file: String },

    #[error("{algorithm} checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        algorithm: String,
        expected: String,
        actual: String,
    },

    #[error("invalid checksum `{value}`, expected format (type:hash)")]
    InvalidChecksum { value: String },

    #[error("unsupported checksum algorithm `{algorithm}`")]
    UnsupportedChecksum { algorithm: String },

    #[error("probe failed for {url}: {message}")]
    Probe {
        url: String,
        message: String,
        code: Option<u16>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("unsupported source url `{url}`")]
    UnsupportedSource { url: String },

    #[error("missing field `url` for source `{source_id}` of file `{file}`")]
    MissingUrl { file: String, source_id: String },

    #[error("missing field `filename` in file `{file}`")]
    MissingFilename { file: String },

    #[error("cache source already exists for {file}")]
    DuplicateCacheSource { file: String },

    #[error("unsupported provider `{provider}`")]
    UnsupportedProvider { provider: String },

    #[error("{kind} sources are resolved by an external client")]
    ExternalSource { kind: &'static str },

    #[error("file not found: {path:?}")]
    FileNotFound { path: PathBuf },

    #[error("job `{name}` panicked: {message}")]
    JobPanicked { name: String, message: String },

    #[error("HTTP request failed: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
