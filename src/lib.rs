pub mod acquisition;
pub mod config;
pub mod download;
pub mod error;
pub mod jobs;
pub mod source;
pub mod storage;

// Re-export commonly used types for easier access in tests
pub use acquisition::{
    AcquisitionEvent, AcquisitionSettings, EventBus, FileAcquisition, InstallScope,
    ProbeSettings, Provider, SELECT_AUTO_AVAILABLE, SELECT_INIT,
};
pub use config::ConfigManager;
pub use download::{ChecksumVerifier, HttpTransferEngine, TransferEngine, TransferRequest};
pub use error::{Error, Result};
pub use jobs::{ControlHandle, ControlLoop, JobContext, JobScheduler, StopToken};
pub use source::{
    Availability, FileSource, FileSpec, Source, SourceDescriptor, SourceKind, Speed,
};
pub use storage::{CacheStorage, FsCacheStorage};
