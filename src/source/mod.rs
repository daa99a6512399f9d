pub mod download;
pub mod local;
pub mod restricted;
pub mod steam;

pub use download::DownloadSource;
pub use local::{CacheSource, UserSource};
pub use restricted::RestrictedDomains;
pub use steam::SteamSource;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::download::ChecksumSpec;
use crate::error::{Error, Result};

/// Source ids starting with this are reserved for selection keywords.
pub const RESERVED_ID_PREFIX: char = '|';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    Download,
    User,
    Steam,
    Cache,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Download => write!(f, "Download"),
            SourceKind::User => write!(f, "User"),
            SourceKind::Steam => write!(f, "Steam"),
            SourceKind::Cache => write!(f, "Cache"),
        }
    }
}

/// Reachability of a download source, as last measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Availability {
    #[default]
    Unknown,
    Reachable,
    Unreachable,
    NetworkError,
}

impl Availability {
    pub fn is_reachable(self) -> bool {
        matches!(self, Availability::Reachable)
    }

    /// Known not to be reachable, as opposed to not checked yet.
    pub fn is_confirmed_down(self) -> bool {
        matches!(self, Availability::Unreachable | Availability::NetworkError)
    }
}

/// Result of a speed test.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Speed {
    #[default]
    Untested,
    /// Tested, but no usable measurement (failure, timeout, or not a network source).
    NotApplicable,
    /// Bytes per second.
    Measured(f64),
}

impl Speed {
    pub fn measured(self) -> Option<f64> {
        match self {
            Speed::Measured(speed) => Some(speed),
            _ => None,
        }
    }

    pub fn is_measured(self) -> bool {
        matches!(self, Speed::Measured(_))
    }
}

/// Fields every source carries.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceCommon {
    pub(crate) source_id: String,
    pub(crate) url: String,
    pub(crate) checksum: Option<String>,
    pub(crate) size: Option<u64>,
    pub(crate) total_size: Option<u64>,
}

impl SourceCommon {
    pub fn new(source_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
            checksum: None,
            size: None,
            total_size: None,
        }
    }

    fn from_descriptor(source_id: &str, url: &str, descriptor: &SourceDescriptor) -> Self {
        Self {
            source_id: source_id.to_string(),
            url: url.to_string(),
            checksum: descriptor.checksum.clone().filter(|c| !c.is_empty()),
            size: parse_size(descriptor.size.as_ref()),
            total_size: parse_size(descriptor.total_size.as_ref()),
        }
    }
}

/// Capabilities shared by every kind of source.
pub trait FileSource {
    fn common(&self) -> &SourceCommon;

    fn kind(&self) -> SourceKind;

    fn is_available(&self) -> bool;

    fn source_id(&self) -> &str {
        &self.common().source_id
    }

    fn url(&self) -> &str {
        &self.common().url
    }

    /// Raw `type:hash` checksum, if the source declares one.
    fn checksum(&self) -> Option<&str> {
        self.common().checksum.as_deref()
    }

    fn size(&self) -> Option<u64> {
        self.common().size
    }

    fn total_size(&self) -> Option<u64> {
        self.common().total_size
    }

    /// Network location the bytes come from, for network sources.
    fn domain(&self) -> Option<String> {
        None
    }

    fn speed(&self) -> Speed {
        Speed::NotApplicable
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Download(DownloadSource),
    User(UserSource),
    Steam(SteamSource),
    Cache(CacheSource),
}

impl Source {
    /// Builds the right kind of source for `url`.
    pub fn from_descriptor(
        source_id: &str,
        url: &str,
        descriptor: &SourceDescriptor,
        restricted: &RestrictedDomains,
    ) -> Result<Self> {
        let common = SourceCommon::from_descriptor(source_id, url, descriptor);
        if url.starts_with("$STEAM") {
            Ok(Source::Steam(SteamSource::new(common)))
        } else if url.starts_with("N/A") {
            Ok(Source::User(UserSource::new(common)))
        } else if url.starts_with("http") || url.starts_with("file") {
            Ok(Source::Download(DownloadSource::new(
                common,
                descriptor.referer.clone().filter(|r| !r.is_empty()),
                descriptor.alternate_filenames.clone(),
                restricted.contains(url),
            )))
        } else {
            Err(Error::UnsupportedSource {
                url: url.to_string(),
            })
        }
    }

    fn inner(&self) -> &dyn FileSource {
        match self {
            Source::Download(source) => source,
            Source::User(source) => source,
            Source::Steam(source) => source,
            Source::Cache(source) => source,
        }
    }

    pub(crate) fn set_source_id(&mut self, source_id: String) {
        let common = match self {
            Source::Download(source) => &mut source.common,
            Source::User(source) => &mut source.common,
            Source::Steam(source) => &mut source.common,
            Source::Cache(source) => &mut source.common,
        };
        common.source_id = source_id;
    }

    pub fn as_download(&self) -> Option<&DownloadSource> {
        match self {
            Source::Download(source) => Some(source),
            _ => None,
        }
    }

    pub fn as_download_mut(&mut self) -> Option<&mut DownloadSource> {
        match self {
            Source::Download(source) => Some(source),
            _ => None,
        }
    }

    pub fn as_user(&self) -> Option<&UserSource> {
        match self {
            Source::User(source) => Some(source),
            _ => None,
        }
    }

    pub fn as_user_mut(&mut self) -> Option<&mut UserSource> {
        match self {
            Source::User(source) => Some(source),
            _ => None,
        }
    }

    pub fn as_steam(&self) -> Option<&SteamSource> {
        match self {
            Source::Steam(source) => Some(source),
            _ => None,
        }
    }

    pub fn as_cache(&self) -> Option<&CacheSource> {
        match self {
            Source::Cache(source) => Some(source),
            _ => None,
        }
    }

    pub fn is_kind(&self, kind: SourceKind) -> bool {
        self.kind() == kind
    }

    /// Parsed checksum; `None` when the source declares none.
    pub fn checksum_spec(&self) -> Option<Result<ChecksumSpec>> {
        self.checksum().map(ChecksumSpec::parse)
    }
}

impl FileSource for Source {
    fn common(&self) -> &SourceCommon {
        self.inner().common()
    }

    fn kind(&self) -> SourceKind {
        self.inner().kind()
    }

    fn is_available(&self) -> bool {
        self.inner().is_available()
    }

    fn domain(&self) -> Option<String> {
        self.inner().domain()
    }

    fn speed(&self) -> Speed {
        self.inner().speed()
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind(), self.url())
    }
}

/// One entry of a file's source list, as produced by the script parser.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub referer: Option<String>,
    #[serde(default, alias = "alternate-filenames")]
    pub alternate_filenames: Vec<String>,
    #[serde(default)]
    pub size: Option<Value>,
    #[serde(default)]
    pub total_size: Option<Value>,
}

impl SourceDescriptor {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    pub fn with_alternate_filenames(mut self, names: Vec<String>) -> Self {
        self.alternate_filenames = names;
        self
    }

    pub fn with_size(mut self, size: Value) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_total_size(mut self, total_size: Value) -> Self {
        self.total_size = Some(total_size);
        self
    }
}

/// The validated `files` entry for one logical file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileSpec {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub sources: Vec<(String, SourceDescriptor)>,
}

impl FileSpec {
    pub fn new(filename: Option<String>) -> Self {
        Self {
            filename,
            sources: Vec::new(),
        }
    }

    /// A file given as a bare URL.
    pub fn single(url: impl Into<String>) -> Self {
        Self {
            filename: None,
            sources: vec![("1".to_string(), SourceDescriptor::new(url))],
        }
    }

    pub fn with_source(mut self, source_id: impl Into<String>, descriptor: SourceDescriptor) -> Self {
        self.sources.push((source_id.into(), descriptor));
        self
    }
}

/// Sizes come from untyped script data: negatives and non-numbers are absent.
pub fn parse_size(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(number) => {
            if let Some(size) = number.as_u64() {
                Some(size)
            } else {
                number
                    .as_f64()
                    .filter(|size| size.is_finite() && *size >= 0.0)
                    .map(|size| size as u64)
            }
        }
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    }
}

/// Strips the reserved prefix and makes `source_id` unique among `taken`.
pub fn unique_source_id<S: AsRef<str>>(source_id: &str, taken: &[S]) -> String {
    let base = source_id.trim_start_matches(RESERVED_ID_PREFIX);
    let base = if base.is_empty() { "source" } else { base };

    let is_taken = |candidate: &str| taken.iter().any(|id| id.as_ref() == candidate);
    if !is_taken(base) {
        return base.to_string();
    }

    let mut counter = 0;
    loop {
        let candidate = format!("{}{}", base, counter);
        if !is_taken(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size(Some(&json!(1024))), Some(1024));
        assert_eq!(parse_size(Some(&json!("2048"))), Some(2048));
        assert_eq!(parse_size(Some(&json!(12.7))), Some(12));
        assert_eq!(parse_size(Some(&json!(-1))), None);
        assert_eq!(parse_size(Some(&json!("-5"))), None);
        assert_eq!(parse_size(Some(&json!("big"))), None);
        assert_eq!(parse_size(Some(&json!(null))), None);
        assert_eq!(parse_size(None), None);
    }

    #[test]
    fn test_unique_source_id() {
        let taken = ["mirror", "mirror0", "user"];
        assert_eq!(unique_source_id("gog", &taken), "gog");
        assert_eq!(unique_source_id("mirror", &taken), "mirror1");
        assert_eq!(unique_source_id("user", &taken), "user0");
        assert_eq!(unique_source_id("|init", &taken), "init");
        assert_eq!(unique_source_id("|", &taken), "source");
        assert_eq!(unique_source_id("", &taken), "source");
    }

    #[test]
    fn test_descriptor_dispatch() {
        let restricted = RestrictedDomains::default();
        let descriptor = SourceDescriptor::default();

        let kinds: Vec<SourceKind> = [
            "https://a.test/f.zip",
            "file:///tmp/f.zip",
            "$STEAM:220:hl2.exe",
            "N/A:Select the installer",
        ]
        .iter()
        .map(|url| {
            Source::from_descriptor("1", url, &descriptor, &restricted)
                .unwrap()
                .kind()
        })
        .collect();
        assert_eq!(
            kinds,
            vec![
                SourceKind::Download,
                SourceKind::Download,
                SourceKind::Steam,
                SourceKind::User
            ]
        );

        assert!(matches!(
            Source::from_descriptor("1", "ftp://a.test/f.zip", &descriptor, &restricted),
            Err(Error::UnsupportedSource { .. })
        ));
    }

    #[test]
    fn test_descriptor_fields_flow_into_source() {
        let descriptor = SourceDescriptor::new("https://archive.org/download/f.zip")
            .with_checksum("md5:abc")
            .with_referer("https://archive.org/")
            .with_alternate_filenames(vec!["F.ZIP".to_string()])
            .with_size(json!("100"))
            .with_total_size(json!(-3));
        let source = Source::from_descriptor(
            "ia",
            "https://archive.org/download/f.zip",
            &descriptor,
            &RestrictedDomains::default(),
        )
        .unwrap();

        assert_eq!(source.checksum(), Some("md5:abc"));
        assert_eq!(source.size(), Some(100));
        assert_eq!(source.total_size(), None);
        assert_eq!(source.domain().as_deref(), Some("archive.org"));
        let download = source.as_download().unwrap();
        assert!(download.is_restricted());
        assert_eq!(download.referer(), Some("https://archive.org/"));
        assert_eq!(download.alternate_filenames(), ["F.ZIP".to_string()]);
        assert_eq!(source.to_string(), "Download: https://archive.org/download/f.zip");
    }

    #[test]
    fn test_descriptor_deserializes_with_aliases() {
        let descriptor: SourceDescriptor = serde_json::from_value(json!({
            "url": "https://a.test/f.zip",
            "alternate-filenames": ["g.zip"],
            "size": "12"
        }))
        .unwrap();
        assert_eq!(descriptor.alternate_filenames, vec!["g.zip".to_string()]);
        assert_eq!(parse_size(descriptor.size.as_ref()), Some(12));
    }
}
