use url::Url;

use super::{Availability, FileSource, SourceCommon, SourceKind, Speed};
use crate::download::{ProgressFormatter, TransferRequest};

/// A remote mirror (or `file://` URL) the bytes can be downloaded from.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadSource {
    pub(crate) common: SourceCommon,
    referer: Option<String>,
    alternate_filenames: Vec<String>,
    restricted: bool,
    availability: Availability,
    speed: Speed,
    error: Option<String>,
    error_code: Option<u16>,
}

impl DownloadSource {
    pub fn new(
        common: SourceCommon,
        referer: Option<String>,
        alternate_filenames: Vec<String>,
        restricted: bool,
    ) -> Self {
        Self {
            common,
            referer,
            alternate_filenames,
            restricted,
            availability: Availability::Unknown,
            speed: Speed::Untested,
            error: None,
            error_code: None,
        }
    }

    pub fn referer(&self) -> Option<&str> {
        self.referer.as_deref()
    }

    pub fn alternate_filenames(&self) -> &[String] {
        &self.alternate_filenames
    }

    /// The host is on the soft-avoid list.
    pub fn is_restricted(&self) -> bool {
        self.restricted
    }

    pub fn availability(&self) -> Availability {
        self.availability
    }

    pub fn set_availability(&mut self, availability: Availability) {
        self.availability = availability;
    }

    pub fn set_speed(&mut self, speed: Speed) {
        self.speed = speed;
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn error_code(&self) -> Option<u16> {
        self.error_code
    }

    /// A probe failed: no usable speed, and a source believed reachable is demoted.
    pub fn record_failure(&mut self, error: Option<String>, error_code: Option<u16>) {
        self.speed = Speed::NotApplicable;
        if self.availability.is_reachable() {
            self.availability = Availability::Unreachable;
        }
        self.error = error;
        self.error_code = error_code;
    }

    pub fn speed_human_readable(&self) -> Option<String> {
        self.speed.measured().map(ProgressFormatter::format_speed)
    }

    pub fn transfer_request(&self) -> TransferRequest {
        TransferRequest::new(self.common.url.clone()).with_referer(self.referer.clone())
    }
}

impl FileSource for DownloadSource {
    fn common(&self) -> &SourceCommon {
        &self.common
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Download
    }

    fn is_available(&self) -> bool {
        self.availability.is_reachable()
    }

    fn domain(&self) -> Option<String> {
        Some(domain_of(&self.common.url))
    }

    fn speed(&self) -> Speed {
        self.speed
    }
}

/// `host[:port]` of a URL; empty for URLs without an authority.
pub fn domain_of(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            _ => String::new(),
        },
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(url: &str) -> DownloadSource {
        DownloadSource::new(SourceCommon::new("1", url), None, Vec::new(), false)
    }

    #[test]
    fn test_domain_of() {
        assert_eq!(domain_of("https://cdn.gog.test/f.zip"), "cdn.gog.test");
        assert_eq!(domain_of("http://a.test:8080/f.zip"), "a.test:8080");
        assert_eq!(domain_of("file:///tmp/f.zip"), "");
        assert_eq!(domain_of("not a url"), "");
    }

    #[test]
    fn test_failure_demotes_reachable_source() {
        let mut download = source("https://a.test/f.zip");
        download.set_availability(Availability::Reachable);
        download.set_speed(Speed::Measured(1000.0));

        download.record_failure(Some("connection reset".to_string()), Some(503));
        assert_eq!(download.speed(), Speed::NotApplicable);
        assert_eq!(download.availability(), Availability::Unreachable);
        assert_eq!(download.error(), Some("connection reset"));
        assert_eq!(download.error_code(), Some(503));
        assert!(!download.is_available());
    }

    #[test]
    fn test_failure_keeps_unknown_availability() {
        let mut download = source("https://a.test/f.zip");
        download.record_failure(None, None);
        assert_eq!(download.availability(), Availability::Unknown);
    }

    #[test]
    fn test_speed_human_readable() {
        let mut download = source("https://a.test/f.zip");
        assert_eq!(download.speed_human_readable(), None);
        download.set_speed(Speed::Measured(1_500_000.0));
        assert_eq!(download.speed_human_readable().as_deref(), Some("1.5 MB/s"));
        download.set_speed(Speed::NotApplicable);
        assert_eq!(download.speed_human_readable(), None);
    }
}
