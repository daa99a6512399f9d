use url::Url;

/// Hosts used only as a mirror of last resort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestrictedDomains {
    domains: Vec<String>,
}

impl Default for RestrictedDomains {
    fn default() -> Self {
        Self::new(vec!["archive.org".to_string()])
    }
}

impl RestrictedDomains {
    pub fn new(domains: Vec<String>) -> Self {
        Self {
            domains: domains
                .into_iter()
                .map(|domain| domain.trim().to_lowercase())
                .filter(|domain| !domain.is_empty())
                .collect(),
        }
    }

    pub fn none() -> Self {
        Self::new(Vec::new())
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    /// Only http(s) URLs can be restricted; subdomains match their parent.
    pub fn contains(&self, url: &str) -> bool {
        if !url.starts_with("http") {
            return false;
        }
        let Some(host) = Url::parse(url)
            .ok()
            .and_then(|parsed| parsed.host_str().map(str::to_lowercase))
        else {
            return false;
        };

        self.domains.iter().any(|domain| {
            host == *domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}
