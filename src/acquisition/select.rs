use std::fmt;
use std::str::FromStr;
use tracing::{debug, error};

use super::{FileAcquisition, SourceSet};
use crate::error::{Error, Result};
use crate::source::{FileSource, SourceKind};

/// Picks the best source a freshly built file should start with.
pub const SELECT_INIT: &str = "|init";
/// Picks the first download source known to be reachable.
pub const SELECT_AUTO_AVAILABLE: &str = "|auto_available";

enum Selection<'a> {
    Init,
    AutoAvailable,
    Id(&'a str),
}

/// How a file reaches the installer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Provider {
    Download,
    Pga,
    Steam,
    User,
}

impl Provider {
    pub fn of(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Download => Provider::Download,
            SourceKind::Cache => Provider::Pga,
            SourceKind::Steam => Provider::Steam,
            SourceKind::User => Provider::User,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Download => "download",
            Provider::Pga => "pga",
            Provider::Steam => "steam",
            Provider::User => "user",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "download" => Ok(Provider::Download),
            "pga" => Ok(Provider::Pga),
            "steam" => Ok(Provider::Steam),
            "user" => Ok(Provider::User),
            _ => Err(Error::UnsupportedProvider {
                provider: s.to_string(),
            }),
        }
    }
}

impl SourceSet {
    /// Keywords may be given without the reserved prefix as long as no
    /// source carries that id.
    fn parse_selection<'a>(&self, source_id: &'a str) -> Selection<'a> {
        let keyword = match source_id.strip_prefix('|') {
            Some(keyword) => keyword,
            None if self.index_of(source_id).is_none() => source_id,
            None => return Selection::Id(source_id),
        };
        match keyword {
            "init" => Selection::Init,
            "auto_available" => Selection::AutoAvailable,
            _ => Selection::Id(source_id),
        }
    }

    fn first_valid_download(&self) -> Option<usize> {
        let downloads = || {
            self.sources
                .iter()
                .enumerate()
                .filter(|(_, source)| source.is_kind(SourceKind::Download))
        };
        downloads()
            .find(|(_, source)| {
                source
                    .as_download()
                    .is_some_and(|download| !download.is_restricted())
            })
            .or_else(|| downloads().next())
            .map(|(index, _)| index)
    }

    /// Cache, then Steam, then the first unrestricted download, then any
    /// download, then the User source.
    fn init_index(&self) -> usize {
        if let Some(index) = self.first_of_kind(SourceKind::Cache) {
            return index;
        }
        if self.sources.len() > 1 {
            if let Some(index) = self
                .first_of_kind(SourceKind::Steam)
                .or_else(|| self.first_valid_download())
            {
                return index;
            }
        }
        self.user_index()
    }

    fn auto_available_index(&self) -> Option<usize> {
        self.sources
            .iter()
            .position(|source| {
                source
                    .as_download()
                    .is_some_and(|download| !download.is_restricted() && download.is_available())
            })
            .or_else(|| self.sources.iter().position(|source| source.is_available()))
    }
}

impl FileAcquisition {
    /// Makes `source_id` (or a selection keyword) the active source and
    /// returns the id that ended up active. Clears any URL override.
    ///
    /// Unknown ids fall back to [`SELECT_INIT`].
    pub fn select(&self, source_id: &str) -> Result<String> {
        self.set_url_override(None);

        let mut set = self.sources.lock();
        let index = match set.parse_selection(source_id) {
            Selection::Init => set.init_index(),
            Selection::AutoAvailable => {
                set.auto_available_index()
                    .ok_or_else(|| Error::NoAvailableSource {
                        file: self.to_string(),
                    })?
            }
            Selection::Id(id) => match set.index_of(id) {
                Some(index) => index,
                None => {
                    error!(
                        "{}",
                        Error::InvalidSourceId {
                            source_id: id.to_string()
                        }
                    );
                    debug!("Defaulting {} to the first valid source", self);
                    set.init_index()
                }
            },
        };

        self.activate(&mut set, index);
        Ok(set.active().source_id().to_string())
    }

    /// Selects a source that serves `provider`.
    pub fn change_provider(&self, provider: &str) -> Result<String> {
        let provider: Provider = provider.parse()?;

        self.set_url_override(None);
        let mut set = self.sources.lock();
        let index = match provider {
            Provider::Download => set.first_valid_download(),
            Provider::Steam => set.first_of_kind(SourceKind::Steam),
            Provider::User => Some(set.user_index()),
            Provider::Pga => set.first_of_kind(SourceKind::Cache),
        }
        .ok_or_else(|| Error::UnsupportedProvider {
            provider: format!("{} for {}", provider, self),
        })?;

        self.activate(&mut set, index);
        Ok(set.active().source_id().to_string())
    }

    fn activate(&self, set: &mut SourceSet, index: usize) {
        if set.active == index {
            return;
        }
        set.active = index;
        let active = set.active();
        debug!(
            "Download source for {} changed to {} (source_id: {})",
            self,
            active
                .domain()
                .filter(|domain| !domain.is_empty())
                .unwrap_or_else(|| active.kind().to_string()),
            active.source_id()
        );
    }
}
