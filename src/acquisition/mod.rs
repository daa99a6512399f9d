pub mod events;
pub mod fetch;
pub mod probe;
pub mod scope;
mod select;

pub use events::{AcquisitionEvent, EventBus, SubscriptionId};
pub use probe::ProbeSettings;
pub use scope::InstallScope;
pub use select::{Provider, SELECT_AUTO_AVAILABLE, SELECT_INIT};

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::source::{
    CacheSource, FileSource, FileSpec, RestrictedDomains, Source, SourceKind, UserSource,
    unique_source_id,
};
use crate::storage::CacheStorage;

/// Where files end up and which hosts are avoided.
#[derive(Debug, Clone)]
pub struct AcquisitionSettings {
    /// Durable cache root; no durable caching without it.
    pub durable_cache: Option<PathBuf>,
    /// Root for per-installation downloads when there is no durable cache.
    pub temp_root: PathBuf,
    pub restricted: RestrictedDomains,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            durable_cache: None,
            temp_root: std::env::temp_dir().join("sourcepick"),
            restricted: RestrictedDomains::default(),
        }
    }
}

struct SourceSet {
    sources: Vec<Source>,
    active: usize,
}

impl SourceSet {
    fn active(&self) -> &Source {
        &self.sources[self.active]
    }

    fn ids(&self) -> Vec<&str> {
        self.sources.iter().map(|source| source.source_id()).collect()
    }

    fn index_of(&self, source_id: &str) -> Option<usize> {
        self.sources
            .iter()
            .position(|source| source.source_id() == source_id)
    }

    fn first_of_kind(&self, kind: SourceKind) -> Option<usize> {
        self.sources.iter().position(|source| source.is_kind(kind))
    }

    fn user_index(&self) -> usize {
        self.first_of_kind(SourceKind::User).unwrap_or(0)
    }

    fn downloads(&self) -> impl Iterator<Item = &Source> {
        self.sources
            .iter()
            .filter(|source| source.is_kind(SourceKind::Download))
    }
}

#[derive(Debug, Clone, Default)]
struct Overrides {
    filename: Option<String>,
    url: Option<String>,
    dest: Option<PathBuf>,
    dest_found: Option<PathBuf>,
}

/// One logical file of an installation and every place its bytes may come from.
///
/// Exactly one source is active at any time. There is always one User source
/// and at most one Cache source. The source list is behind a single lock that
/// is never held while events are emitted or while waiting on I/O.
pub struct FileAcquisition {
    game_id: String,
    file_id: String,
    spec: FileSpec,
    multiple_sources: bool,
    settings: AcquisitionSettings,
    storage: Arc<dyn CacheStorage>,
    sources: Mutex<SourceSet>,
    overrides: Mutex<Overrides>,
    events: EventBus,
}

impl FileAcquisition {
    pub fn new(
        game_id: impl Into<String>,
        file_id: &str,
        spec: FileSpec,
        settings: AcquisitionSettings,
        storage: Arc<dyn CacheStorage>,
    ) -> Result<Self> {
        let file_id = file_id.replace('-', "_");

        let mut sources: Vec<Source> = Vec::with_capacity(spec.sources.len() + 1);
        for (source_id, descriptor) in &spec.sources {
            let url = descriptor
                .url
                .as_deref()
                .ok_or_else(|| Error::MissingUrl {
                    file: file_id.clone(),
                    source_id: source_id.clone(),
                })?;
            let taken: Vec<&str> = sources.iter().map(|source| source.source_id()).collect();
            let unique_id = unique_source_id(source_id, &taken);
            sources.push(Source::from_descriptor(
                &unique_id,
                url,
                descriptor,
                &settings.restricted,
            )?);
        }

        if !sources.iter().any(|source| source.is_kind(SourceKind::User)) {
            let taken: Vec<&str> = sources.iter().map(|source| source.source_id()).collect();
            let mut user = Source::User(UserSource::placeholder());
            user.set_source_id(unique_source_id("user", &taken));
            sources.push(user);
        }

        let multiple_sources = sources
            .iter()
            .filter(|source| !source.is_kind(SourceKind::User))
            .count()
            > 1;
        let user_index = sources
            .iter()
            .position(|source| source.is_kind(SourceKind::User))
            .unwrap_or(0);

        let file = Self {
            game_id: game_id.into(),
            file_id,
            overrides: Mutex::new(Overrides {
                filename: spec.filename.clone().filter(|name| !name.is_empty()),
                ..Default::default()
            }),
            spec,
            multiple_sources,
            settings,
            storage,
            sources: Mutex::new(SourceSet {
                sources,
                active: user_index,
            }),
            events: EventBus::new(),
        };

        if file.is_cached() {
            let dest = file.dest_file()?;
            file.add_source(Source::Cache(CacheSource::durable("cache", &dest)))?;
        }

        file.select(SELECT_INIT)?;
        Ok(file)
    }

    /// A fresh copy built from the same descriptors. Only overrides carry over.
    pub fn duplicate(&self) -> Result<Self> {
        let copy = Self::new(
            self.game_id.clone(),
            &self.file_id,
            self.spec.clone(),
            self.settings.clone(),
            Arc::clone(&self.storage),
        )?;
        *copy.overrides.lock() = self.overrides.lock().clone();
        Ok(copy)
    }

    pub fn game_id(&self) -> &str {
        &self.game_id
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn settings(&self) -> &AcquisitionSettings {
        &self.settings
    }

    pub(crate) fn storage(&self) -> &dyn CacheStorage {
        self.storage.as_ref()
    }

    // Sources

    /// Adds a source, renaming it on id collisions. Returns the id it got.
    pub fn add_source(&self, mut source: Source) -> Result<String> {
        let mut set = self.sources.lock();
        if source.is_kind(SourceKind::Cache) && set.first_of_kind(SourceKind::Cache).is_some() {
            return Err(Error::DuplicateCacheSource {
                file: self.to_string(),
            });
        }

        let source_id = unique_source_id(source.source_id(), &set.ids());
        source.set_source_id(source_id.clone());
        debug!("Added source {} ({}) to {}", source_id, source, self);
        set.sources.push(source);
        Ok(source_id)
    }

    pub fn sources(&self) -> Vec<Source> {
        self.sources.lock().sources.clone()
    }

    pub fn sources_of_kind(&self, kind: SourceKind) -> Vec<Source> {
        self.sources
            .lock()
            .sources
            .iter()
            .filter(|source| source.is_kind(kind))
            .cloned()
            .collect()
    }

    pub fn source(&self, source_id: &str) -> Option<Source> {
        let set = self.sources.lock();
        set.index_of(source_id).map(|index| set.sources[index].clone())
    }

    pub fn source_exists(&self, kind: SourceKind) -> bool {
        self.sources.lock().first_of_kind(kind).is_some()
    }

    /// Includes the User source.
    pub fn source_count(&self) -> usize {
        self.sources.lock().sources.len()
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.sources
            .lock()
            .sources
            .iter()
            .map(|source| source.source_id().to_string())
            .collect()
    }

    pub fn active_source(&self) -> Source {
        self.sources.lock().active().clone()
    }

    pub fn active_source_id(&self) -> String {
        self.sources.lock().active().source_id().to_string()
    }

    /// More than one source besides the User source.
    pub fn has_multiple_sources(&self) -> bool {
        self.sources
            .lock()
            .sources
            .iter()
            .filter(|source| !source.is_kind(SourceKind::User))
            .count()
            > 1
    }

    /// Only the User source exists.
    pub fn has_no_sources(&self) -> bool {
        let set = self.sources.lock();
        set.sources.len() == 1 && set.active().is_kind(SourceKind::User)
    }

    pub fn is_downloadable(&self) -> bool {
        self.source_exists(SourceKind::Download)
    }

    pub fn download_sources_available(&self) -> bool {
        self.sources.lock().downloads().any(|source| source.is_available())
    }

    /// Number of download sources confirmed reachable.
    pub fn available_downloads(&self) -> usize {
        self.sources
            .lock()
            .downloads()
            .filter(|source| source.is_available())
            .count()
    }

    /// Every download source is confirmed down. False if there are none or
    /// some are not checked yet.
    pub fn is_offline(&self) -> bool {
        let set = self.sources.lock();
        let mut downloads = set.downloads().peekable();
        if downloads.peek().is_none() {
            return false;
        }
        downloads.all(|source| {
            source
                .as_download()
                .is_some_and(|download| download.availability().is_confirmed_down())
        })
    }

    pub fn domains(&self) -> Vec<String> {
        self.sources
            .lock()
            .downloads()
            .filter_map(|source| source.domain())
            .collect()
    }

    /// Points the User source at a file on disk.
    pub fn set_user_file(&self, path: impl AsRef<Path>) {
        let mut set = self.sources.lock();
        if let Some(user) = set
            .sources
            .iter_mut()
            .find_map(|source| source.as_user_mut())
        {
            user.set_path(path);
        }
    }

    // URLs and speed

    pub fn url(&self) -> String {
        if let Some(url) = self.overrides.lock().url.clone() {
            return url;
        }
        self.sources.lock().active().url().to_string()
    }

    pub fn set_url_override(&self, url: Option<String>) {
        let mut overrides = self.overrides.lock();
        if overrides.url.is_some() && overrides.url != url {
            debug!(
                "Overriding URL for {}: {}",
                self.file_id,
                url.as_deref().unwrap_or("(None)")
            );
        }
        overrides.url = url;
    }

    pub fn url_all(&self, remote_only: bool) -> Vec<String> {
        self.sources
            .lock()
            .sources
            .iter()
            .map(|source| source.url())
            .filter(|url| !remote_only || url.starts_with("http"))
            .map(str::to_string)
            .collect()
    }

    /// Measured speed of the active source.
    pub fn speed(&self) -> Option<f64> {
        self.sources.lock().active().speed().measured()
    }

    /// URL and speed of the fastest measured source.
    pub fn speed_fastest(&self) -> Option<(String, f64)> {
        let set = self.sources.lock();
        let mut fastest: Option<(&Source, f64)> = None;
        for source in &set.sources {
            if let Some(speed) = source.speed().measured() {
                if fastest.is_none_or(|(_, best)| speed > best) {
                    fastest = Some((source, speed));
                }
            }
        }
        fastest.map(|(source, speed)| (source.url().to_string(), speed))
    }

    // Metadata of the active source

    pub fn set_filename(&self, filename: impl Into<String>) {
        self.overrides.lock().filename = Some(filename.into());
    }

    pub fn filename(&self) -> Result<String> {
        if let Some(filename) = self.overrides.lock().filename.clone() {
            return Ok(filename);
        }
        if self.multiple_sources {
            return Err(Error::MissingFilename {
                file: self.file_id.clone(),
            });
        }

        let external = {
            let set = self.sources.lock();
            if set.sources.len() == 1 {
                None
            } else {
                let external = set
                    .sources
                    .iter()
                    .find(|source| !source.is_kind(SourceKind::User))
                    .unwrap_or(set.active());
                Some(if external.is_kind(SourceKind::Steam) {
                    set.active().url().to_string()
                } else {
                    url_basename(external.url()).to_string()
                })
            }
        };

        match external {
            Some(name) => Ok(name),
            None => {
                let cache_path = self.cache_path();
                if self.uses_durable_cache() && cache_path.is_dir() {
                    Ok(self
                        .storage
                        .first_file_name(&cache_path)
                        .unwrap_or_default())
                } else {
                    Ok(String::new())
                }
            }
        }
    }

    /// Alternate file names the source may be saved under; the active source
    /// when `source_id` is `None`.
    pub fn alternate_filenames(&self, source_id: Option<&str>) -> Result<Vec<String>> {
        let set = self.sources.lock();
        let source = match source_id {
            Some(source_id) => {
                let index = set.index_of(source_id).ok_or_else(|| Error::InvalidSourceId {
                    source_id: source_id.to_string(),
                })?;
                &set.sources[index]
            }
            None => set.active(),
        };
        Ok(source
            .as_download()
            .map(|download| download.alternate_filenames().to_vec())
            .unwrap_or_default())
    }

    pub fn referer(&self) -> Option<String> {
        self.sources
            .lock()
            .active()
            .as_download()
            .and_then(|download| download.referer().map(str::to_string))
    }

    pub fn size(&self) -> Option<u64> {
        self.sources.lock().active().size()
    }

    pub fn total_size(&self) -> Option<u64> {
        self.sources.lock().active().total_size()
    }

    /// Where the active source points, phrased for people.
    pub fn human_url(&self) -> String {
        let set = self.sources.lock();
        let active = set.active();
        match active.as_user() {
            Some(user) => match user.local_path() {
                Some(path) => path.display().to_string(),
                None => match active.url().split_once(':') {
                    Some((_, hint)) if !hint.is_empty() => hint.to_string(),
                    _ => format!("Please select file '{}'", self.file_id),
                },
            },
            None => active.url().to_string(),
        }
    }

    pub fn label(&self) -> String {
        let filename = self.filename().unwrap_or_else(|_| self.file_id.clone());
        if !self.active_source().is_kind(SourceKind::Download) {
            return filename;
        }
        if self.is_offline() {
            return format!("{} unavailable. Choose another Source.", filename);
        }
        match self.available_downloads() {
            1 => format!("{} on 1 host", filename),
            hosts => format!("{} on {} hosts", filename, hosts),
        }
    }

    pub fn default_provider(&self) -> Provider {
        Provider::of(self.sources.lock().active().kind())
    }

    pub fn providers(&self) -> BTreeSet<Provider> {
        let mut providers = BTreeSet::new();
        providers.insert(Provider::User);
        if self.source_exists(SourceKind::Steam) {
            providers.insert(Provider::Steam);
        }
        if self.cache_source_available() {
            providers.insert(Provider::Pga);
        }
        if self.is_downloadable() {
            providers.insert(Provider::Download);
        }
        providers
    }

    /// The file can be fetched through `provider`, or is already in place.
    pub fn is_ready(&self, provider: Provider) -> bool {
        match provider {
            Provider::Download => self.available_downloads() > 0,
            Provider::User | Provider::Pga => self
                .dest_file()
                .is_ok_and(|dest| self.storage.path_exists(&dest)),
            Provider::Steam => true,
        }
    }

    // Paths

    /// Directory this file is downloaded into.
    pub fn cache_path(&self) -> PathBuf {
        self.settings
            .durable_cache
            .as_ref()
            .unwrap_or(&self.settings.temp_root)
            .join(&self.game_id)
            .join(&self.file_id)
    }

    /// Final location of the file. Resolved once and then remembered.
    pub fn dest_file(&self) -> Result<PathBuf> {
        {
            let overrides = self.overrides.lock();
            if let Some(dest) = overrides.dest.as_ref().or(overrides.dest_found.as_ref()) {
                return Ok(dest.clone());
            }
        }

        let found = self.find_dest_file()?;
        self.overrides.lock().dest_found = Some(found.clone());
        Ok(found)
    }

    fn find_dest_file(&self) -> Result<PathBuf> {
        let cache_path = self.cache_path();
        for name in self.alternate_filenames(None)? {
            let candidate = cache_path.join(&name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Ok(cache_path.join(self.filename()?))
    }

    pub fn set_dest_file(&self, path: impl Into<PathBuf>) {
        self.overrides.lock().dest = Some(path.into());
    }

    pub fn is_dest_file_overridden(&self) -> bool {
        self.overrides.lock().dest.is_some()
    }

    /// Downloads land here and are moved to [`dest_file`](Self::dest_file) when done.
    pub fn download_file(&self) -> Result<PathBuf> {
        let mut name: OsString = self.dest_file()?.into_os_string();
        name.push(".tmp");
        Ok(PathBuf::from(name))
    }

    pub fn dest_files_by_id(&self) -> Result<HashMap<String, PathBuf>> {
        Ok(HashMap::from([(self.file_id.clone(), self.dest_file()?)]))
    }

    // Caching

    /// A durable cache is configured and the file has real sources.
    pub fn uses_durable_cache(&self) -> bool {
        self.settings.durable_cache.is_some() && !self.has_no_sources()
    }

    /// The file is in the durable cache. Copies made during probes do not count.
    pub fn is_cached(&self) -> bool {
        self.uses_durable_cache()
            && self
                .dest_file()
                .is_ok_and(|dest| self.storage.path_exists(&dest))
    }

    /// A Cache source exists, durable or not.
    pub fn cache_source_available(&self) -> bool {
        self.source_exists(SourceKind::Cache)
    }

    /// Creates the download directory unless the destination was overridden.
    pub fn prepare(&self) -> Result<()> {
        if !self.is_dest_file_overridden() {
            self.storage.create_dir_all(&self.cache_path())?;
        }
        Ok(())
    }

    pub fn save_to_cache(&self) -> Result<PathBuf> {
        let dest = self.dest_file()?;
        self.storage.save_to_cache(&dest, &self.cache_path())
    }

    /// Clears whatever sits at the destination before a download, unless the
    /// durable cache owns it.
    pub fn remove_previous(&self) -> Result<()> {
        if self.uses_durable_cache() {
            return Ok(());
        }
        let dest = self.dest_file()?;
        if self.storage.path_exists(&dest) {
            debug!("Removing previous {:?}", dest);
            self.storage.remove(&dest)?;
        }
        Ok(())
    }

    /// Verifies the destination against the active source's checksum.
    pub async fn check_hash(&self) -> Result<()> {
        let dest = self.dest_file()?;
        self.verify_at(&dest).await
    }

    pub(crate) async fn verify_at(&self, path: &Path) -> Result<()> {
        let Some(spec) = self.sources.lock().active().checksum_spec() else {
            return Ok(());
        };
        let spec = spec?;
        self.storage
            .verify_checksum(path, &spec.algorithm, &spec.expected)
            .await
    }
}

impl fmt::Display for FileAcquisition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.game_id, self.file_id)
    }
}

impl fmt::Debug for FileAcquisition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileAcquisition")
            .field("game_id", &self.game_id)
            .field("file_id", &self.file_id)
            .field("active_source", &self.active_source_id())
            .field("sources", &self.source_ids())
            .finish()
    }
}

/// Last path segment of a URL, without query or fragment.
fn url_basename(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    let path = &url[..end];
    path.rsplit('/').next().unwrap_or(path)
}
