use super::{FileSource, SourceCommon, SourceKind};

/// A file inside a Steam app, written as `$STEAM:<appid>:<path>`.
#[derive(Debug, Clone, PartialEq)]
pub struct SteamSource {
    pub(crate) common: SourceCommon,
}

impl SteamSource {
    pub fn new(common: SourceCommon) -> Self {
        Self { common }
    }

    fn part(&self, index: usize) -> Option<&str> {
        self.common
            .url
            .splitn(3, ':')
            .nth(index)
            .filter(|part| !part.is_empty())
    }

    pub fn appid(&self) -> Option<&str> {
        self.part(1)
    }

    pub fn path(&self) -> Option<&str> {
        self.part(2)
    }
}

impl FileSource for SteamSource {
    fn common(&self) -> &SourceCommon {
        &self.common
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Steam
    }

    /// Resolved by the Steam client, never by this crate.
    fn is_available(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference() {
        let steam = SteamSource::new(SourceCommon::new("steam", "$STEAM:220:bin/hl2.exe"));
        assert_eq!(steam.appid(), Some("220"));
        assert_eq!(steam.path(), Some("bin/hl2.exe"));

        let bare = SteamSource::new(SourceCommon::new("steam", "$STEAM:220"));
        assert_eq!(bare.appid(), Some("220"));
        assert_eq!(bare.path(), None);
    }

    #[test]
    fn test_path_keeps_colons() {
        let steam = SteamSource::new(SourceCommon::new("steam", "$STEAM:10:C:/games/x.exe"));
        assert_eq!(steam.path(), Some("C:/games/x.exe"));
    }
}
