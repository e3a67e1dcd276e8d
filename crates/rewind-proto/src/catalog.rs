//! Persisted station catalog.
//!
//! Simple key-value persistence of station records: the whole catalog is a
//! pretty-printed JSON file rewritten on every mutation.  The playback
//! engine only ever consumes `(name, url)` pairs from here.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("station name must not be empty")]
    EmptyName,
    #[error("invalid stream url: {0}")]
    InvalidUrl(String),
    #[error("a station named '{0}' already exists")]
    DuplicateName(String),
    #[error("a station with url '{0}' already exists")]
    DuplicateUrl(String),
    #[error("no station with id {0}")]
    NotFound(u64),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("catalog file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Station {
    pub id: u64,
    pub name: String,
    pub url: String,
    /// Emoji icon shown by presentation clients; derived from the name/url
    /// when not set explicitly.
    #[serde(default)]
    pub icon: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    stations: Vec<Station>,
}

pub struct StationCatalog {
    path: PathBuf,
    file: CatalogFile,
}

impl StationCatalog {
    /// Opens the catalog at `path`, creating an empty one if the file does
    /// not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let path = path.into();
        let file = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CatalogFile {
                next_id: 1,
                stations: Vec::new(),
            },
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, file })
    }

    /// All stations, ordered by name ascending.
    pub fn list(&self) -> Vec<Station> {
        let mut stations = self.file.stations.clone();
        stations.sort_by(|a, b| a.name.cmp(&b.name));
        stations
    }

    pub fn get(&self, id: u64) -> Option<&Station> {
        self.file.stations.iter().find(|s| s.id == id)
    }

    /// Exact-match lookup by trimmed name, skipping `exclude_id`.
    /// `exclude_id == 0` means no exclusion (used when adding rather than
    /// editing a station).
    pub fn find_by_name(&self, name: &str, exclude_id: u64) -> Option<&Station> {
        let name = name.trim();
        self.file
            .stations
            .iter()
            .find(|s| s.name == name && (exclude_id == 0 || s.id != exclude_id))
    }

    /// Exact-match lookup by trimmed url, skipping `exclude_id`.
    pub fn find_by_url(&self, url: &str, exclude_id: u64) -> Option<&Station> {
        let url = url.trim();
        self.file
            .stations
            .iter()
            .find(|s| s.url == url && (exclude_id == 0 || s.id != exclude_id))
    }

    /// Validates, checks duplicates, assigns an id, and persists.
    pub fn insert(
        &mut self,
        name: &str,
        url: &str,
        icon: Option<String>,
    ) -> Result<u64, CatalogError> {
        let (name, url) = self.validate(name, url, 0)?;

        let id = self.file.next_id.max(1);
        self.file.next_id = id + 1;
        self.file.stations.push(Station {
            id,
            name,
            url,
            icon,
        });
        self.save()?;
        Ok(id)
    }

    /// Updates an existing station in place; duplicate checks exclude the
    /// station's own id.
    pub fn update(&mut self, station: Station) -> Result<(), CatalogError> {
        let (name, url) = self.validate(&station.name, &station.url, station.id)?;

        let existing = self
            .file
            .stations
            .iter_mut()
            .find(|s| s.id == station.id)
            .ok_or(CatalogError::NotFound(station.id))?;
        existing.name = name;
        existing.url = url;
        existing.icon = station.icon;
        self.save()
    }

    pub fn delete(&mut self, id: u64) -> Result<(), CatalogError> {
        let before = self.file.stations.len();
        self.file.stations.retain(|s| s.id != id);
        if self.file.stations.len() == before {
            return Err(CatalogError::NotFound(id));
        }
        self.save()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn validate(
        &self,
        name: &str,
        url: &str,
        exclude_id: u64,
    ) -> Result<(String, String), CatalogError> {
        let name = name.trim().to_string();
        let url = url.trim().to_string();
        if name.is_empty() {
            return Err(CatalogError::EmptyName);
        }
        if !validate_url(&url) {
            return Err(CatalogError::InvalidUrl(url));
        }
        if self.find_by_name(&name, exclude_id).is_some() {
            return Err(CatalogError::DuplicateName(name));
        }
        if self.find_by_url(&url, exclude_id).is_some() {
            return Err(CatalogError::DuplicateUrl(url));
        }
        Ok((name, url))
    }

    fn save(&self) -> Result<(), CatalogError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.file)?;
        std::fs::write(&self.path, json)?;
        debug!(
            "catalog: saved {} stations to {:?}",
            self.file.stations.len(),
            self.path
        );
        Ok(())
    }
}

/// A stream url is accepted when it is non-blank, contains no whitespace,
/// parses with a non-empty host, and uses http or https.
pub fn validate_url(s: &str) -> bool {
    if s.trim().is_empty() || s.chars().any(|c| c.is_whitespace()) {
        return false;
    }
    match url::Url::parse(s) {
        Ok(parsed) => {
            matches!(parsed.scheme(), "http" | "https")
                && parsed.host_str().is_some_and(|h| !h.is_empty())
        }
        Err(_) => false,
    }
}

/// Picks an emoji for a station from genre keywords found in its name or
/// url, falling back to the radio glyph.
pub fn icon_for_station(name: &str, url: &str) -> &'static str {
    const GENRES: [(&str, &str); 14] = [
        ("rock", "🎸"),
        ("metal", "🤘"),
        ("pop", "🎤"),
        ("rap", "🎤"),
        ("jazz", "🎷"),
        ("classic", "🎹"),
        ("electronic", "🎧"),
        ("dance", "💃"),
        ("country", "🤠"),
        ("folk", "🪕"),
        ("latin", "🌴"),
        ("news", "📰"),
        ("talk", "💬"),
        ("sport", "⚽"),
    ];

    let name = name.to_lowercase();
    let url = url.to_lowercase();
    for (keyword, emoji) in GENRES {
        if name.contains(keyword) || url.contains(keyword) {
            return emoji;
        }
    }
    if name.contains("live") || url.contains("live") {
        "🔴"
    } else if name.contains("music") || url.contains("music") {
        "🎵"
    } else {
        "📻"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url() {
        assert!(validate_url("http://example.com/stream"));
        assert!(validate_url("https://radio.example.org:8000/live.mp3"));
        assert!(!validate_url(""));
        assert!(!validate_url("   "));
        assert!(!validate_url("http://example.com/has space"));
        assert!(!validate_url("ftp://example.com/stream"));
        assert!(!validate_url("not a url"));
        assert!(!validate_url("http://"));
    }

    #[test]
    fn test_icon_heuristics() {
        assert_eq!(icon_for_station("Jazz 24", ""), "🎷");
        assert_eq!(icon_for_station("Hard Rock FM", ""), "🎸");
        assert_eq!(icon_for_station("Plain Station", "http://x.example"), "📻");
        assert_eq!(
            icon_for_station("Station", "http://example.com/news"),
            "📰"
        );
    }
}
