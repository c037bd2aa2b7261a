use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque station identifier, stable for the lifetime of the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StationId(String);

impl StationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for StationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Social networks a station may link to.  Closed set: unknown keys in the
/// station file are rejected rather than carried along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocialPlatform {
    Facebook,
    Twitter,
    Instagram,
    Youtube,
    Whatsapp,
}

/// One slot of a station's weekly programming grid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramSegment {
    pub id: String,
    /// `HH:MM`
    pub starts_at: String,
    /// `HH:MM`
    pub ends_at: String,
    pub segment: String,
    #[serde(default)]
    pub hosts: String,
}

/// A station record as stored in the station file and sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Station {
    pub id: StationId,
    pub name: String,
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub cover_image: String,
    pub stream_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Dial position, e.g. "101.5 FM"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    /// On-air presenters, free text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosts: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub social: BTreeMap<SocialPlatform, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub programming: Vec<ProgramSegment>,
}

fn default_active() -> bool {
    true
}

impl Default for Station {
    fn default() -> Self {
        Self {
            id: StationId::default(),
            name: String::new(),
            genre: String::new(),
            cover_image: String::new(),
            stream_url: String::new(),
            description: None,
            frequency: None,
            location: None,
            website: None,
            hosts: None,
            is_active: true,
            social: BTreeMap::new(),
            tags: Vec::new(),
            programming: Vec::new(),
        }
    }
}

impl Station {
    /// Programming segments ordered by start time.
    pub fn schedule(&self) -> Vec<ProgramSegment> {
        let mut segments = self.programming.clone();
        segments.sort_by(|a, b| a.starts_at.cmp(&b.starts_at));
        segments
    }
}

/// Payload for creating a station.  The store assigns `id` and `isActive`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationDraft {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub genre: String,
    #[serde(default)]
    pub cover_image: String,
    #[serde(default)]
    pub stream_url: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub hosts: Option<String>,
    #[serde(default)]
    pub social: BTreeMap<SocialPlatform, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub programming: Vec<ProgramSegment>,
}

impl StationDraft {
    /// Names of required fields that are empty after trimming.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.name.trim().is_empty() {
            missing.push("name");
        }
        if self.genre.trim().is_empty() {
            missing.push("genre");
        }
        if self.stream_url.trim().is_empty() {
            missing.push("streamUrl");
        }
        missing
    }

    pub fn into_station(self, id: StationId) -> Station {
        Station {
            id,
            name: self.name,
            genre: self.genre,
            cover_image: self.cover_image,
            stream_url: self.stream_url,
            description: self.description,
            frequency: self.frequency,
            location: self.location,
            website: self.website,
            hosts: self.hosts,
            is_active: true,
            social: self.social,
            tags: self.tags,
            programming: self.programming,
        }
    }
}

/// Partial update.  Only fields that are present overwrite the stored record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationPatch {
    pub name: Option<String>,
    pub genre: Option<String>,
    pub cover_image: Option<String>,
    pub stream_url: Option<String>,
    pub description: Option<String>,
    pub frequency: Option<String>,
    pub location: Option<String>,
    pub website: Option<String>,
    pub hosts: Option<String>,
    pub is_active: Option<bool>,
    pub social: Option<BTreeMap<SocialPlatform, String>>,
    pub tags: Option<Vec<String>>,
    pub programming: Option<Vec<ProgramSegment>>,
}

impl StationPatch {
    pub fn apply(self, station: &mut Station) {
        if let Some(v) = self.name {
            station.name = v;
        }
        if let Some(v) = self.genre {
            station.genre = v;
        }
        if let Some(v) = self.cover_image {
            station.cover_image = v;
        }
        if let Some(v) = self.stream_url {
            station.stream_url = v;
        }
        if self.description.is_some() {
            station.description = self.description;
        }
        if self.frequency.is_some() {
            station.frequency = self.frequency;
        }
        if self.location.is_some() {
            station.location = self.location;
        }
        if self.website.is_some() {
            station.website = self.website;
        }
        if self.hosts.is_some() {
            station.hosts = self.hosts;
        }
        if let Some(v) = self.is_active {
            station.is_active = v;
        }
        if let Some(v) = self.social {
            station.social = v;
        }
        if let Some(v) = self.tags {
            station.tags = v;
        }
        if let Some(v) = self.programming {
            station.programming = v;
        }
    }

    /// Required fields may be changed but not blanked.
    pub fn blanked_fields(&self) -> Vec<&'static str> {
        let blank = |v: &Option<String>| v.as_deref().is_some_and(|s| s.trim().is_empty());
        let mut blanked = Vec::new();
        if blank(&self.name) {
            blanked.push("name");
        }
        if blank(&self.genre) {
            blanked.push("genre");
        }
        if blank(&self.stream_url) {
            blanked.push("streamUrl");
        }
        blanked
    }
}

/// Payload for adding a programming segment; the store assigns the id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentDraft {
    #[serde(default)]
    pub starts_at: String,
    #[serde(default)]
    pub ends_at: String,
    #[serde(default)]
    pub segment: String,
    #[serde(default)]
    pub hosts: String,
}

impl SegmentDraft {
    pub fn is_complete(&self) -> bool {
        !self.starts_at.trim().is_empty()
            && !self.ends_at.trim().is_empty()
            && !self.segment.trim().is_empty()
    }
}

// ── TOML station loader ───────────────────────────────────────────────────────

/// Matches the TOML `[[station]]` table.  Kept apart from `Station` so the
/// hand-written seed file can stay terse.
#[derive(Debug, serde::Deserialize)]
struct TomlStationFile {
    station: Vec<TomlStation>,
}

#[derive(Debug, serde::Deserialize)]
struct TomlStation {
    #[serde(default)]
    id: Option<String>,
    name: String,
    url: String,
    #[serde(default)]
    genre: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    city: String,
    #[serde(default)]
    frequency: String,
    #[serde(default)]
    website: String,
}

pub fn load_stations_from_toml(path: &std::path::Path) -> anyhow::Result<Vec<Station>> {
    let content = std::fs::read_to_string(path)?;
    parse_stations_from_toml_str(&content)
}

pub fn parse_stations_from_toml_str(content: &str) -> anyhow::Result<Vec<Station>> {
    let non_empty = |s: String| if s.trim().is_empty() { None } else { Some(s) };

    let file: TomlStationFile = toml::from_str(content)?;
    let stations = file
        .station
        .into_iter()
        .enumerate()
        .map(|(idx, s)| Station {
            id: StationId::new(s.id.unwrap_or_else(|| format!("station-{}", idx + 1))),
            name: s.name,
            stream_url: s.url,
            genre: s.genre,
            description: non_empty(s.description),
            tags: s.tags,
            location: non_empty(s.city),
            frequency: non_empty(s.frequency),
            website: non_empty(s.website),
            ..Station::default()
        })
        .collect();
    Ok(stations)
}
