//! Flat JSON station store.
//!
//! The whole catalog lives in one pretty-printed JSON array.  Every write
//! rewrites the file through a temporary sibling and a rename, serialised by
//! an internal lock so concurrent admin requests cannot interleave.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::station::{ProgramSegment, SegmentDraft, Station, StationDraft, StationId, StationPatch};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("station {0} not found")]
    NotFound(StationId),

    #[error("invalid station data: {0}")]
    Invalid(String),

    #[error("station file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("station file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

pub struct StationStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl StationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Stations visible to listeners, in file order.
    pub async fn list_active(&self) -> StoreResult<Vec<Station>> {
        let mut stations = self.read_all().await?;
        stations.retain(|s| s.is_active);
        Ok(stations)
    }

    /// Every record, including soft-deleted ones.
    pub async fn list_all(&self) -> StoreResult<Vec<Station>> {
        self.read_all().await
    }

    pub async fn get(&self, id: &StationId) -> StoreResult<Option<Station>> {
        let stations = self.list_active().await?;
        Ok(stations.into_iter().find(|s| &s.id == id))
    }

    pub async fn create(&self, draft: StationDraft) -> StoreResult<Station> {
        let missing = draft.missing_fields();
        if !missing.is_empty() {
            return Err(StoreError::Invalid(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }

        let _guard = self.write_lock.lock().await;
        let mut stations = self.read_all().await?;
        let id = unique_id("station", |candidate| {
            stations.iter().any(|s| s.id.as_str() == candidate)
        });
        let station = draft.into_station(StationId::new(id));
        stations.push(station.clone());
        self.write_all(&stations).await?;
        info!("store: created station {} '{}'", station.id, station.name);
        Ok(station)
    }

    pub async fn update(&self, id: &StationId, patch: StationPatch) -> StoreResult<Station> {
        let blanked = patch.blanked_fields();
        if !blanked.is_empty() {
            return Err(StoreError::Invalid(format!(
                "required fields cannot be empty: {}",
                blanked.join(", ")
            )));
        }

        self.modify(id, |station| {
            patch.apply(station);
            Ok(())
        })
        .await
    }

    /// Soft delete: the record stays in the file with `isActive = false`.
    pub async fn deactivate(&self, id: &StationId) -> StoreResult<Station> {
        self.modify(id, |station| {
            station.is_active = false;
            Ok(())
        })
        .await
    }

    pub async fn add_segment(&self, id: &StationId, draft: SegmentDraft) -> StoreResult<Station> {
        if !draft.is_complete() {
            return Err(StoreError::Invalid(
                "a segment needs startsAt, endsAt and segment".to_string(),
            ));
        }

        self.modify(id, |station| {
            let segment_id = unique_id("segment", |candidate| {
                station.programming.iter().any(|p| p.id == candidate)
            });
            station.programming.push(ProgramSegment {
                id: segment_id,
                starts_at: draft.starts_at,
                ends_at: draft.ends_at,
                segment: draft.segment,
                hosts: draft.hosts,
            });
            Ok(())
        })
        .await
    }

    pub async fn remove_segment(&self, id: &StationId, segment_id: &str) -> StoreResult<Station> {
        self.modify(id, |station| {
            let before = station.programming.len();
            station.programming.retain(|p| p.id != segment_id);
            if station.programming.len() == before {
                return Err(StoreError::Invalid(format!(
                    "segment {} not found on station {}",
                    segment_id, station.id
                )));
            }
            Ok(())
        })
        .await
    }

    /// Write `stations` as the initial file content.  Refuses to overwrite an
    /// existing store.
    pub async fn seed(&self, stations: &[Station]) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        if self.path.exists() {
            return Err(StoreError::Invalid(format!(
                "refusing to seed over existing {}",
                self.path.display()
            )));
        }
        self.write_all(stations).await?;
        info!("store: seeded {} stations into {}", stations.len(), self.path.display());
        Ok(())
    }

    // ── helpers ───────────────────────────────────────────────────────────────

    async fn modify<F>(&self, id: &StationId, change: F) -> StoreResult<Station>
    where
        F: FnOnce(&mut Station) -> StoreResult<()>,
    {
        let _guard = self.write_lock.lock().await;
        let mut stations = self.read_all().await?;
        let station = stations
            .iter_mut()
            .find(|s| &s.id == id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        change(station)?;
        let updated = station.clone();
        self.write_all(&stations).await?;
        debug!("store: updated station {}", id);
        Ok(updated)
    }

    async fn read_all(&self) -> StoreResult<Vec<Station>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("store: {} does not exist yet", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content).map_err(|e| {
            warn!("store: failed to parse {}: {}", self.path.display(), e);
            StoreError::from(e)
        })
    }

    async fn write_all(&self, stations: &[Station]) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_string_pretty(stations)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// `<prefix>-<unix millis>`, suffixed with `-<n>` until `taken` says no.
fn unique_id(prefix: &str, taken: impl Fn(&str) -> bool) -> String {
    let base = format!("{}-{}", prefix, chrono::Utc::now().timestamp_millis());
    if !taken(&base) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}-{}", base, n);
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
