//! Collaborator seams consumed by the record-driven processors.
//!
//! The engine never talks SQL, runs inference, or parses metadata itself;
//! it drives these narrow traits. In-memory implementations ship alongside
//! for tests and for running pipelines without external services attached.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::record::path_key;

pub type MediaRecordId = i64;

/// A tracked media row. Identity mirrors [`crate::record::FileRecord`]:
/// the path, case-insensitive.
#[derive(Clone, Debug)]
pub struct MediaRecord {
    pub id: MediaRecordId,
    pub path: PathBuf,
    pub content_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Persistence for media rows and their containing albums.
///
/// `add_or_update_media` must be idempotent under repeated calls for the
/// same path (upsert semantics): the record-sync processor re-dispatches
/// created events freely.
#[async_trait]
pub trait MediaRecordStore: Send + Sync {
    async fn ensure_album_exists(&self, path: &Path) -> Result<()>;

    /// Upsert the record for `path`; returns the record and whether it was
    /// newly created.
    async fn add_or_update_media(&self, path: &Path) -> Result<(MediaRecord, bool)>;

    async fn set_content_hash(&self, id: MediaRecordId, hash: &str) -> Result<()>;

    async fn find_media(&self, path: &Path) -> Result<Option<MediaRecord>>;

    /// Delete the record for `path`, returning the number of rows affected.
    async fn delete_media(&self, path: &Path) -> Result<u32>;

    /// Every path currently tracked, for record-driven reconciliation scans.
    async fn all_tracked_paths(&self) -> Result<Vec<PathBuf>>;
}

/// A detected face: bounding box in source-image pixels plus the embedding
/// used for similarity grouping downstream.
#[derive(Clone, Debug)]
pub struct FaceObservation {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    pub embedding: Vec<f32>,
}

/// Face detection engine (ONNX or similar), implemented elsewhere. A
/// detector may report itself unavailable (models missing), in which case
/// the face processor degrades to a no-op.
#[async_trait]
pub trait FaceDetector: Send + Sync {
    fn is_available(&self) -> bool;

    async fn detect_faces(&self, path: &Path) -> Result<Vec<FaceObservation>>;
}

/// Persistence for face observations, keyed by media record.
#[async_trait]
pub trait FaceStore: Send + Sync {
    /// Whether this record has already been through detection. Recording an
    /// empty observation set still marks it scanned.
    async fn faces_scanned(&self, media: MediaRecordId) -> Result<bool>;

    async fn record_faces(&self, media: MediaRecordId, faces: &[FaceObservation]) -> Result<u32>;

    async fn delete_faces(&self, media: MediaRecordId) -> Result<u32>;
}

/// WGS-84 coordinate pair.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// A location cluster at one tier radius.
#[derive(Clone, Debug)]
pub struct GeoCluster {
    pub id: i64,
    pub tier_meters: u32,
    pub centroid: GeoPoint,
    pub member_count: u32,
}

/// Persistence and nearest-neighbour queries for location clusters.
#[async_trait]
pub trait LocationStore: Send + Sync {
    /// Cluster the record is already assigned to at this tier, if any.
    async fn cluster_for(&self, media: MediaRecordId, tier_meters: u32) -> Result<Option<i64>>;

    /// Nearest cluster whose centroid lies within the tier radius of
    /// `point`, or None when the point starts a new cluster.
    async fn nearest_cluster(&self, point: GeoPoint, tier_meters: u32)
    -> Result<Option<GeoCluster>>;

    async fn create_cluster(&self, point: GeoPoint, tier_meters: u32) -> Result<i64>;

    async fn attach_to_cluster(
        &self,
        cluster: i64,
        media: MediaRecordId,
        point: GeoPoint,
    ) -> Result<()>;

    async fn recompute_centroid(&self, cluster: i64) -> Result<()>;
}

/// GPS coordinate lookup for a media file (EXIF or video metadata),
/// implemented elsewhere.
#[async_trait]
pub trait GpsSource: Send + Sync {
    async fn gps_for(&self, path: &Path) -> Result<Option<GeoPoint>>;
}

/// Great-circle distance between two points, in meters.
pub fn haversine_meters(a: GeoPoint, b: GeoPoint) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// In-memory [`MediaRecordStore`].
#[derive(Debug, Default)]
pub struct MemoryMediaStore {
    next_id: AtomicI64,
    records: RwLock<HashMap<String, MediaRecord>>,
    albums: RwLock<HashMap<String, PathBuf>>,
}

impl MemoryMediaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_count(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn album_count(&self) -> usize {
        self.albums.read().await.len()
    }
}

#[async_trait]
impl MediaRecordStore for MemoryMediaStore {
    async fn ensure_album_exists(&self, path: &Path) -> Result<()> {
        let album = path.parent().unwrap_or(path);
        self.albums
            .write()
            .await
            .entry(path_key(album))
            .or_insert_with(|| album.to_path_buf());
        Ok(())
    }

    async fn add_or_update_media(&self, path: &Path) -> Result<(MediaRecord, bool)> {
        let key = path_key(path);
        let mut records = self.records.write().await;
        if let Some(existing) = records.get_mut(&key) {
            existing.updated_at = Utc::now();
            return Ok((existing.clone(), false));
        }
        let record = MediaRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            path: path.to_path_buf(),
            content_hash: None,
            updated_at: Utc::now(),
        };
        records.insert(key, record.clone());
        Ok((record, true))
    }

    async fn set_content_hash(&self, id: MediaRecordId, hash: &str) -> Result<()> {
        let mut records = self.records.write().await;
        for record in records.values_mut() {
            if record.id == id {
                record.content_hash = Some(hash.to_string());
                record.updated_at = Utc::now();
                break;
            }
        }
        Ok(())
    }

    async fn find_media(&self, path: &Path) -> Result<Option<MediaRecord>> {
        Ok(self.records.read().await.get(&path_key(path)).cloned())
    }

    async fn delete_media(&self, path: &Path) -> Result<u32> {
        let removed = self.records.write().await.remove(&path_key(path));
        Ok(removed.map(|_| 1).unwrap_or(0))
    }

    async fn all_tracked_paths(&self) -> Result<Vec<PathBuf>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .map(|record| record.path.clone())
            .collect())
    }
}

/// In-memory [`FaceStore`].
#[derive(Debug, Default)]
pub struct MemoryFaceStore {
    faces: RwLock<HashMap<MediaRecordId, Vec<FaceObservation>>>,
}

impl MemoryFaceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn face_count(&self, media: MediaRecordId) -> usize {
        self.faces
            .read()
            .await
            .get(&media)
            .map(|faces| faces.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl FaceStore for MemoryFaceStore {
    async fn faces_scanned(&self, media: MediaRecordId) -> Result<bool> {
        Ok(self.faces.read().await.contains_key(&media))
    }

    async fn record_faces(&self, media: MediaRecordId, faces: &[FaceObservation]) -> Result<u32> {
        self.faces.write().await.insert(media, faces.to_vec());
        Ok(faces.len() as u32)
    }

    async fn delete_faces(&self, media: MediaRecordId) -> Result<u32> {
        let removed = self.faces.write().await.remove(&media);
        Ok(removed.map(|faces| faces.len() as u32).unwrap_or(0))
    }
}

#[derive(Debug)]
struct MemoryCluster {
    cluster: GeoCluster,
    members: Vec<(MediaRecordId, GeoPoint)>,
}

/// In-memory [`LocationStore`] with linear nearest-neighbour search.
#[derive(Debug, Default)]
pub struct MemoryLocationStore {
    next_id: AtomicI64,
    clusters: RwLock<HashMap<i64, MemoryCluster>>,
}

impl MemoryLocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn cluster_count(&self, tier_meters: u32) -> usize {
        self.clusters
            .read()
            .await
            .values()
            .filter(|c| c.cluster.tier_meters == tier_meters)
            .count()
    }

    pub async fn centroid_of(&self, cluster: i64) -> Option<GeoPoint> {
        self.clusters
            .read()
            .await
            .get(&cluster)
            .map(|c| c.cluster.centroid)
    }
}

#[async_trait]
impl LocationStore for MemoryLocationStore {
    async fn cluster_for(&self, media: MediaRecordId, tier_meters: u32) -> Result<Option<i64>> {
        Ok(self
            .clusters
            .read()
            .await
            .values()
            .find(|c| {
                c.cluster.tier_meters == tier_meters
                    && c.members.iter().any(|(member, _)| *member == media)
            })
            .map(|c| c.cluster.id))
    }

    async fn nearest_cluster(
        &self,
        point: GeoPoint,
        tier_meters: u32,
    ) -> Result<Option<GeoCluster>> {
        let clusters = self.clusters.read().await;
        let mut best: Option<(f64, GeoCluster)> = None;
        for entry in clusters.values() {
            if entry.cluster.tier_meters != tier_meters {
                continue;
            }
            let distance = haversine_meters(point, entry.cluster.centroid);
            if distance > f64::from(tier_meters) {
                continue;
            }
            if best.as_ref().is_none_or(|(d, _)| distance < *d) {
                best = Some((distance, entry.cluster.clone()));
            }
        }
        Ok(best.map(|(_, cluster)| cluster))
    }

    async fn create_cluster(&self, point: GeoPoint, tier_meters: u32) -> Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.clusters.write().await.insert(
            id,
            MemoryCluster {
                cluster: GeoCluster {
                    id,
                    tier_meters,
                    centroid: point,
                    member_count: 0,
                },
                members: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn attach_to_cluster(
        &self,
        cluster: i64,
        media: MediaRecordId,
        point: GeoPoint,
    ) -> Result<()> {
        let mut clusters = self.clusters.write().await;
        let entry = clusters
            .get_mut(&cluster)
            .ok_or_else(|| crate::error::SyncError::Store(format!("no cluster {cluster}")))?;
        entry.members.retain(|(member, _)| *member != media);
        entry.members.push((media, point));
        entry.cluster.member_count = entry.members.len() as u32;
        Ok(())
    }

    async fn recompute_centroid(&self, cluster: i64) -> Result<()> {
        let mut clusters = self.clusters.write().await;
        let Some(entry) = clusters.get_mut(&cluster) else {
            return Ok(());
        };
        if entry.members.is_empty() {
            return Ok(());
        }
        let count = entry.members.len() as f64;
        let (lat, lon) = entry.members.iter().fold((0.0, 0.0), |(lat, lon), (_, p)| {
            (lat + p.latitude, lon + p.longitude)
        });
        entry.cluster.centroid = GeoPoint {
            latitude: lat / count,
            longitude: lon / count,
        };
        Ok(())
    }
}

/// A [`FaceDetector`] that reports itself unavailable; the face processor
/// degrades to a no-op when wired with it.
#[derive(Debug, Default)]
pub struct UnavailableFaceDetector;

#[async_trait]
impl FaceDetector for UnavailableFaceDetector {
    fn is_available(&self) -> bool {
        false
    }

    async fn detect_faces(&self, _path: &Path) -> Result<Vec<FaceObservation>> {
        Ok(Vec::new())
    }
}

/// A [`GpsSource`] with no metadata backend: every lookup is None.
#[derive(Debug, Default)]
pub struct EmptyGpsSource;

#[async_trait]
impl GpsSource for EmptyGpsSource {
    async fn gps_for(&self, _path: &Path) -> Result<Option<GeoPoint>> {
        Ok(None)
    }
}
