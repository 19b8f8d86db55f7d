//! Geospatial clustering of tracked media.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::classify::FileClassifier;
use crate::error::Result;
use crate::processor::FileProcessor;
use crate::record::FileRecord;
use crate::store::{GpsSource, LocationStore, MediaRecordId, MediaRecordStore};

/// Cluster tier radii in meters: block, district, region.
pub const CLUSTER_TIERS_METERS: [u32; 3] = [300, 2_000, 25_000];

/// Assigns each geotagged record to one cluster per tier, creating clusters
/// as new areas appear and keeping centroids current as members arrive.
pub struct GeoClusterProcessor {
    classifier: Arc<FileClassifier>,
    media: Arc<dyn MediaRecordStore>,
    locations: Arc<dyn LocationStore>,
    gps: Arc<dyn GpsSource>,
}

impl GeoClusterProcessor {
    pub fn new(
        classifier: Arc<FileClassifier>,
        media: Arc<dyn MediaRecordStore>,
        locations: Arc<dyn LocationStore>,
        gps: Arc<dyn GpsSource>,
    ) -> Self {
        Self {
            classifier,
            media,
            locations,
            gps,
        }
    }

    async fn media_id_of(&self, file: &FileRecord) -> Result<Option<MediaRecordId>> {
        if let Some(record) = file.media() {
            return Ok(Some(record.id));
        }
        Ok(self
            .media
            .find_media(file.path())
            .await?
            .map(|record| record.id))
    }

    /// Returns the number of tier assignments made.
    async fn cluster_file(&self, file: &FileRecord) -> Result<u32> {
        let Some(point) = self.gps.gps_for(file.path()).await? else {
            return Ok(0);
        };
        let Some(media_id) = self.media_id_of(file).await? else {
            debug!(path = %file.path().display(), "no media record yet, clustering deferred");
            return Ok(0);
        };

        let mut assigned = 0;
        for tier in CLUSTER_TIERS_METERS {
            if self.locations.cluster_for(media_id, tier).await?.is_some() {
                continue;
            }
            let cluster_id = match self.locations.nearest_cluster(point, tier).await? {
                Some(cluster) => cluster.id,
                None => self.locations.create_cluster(point, tier).await?,
            };
            self.locations
                .attach_to_cluster(cluster_id, media_id, point)
                .await?;
            self.locations.recompute_centroid(cluster_id).await?;
            assigned += 1;
            info!(
                path = %file.path().display(),
                cluster = cluster_id,
                tier_meters = tier,
                "assigned to location cluster"
            );
        }
        Ok(assigned)
    }
}

impl std::fmt::Debug for GeoClusterProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoClusterProcessor")
            .field("root", &self.classifier.root())
            .field("tiers", &CLUSTER_TIERS_METERS)
            .finish()
    }
}

#[async_trait]
impl FileProcessor for GeoClusterProcessor {
    fn root_folder(&self) -> &Path {
        self.classifier.root()
    }

    fn should_process_file(&self, path: &Path) -> bool {
        self.classifier.should_process(path)
    }

    /// Clustering has no cleanup dimension: assignments die with the record.
    fn should_clean_file(&self, _path: &Path) -> bool {
        false
    }

    async fn on_file_created(&self, file: &FileRecord) -> Result<u32> {
        self.cluster_file(file).await
    }

    async fn on_file_changed(&self, file: &FileRecord) -> Result<()> {
        self.cluster_file(file).await.map(|_| ())
    }

    async fn on_file_deleted(&self, _file: &FileRecord) -> Result<u32> {
        Ok(0)
    }

    async fn on_file_renamed(
        &self,
        _old: &FileRecord,
        new: &FileRecord,
        new_valid: bool,
    ) -> Result<()> {
        if new_valid {
            self.cluster_file(new).await?;
        }
        Ok(())
    }

    async fn on_ensure_process(&self, file: &FileRecord) -> Result<u32> {
        self.cluster_file(file).await
    }

    async fn on_ensure_cleanup(&self, _file: &FileRecord) -> Result<u32> {
        Ok(0)
    }

    async fn on_scan_start(&self) -> Result<()> {
        Ok(())
    }

    async fn on_scan_end(&self) -> Result<()> {
        Ok(())
    }
}
