//! Per-venue ROI polygon index
//!
//! Built as an immutable snapshot so the pipeline can swap a fresh index in
//! while lookups keep reading the old one. Invalid polygons are excluded and
//! reported; the rest of the venue keeps working.

use crate::domain::geometry::{Point, Polygon, PolygonError};
use crate::domain::types::{Roi, RoiId, RoiMetadata, VenueId};
use smallvec::SmallVec;
use tracing::warn;

/// One validated ROI ready for containment queries
#[derive(Debug, Clone)]
pub struct IndexedRoi {
    pub id: RoiId,
    pub name: String,
    pub polygon: Polygon,
    pub metadata: RoiMetadata,
    pub centroid: Point,
}

/// Immutable containment index over one venue's ROIs
#[derive(Debug, Default)]
pub struct RoiIndex {
    rois: Vec<IndexedRoi>,
}

impl RoiIndex {
    /// Build an index, returning the rejected ROIs alongside it
    pub fn build(venue_id: VenueId, rois: Vec<Roi>) -> (Self, Vec<(Roi, PolygonError)>) {
        let mut indexed = Vec::with_capacity(rois.len());
        let mut rejected = Vec::new();
        for roi in rois {
            match Polygon::new(roi.vertices.clone()) {
                Ok(polygon) => {
                    let centroid = polygon.centroid();
                    indexed.push(IndexedRoi {
                        id: roi.id,
                        name: roi.name,
                        polygon,
                        metadata: roi.metadata,
                        centroid,
                    });
                }
                Err(e) => {
                    warn!(
                        venue_id = %venue_id,
                        roi_id = %roi.id,
                        roi_name = %roi.name,
                        error = %e,
                        "roi_excluded_invalid_polygon"
                    );
                    rejected.push((roi, e));
                }
            }
        }
        (Self { rois: indexed }, rejected)
    }

    /// Which ROIs contain the point? AABB pre-filter, then even-odd test.
    pub fn containing(&self, x: f64, z: f64) -> SmallVec<[RoiId; 4]> {
        let mut hits = SmallVec::new();
        for roi in &self.rois {
            if roi.polygon.aabb().contains(x, z) && roi.polygon.contains(x, z) {
                hits.push(roi.id);
            }
        }
        hits
    }

    pub fn get(&self, roi_id: RoiId) -> Option<&IndexedRoi> {
        self.rois.iter().find(|r| r.id == roi_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexedRoi> {
        self.rois.iter()
    }

    pub fn roi_ids(&self) -> Vec<RoiId> {
        self.rois.iter().map(|r| r.id).collect()
    }

    pub fn len(&self) -> usize {
        self.rois.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rois.is_empty()
    }
}
