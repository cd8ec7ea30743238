//! # Feature Regions
//!
//! Face sub-feature geometry supplied by an external [`FeatureDetector`],
//! and the [`RegionMemo`] that runs detection at most once per image and
//! orientation.

use std::collections::VecDeque;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::picture::{Image, ImageId, Point};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacialFeature {
    FaceContour,
    LeftEye,
    RightEye,
    LeftEyebrow,
    RightEyebrow,
    Nose,
    NoseCrest,
    MedianLine,
    OuterLips,
    InnerLips,
    LeftPupil,
    RightPupil,
}

/// Orientation of the source image as captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Orientation {
    #[default]
    Up,
    Down,
    Left,
    Right,
    UpMirrored,
    DownMirrored,
    LeftMirrored,
    RightMirrored,
}

/// Polygon(s) outlining one detected feature, in image coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRegion {
    pub feature: FacialFeature,
    pub polygons: Vec<Vec<Point>>,
}

impl FeatureRegion {
    pub fn new(feature: FacialFeature, polygon: Vec<Point>) -> Self {
        Self {
            feature,
            polygons: vec![polygon],
        }
    }
}

/// Face/landmark detection capability
pub trait FeatureDetector: Send + Sync {
    /// Detect feature regions in `image`. May block on ML work.
    fn detect(&self, image: &Image, orientation: Orientation) -> Vec<FeatureRegion>;
}

type RegionCell = Arc<OnceCell<Arc<Vec<FeatureRegion>>>>;

// ============================================================================
// Region Memo
// ============================================================================

/// Per-image, per-orientation memo of detection results
pub struct RegionMemo {
    detector: Option<Arc<dyn FeatureDetector>>,
    capacity: usize,
    /// Most recent images last
    cells: Mutex<VecDeque<((ImageId, Orientation), RegionCell)>>,
}

impl RegionMemo {
    pub fn new(detector: Option<Arc<dyn FeatureDetector>>, capacity: usize) -> Self {
        Self {
            detector,
            capacity: capacity.max(1),
            cells: Mutex::new(VecDeque::new()),
        }
    }

    pub fn has_detector(&self) -> bool {
        self.detector.is_some()
    }

    /// Regions for `image` as seen in `orientation`; concurrent callers
    /// wait for one detection
    pub fn regions_for(&self, image: &Image, orientation: Orientation) -> Arc<Vec<FeatureRegion>> {
        let Some(detector) = &self.detector else {
            return Arc::new(Vec::new());
        };

        let memo_key = (image.id(), orientation);
        let cell = {
            let mut cells = self.cells.lock();
            let existing = cells
                .iter()
                .position(|(key, _)| *key == memo_key)
                .and_then(|pos| cells.remove(pos));
            if let Some(entry) = existing {
                let cell = entry.1.clone();
                cells.push_back(entry);
                cell
            } else {
                let cell: RegionCell = Arc::new(OnceCell::new());
                cells.push_back((memo_key, cell.clone()));
                while cells.len() > self.capacity {
                    cells.pop_front();
                }
                cell
            }
        };

        cell.get_or_init(|| {
            let regions = detector.detect(image, orientation);
            tracing::debug!(
                "Detected {} feature regions in image {} ({:?})",
                regions.len(),
                image.id(),
                orientation
            );
            Arc::new(regions)
        })
        .clone()
    }

    /// Forget the regions of one image, in every orientation
    pub fn forget(&self, image: ImageId) {
        self.cells.lock().retain(|((id, _), _)| *id != image);
    }

    pub fn clear(&self) {
        self.cells.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.cells.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
