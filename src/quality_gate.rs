//! Accept/reject decision over face detection results

use serde::{Deserialize, Serialize};
use std::fmt;

/// Minimum share of the image area the face box must cover
pub const DEFAULT_MIN_FACE_RATIO: f64 = 0.05;
/// Minimum distance between the face box and every image edge, as a fraction
pub const DEFAULT_EDGE_MARGIN: f64 = 0.01;

/// Face bounding box, every field a fraction of the image dimensions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: f64,
    pub y_min: f64,
    pub width: f64,
    pub height: f64,
}

/// A single face returned by the detector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityVerdict {
    Accepted,
    NoFace,
    MultipleFaces,
    FaceTooSmall,
    FaceTooCloseToEdge,
}

impl QualityVerdict {
    pub fn is_accepted(self) -> bool {
        self == QualityVerdict::Accepted
    }
}

impl fmt::Display for QualityVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QualityVerdict::Accepted => "accepted",
            QualityVerdict::NoFace => "no_face",
            QualityVerdict::MultipleFaces => "multiple_faces",
            QualityVerdict::FaceTooSmall => "face_too_small",
            QualityVerdict::FaceTooCloseToEdge => "face_too_close_to_edge",
        };
        f.write_str(name)
    }
}

/// Policy constants for the gate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityThresholds {
    pub min_face_ratio: f64,
    pub edge_margin: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_face_ratio: DEFAULT_MIN_FACE_RATIO,
            edge_margin: DEFAULT_EDGE_MARGIN,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QualityGate {
    thresholds: QualityThresholds,
}

impl QualityGate {
    pub fn new(thresholds: QualityThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> QualityThresholds {
        self.thresholds
    }

    /// Evaluate detections for an image of the given pixel size.
    ///
    /// Precedence is NoFace, MultipleFaces, FaceTooSmall, FaceTooCloseToEdge.
    /// Comparisons are written so that NaN coordinates never pass.
    pub fn evaluate(
        &self,
        detections: &[Detection],
        image_width: u32,
        image_height: u32,
    ) -> QualityVerdict {
        let face = match detections {
            [] => return QualityVerdict::NoFace,
            [single] => single.bbox,
            _ => return QualityVerdict::MultipleFaces,
        };

        let ratio = face_ratio(&face, image_width, image_height);
        if ratio.is_nan() || ratio < self.thresholds.min_face_ratio {
            return QualityVerdict::FaceTooSmall;
        }

        let margin = self.thresholds.edge_margin;
        let inside = face.x_min >= margin
            && face.y_min >= margin
            && face.x_min + face.width <= 1.0 - margin
            && face.y_min + face.height <= 1.0 - margin;
        if !inside {
            return QualityVerdict::FaceTooCloseToEdge;
        }

        QualityVerdict::Accepted
    }
}

/// Face area over image area, computed in pixels
fn face_ratio(face: &BoundingBox, image_width: u32, image_height: u32) -> f64 {
    let image_area = f64::from(image_width) * f64::from(image_height);
    if image_area <= 0.0 {
        return 0.0;
    }
    let face_width = face.width * f64::from(image_width);
    let face_height = face.height * f64::from(image_height);
    face_width * face_height / image_area
}
