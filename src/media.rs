//! Frame pixel data, geometry and per-frame annotation.
//!
//! Decoding and sampling happen upstream; a [`Video`] is the already-sampled
//! sequence of RGB frames together with one [`FrameAnnotation`] per frame.

use std::sync::Arc;

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Axis-aligned box in absolute pixel coordinates of the original frame.
///
/// `lower`/`upper` are row bounds and `left`/`right` column bounds; the box
/// covers `[left, right) x [lower, upper)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    /// First column.
    pub left: u32,
    /// First row.
    pub lower: u32,
    /// Column one past the last.
    pub right: u32,
    /// Row one past the last.
    pub upper: u32,
}

impl BoundingBox {
    /// Creates a box, rejecting empty or inverted extents.
    pub fn new(left: i64, lower: i64, right: i64, upper: i64) -> Result<Self, ApiError> {
        if left < 0 || lower < 0 || right <= left || upper <= lower {
            return Err(ApiError::InvalidCrop {
                left,
                lower,
                right,
                upper,
            });
        }
        let to_u32 = |v: i64| u32::try_from(v).unwrap_or(u32::MAX);
        Ok(Self {
            left: to_u32(left),
            lower: to_u32(lower),
            right: to_u32(right),
            upper: to_u32(upper),
        })
    }

    /// Box covering a whole `width x height` frame.
    #[must_use]
    pub const fn full(width: u32, height: u32) -> Self {
        Self {
            left: 0,
            lower: 0,
            right: width,
            upper: height,
        }
    }

    /// Columns covered.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    /// Rows covered.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.upper.saturating_sub(self.lower)
    }

    /// Midpoint between `left` and `right`.
    #[must_use]
    pub fn horizontal_center(&self) -> f64 {
        (f64::from(self.left) + f64::from(self.right)) / 2.0
    }

    /// Midpoint between `lower` and `upper`.
    #[must_use]
    pub fn vertical_center(&self) -> f64 {
        (f64::from(self.lower) + f64::from(self.upper)) / 2.0
    }

    /// Returns true if the two boxes share any area.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.left < other.right
            && other.left < self.right
            && self.lower < other.upper
            && other.lower < self.upper
    }

    /// Clamps this box into `bounds`. Returns `None` if nothing remains.
    #[must_use]
    pub fn clamp_to(&self, bounds: &Self) -> Option<Self> {
        let clamped = Self {
            left: self.left.max(bounds.left),
            lower: self.lower.max(bounds.lower),
            right: self.right.min(bounds.right),
            upper: self.upper.min(bounds.upper),
        };
        (clamped.right > clamped.left && clamped.upper > clamped.lower).then_some(clamped)
    }

    /// Translates a box expressed relative to `self` into absolute coordinates.
    #[must_use]
    pub fn offset_child(&self, child: &Self) -> Option<Self> {
        Self {
            left: self.left.saturating_add(child.left),
            lower: self.lower.saturating_add(child.lower),
            right: self.left.saturating_add(child.right),
            upper: self.lower.saturating_add(child.upper),
        }
        .clamp_to(self)
    }

    /// Euclidean distance between box centers.
    #[must_use]
    pub fn center_distance(&self, other: &Self) -> f64 {
        let dx = self.horizontal_center() - other.horizontal_center();
        let dy = self.vertical_center() - other.vertical_center();
        dx.hypot(dy)
    }
}

/// Annotation attached to one sampled frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameAnnotation {
    /// Object boxes drawn for this frame.
    #[serde(default)]
    pub bboxes: Vec<BoundingBox>,
    /// Subtitle lines shown on this frame.
    #[serde(default)]
    pub subtitles: Vec<String>,
}

/// The sampled frames of one sample, with matching annotation.
#[derive(Debug, Clone)]
pub struct Video {
    frames: Vec<Arc<RgbImage>>,
    annotations: Vec<Arc<FrameAnnotation>>,
}

impl Video {
    /// Builds a video; the annotation count must equal the frame count.
    pub fn new(frames: Vec<RgbImage>, annotations: Vec<FrameAnnotation>) -> Result<Self, ApiError> {
        if frames.len() != annotations.len() {
            return Err(ApiError::AnnotationMismatch {
                frames: frames.len(),
                annotations: annotations.len(),
            });
        }
        Ok(Self {
            frames: frames.into_iter().map(Arc::new).collect(),
            annotations: annotations.into_iter().map(Arc::new).collect(),
        })
    }

    /// Builds a video whose frames carry no annotation.
    #[must_use]
    pub fn unannotated(frames: Vec<RgbImage>) -> Self {
        let annotations = frames.iter().map(|_| Arc::new(FrameAnnotation::default())).collect();
        Self {
            frames: frames.into_iter().map(Arc::new).collect(),
            annotations,
        }
    }

    /// Number of frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Returns true if there are no frames.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Pixels of frame `index`.
    #[must_use]
    pub fn frame(&self, index: usize) -> Option<&Arc<RgbImage>> {
        self.frames.get(index)
    }

    /// Annotation of frame `index`.
    #[must_use]
    pub fn annotation(&self, index: usize) -> Option<&Arc<FrameAnnotation>> {
        self.annotations.get(index)
    }
}

/// A crop of one frame, cheap to clone and send to a model server.
#[derive(Debug, Clone)]
pub struct ImageCrop {
    /// Whole source frame.
    pub image: Arc<RgbImage>,
    /// Region of `image` the crop covers.
    pub bbox: BoundingBox,
}

impl ImageCrop {
    /// Materializes the cropped pixels.
    #[must_use]
    pub fn to_image(&self) -> RgbImage {
        image::imageops::crop_imm(
            self.image.as_ref(),
            self.bbox.left,
            self.bbox.lower,
            self.bbox.width(),
            self.bbox.height(),
        )
        .to_image()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_rejects_inverted() {
        assert!(BoundingBox::new(10, 0, 5, 10).is_err());
        assert!(BoundingBox::new(-1, 0, 5, 10).is_err());
        assert!(BoundingBox::new(0, 0, 5, 10).is_ok());
    }

    #[test]
    fn bbox_overlap_and_center() {
        let a = BoundingBox::full(10, 10);
        let b = BoundingBox::new(5, 5, 15, 15).unwrap();
        let c = BoundingBox::new(10, 0, 20, 10).unwrap();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!((a.horizontal_center() - 5.0).abs() < f64::EPSILON);
        assert!((a.center_distance(&c) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn offset_child_is_clamped_to_parent() {
        let parent = BoundingBox::new(10, 10, 20, 20).unwrap();
        let child = BoundingBox::new(5, 5, 50, 50).unwrap();
        let abs = parent.offset_child(&child).unwrap();
        assert_eq!(abs, BoundingBox::new(15, 15, 20, 20).unwrap());
    }

    #[test]
    fn video_requires_matching_annotation() {
        let frames = vec![RgbImage::new(2, 2), RgbImage::new(2, 2)];
        let err = Video::new(frames, vec![FrameAnnotation::default()]).unwrap_err();
        assert_eq!(
            err,
            ApiError::AnnotationMismatch {
                frames: 2,
                annotations: 1
            }
        );
    }

    #[test]
    fn crop_materializes_requested_region() {
        let crop = ImageCrop {
            image: Arc::new(RgbImage::new(8, 6)),
            bbox: BoundingBox::new(2, 1, 6, 4).unwrap(),
        };
        let img = crop.to_image();
        assert_eq!(img.dimensions(), (4, 3));
    }
}
