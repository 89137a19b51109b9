//! Frames: crops of one video frame with perception operations.

use std::fmt;
use std::sync::{Arc, OnceLock};

use image::RgbImage;
use regex::Regex;

use crate::dispatch::{DispatchClient, ModelCall, ModelId};
use crate::error::ApiError;
use crate::media::{BoundingBox, FrameAnnotation, ImageCrop};

use super::ApiContext;

const DEFAULT_QUESTION: &str = "What is this?";
const YESNO_SUFFIX: &str = " Please answer yes or no.";

/// A crop (possibly the whole image) of one video frame.
///
/// Frames hold only geometry, the frame's annotation and a handle on the
/// dispatch client. Every perception operation is a model call.
#[derive(Clone)]
pub struct Frame {
    image: Arc<RgbImage>,
    bbox: BoundingBox,
    annotation: Arc<FrameAnnotation>,
    index: usize,
    ctx: Arc<ApiContext>,
}

impl Frame {
    /// Frame covering the whole image. `index` is the absolute frame index
    /// in the original video.
    #[must_use]
    pub fn new(
        image: Arc<RgbImage>,
        annotation: Arc<FrameAnnotation>,
        index: usize,
        ctx: Arc<ApiContext>,
    ) -> Self {
        let bbox = BoundingBox::full(image.width(), image.height());
        Self {
            image,
            bbox,
            annotation,
            index,
            ctx,
        }
    }

    fn child(&self, bbox: BoundingBox) -> Self {
        Self {
            image: Arc::clone(&self.image),
            bbox,
            annotation: Arc::clone(&self.annotation),
            index: self.index,
            ctx: Arc::clone(&self.ctx),
        }
    }

    fn client(&self) -> &DispatchClient {
        &self.ctx.client
    }

    /// Crop rectangle in the source frame.
    #[must_use]
    pub const fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    /// Absolute frame index in the video.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Left edge of the crop.
    #[must_use]
    pub const fn left(&self) -> u32 {
        self.bbox.left
    }

    /// Lower edge of the crop.
    #[must_use]
    pub const fn lower(&self) -> u32 {
        self.bbox.lower
    }

    /// Right edge of the crop.
    #[must_use]
    pub const fn right(&self) -> u32 {
        self.bbox.right
    }

    /// Upper edge of the crop.
    #[must_use]
    pub const fn upper(&self) -> u32 {
        self.bbox.upper
    }

    /// Crop width in pixels.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.bbox.width()
    }

    /// Crop height in pixels.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.bbox.height()
    }

    /// Horizontal midpoint of the crop.
    #[must_use]
    pub fn horizontal_center(&self) -> f64 {
        self.bbox.horizontal_center()
    }

    /// Vertical midpoint of the crop.
    #[must_use]
    pub fn vertical_center(&self) -> f64 {
        self.bbox.vertical_center()
    }

    /// The crop as a model payload.
    #[must_use]
    pub fn payload(&self) -> ImageCrop {
        ImageCrop {
            image: Arc::clone(&self.image),
            bbox: self.bbox,
        }
    }

    /// Subtitles attached to this frame's index.
    #[must_use]
    pub fn get_subtitles(&self) -> &[String] {
        &self.annotation.subtitles
    }

    /// Annotated boxes of the underlying frame.
    #[must_use]
    pub fn annotated_boxes(&self) -> &[BoundingBox] {
        &self.annotation.bboxes
    }

    /// Localizes `object_name` inside this crop. Each hit becomes a child
    /// frame in absolute coordinates; hits that fall outside the crop are
    /// dropped.
    pub fn find(&self, object_name: &str) -> Result<Vec<Self>, ApiError> {
        let boxes = self.client().detect(self.payload(), object_name)?;
        Ok(boxes
            .iter()
            .filter_map(|relative| self.bbox.offset_child(relative))
            .map(|bbox| self.child(bbox))
            .collect())
    }

    /// Returns true if `find` yields at least one crop.
    pub fn exists(&self, object_name: &str) -> Result<bool, ApiError> {
        Ok(!self.find(object_name)?.is_empty())
    }

    /// The option that best describes this crop.
    pub fn best_text_match(&self, options: &[String], prefix: Option<&str>) -> Result<String, ApiError> {
        let mut call = ModelCall::new(ModelId::TextMatch)
            .arg(self.payload())
            .arg(options.to_vec());
        if let Some(prefix) = prefix {
            call = call.kwarg("prefix", prefix);
        }
        Ok(self.client().call_text(call)?)
    }

    /// Visual question answering on this crop.
    ///
    /// Without a question the model is asked "What is this?". With
    /// `to_yesno` the reply is reduced to `"yes"` or `"no"`.
    pub fn simple_query(&self, question: Option<&str>, to_yesno: bool) -> Result<String, ApiError> {
        let question = question.unwrap_or(DEFAULT_QUESTION);
        let prompt = if to_yesno {
            format!("{question}{YESNO_SUFFIX}")
        } else {
            question.to_string()
        };
        let reply = self
            .client()
            .call_text(ModelCall::new(ModelId::Vqa).arg(self.payload()).arg(prompt))?;
        Ok(if to_yesno { coerce_yes_no(&reply) } else { reply })
    }

    /// Text-only question; the crop is not sent.
    pub fn llm_query(&self, question: &str, to_yesno: bool) -> Result<String, ApiError> {
        llm_query(self.client(), question, to_yesno)
    }

    /// Sub-crop with coordinates relative to this crop, clamped to it.
    pub fn crop(&self, left: i64, lower: i64, right: i64, upper: i64) -> Result<Self, ApiError> {
        let relative = BoundingBox::new(left.max(0), lower.max(0), right, upper)?;
        let bbox = self.bbox.offset_child(&relative).ok_or(ApiError::InvalidCrop {
            left,
            lower,
            right,
            upper,
        })?;
        Ok(self.child(bbox))
    }

    /// Returns true if the given absolute box touches or overlaps this crop.
    #[must_use]
    pub fn overlaps_with(&self, left: i64, lower: i64, right: i64, upper: i64) -> bool {
        i64::from(self.bbox.left) <= right
            && i64::from(self.bbox.right) >= left
            && i64::from(self.bbox.lower) <= upper
            && i64::from(self.bbox.upper) >= lower
    }

    /// Returns true if the two crops share area.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.bbox.overlaps(&other.bbox)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("index", &self.index)
            .field("bbox", &self.bbox)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame(index={}, left={}, lower={}, right={}, upper={})",
            self.index, self.bbox.left, self.bbox.lower, self.bbox.right, self.bbox.upper
        )
    }
}

/// `"yes"` or `"no"`.
#[must_use]
pub const fn bool_to_yesno(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn yes_no_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(yes|no)\b").ok()).as_ref()
}

/// Reduces a free-form reply to `"yes"` or `"no"`: the first standalone
/// yes/no word wins, and a reply with neither counts as `"no"`.
#[must_use]
pub fn coerce_yes_no(reply: &str) -> String {
    let found = yes_no_regex()
        .and_then(|re| re.captures(reply))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_ascii_lowercase());
    found.unwrap_or_else(|| bool_to_yesno(false).to_string())
}

/// Text-only question to the language model.
pub fn llm_query(client: &DispatchClient, question: &str, to_yesno: bool) -> Result<String, ApiError> {
    let prompt = if to_yesno {
        format!("{question}{YESNO_SUFFIX}")
    } else {
        question.to_string()
    };
    let reply = client.call_text(ModelCall::new(ModelId::Llm).arg(prompt))?;
    Ok(if to_yesno { coerce_yes_no(&reply) } else { reply })
}

/// Index of the frame most likely to contain `content`.
pub fn best_image_match(frames: &[Frame], content: Vec<String>) -> Result<Option<usize>, ApiError> {
    let Some(first) = frames.first() else {
        return Ok(None);
    };
    let crops = frames.iter().map(Frame::payload).collect();
    let index = first.client().image_match(crops, content)?;
    Ok(index.filter(|&i| i < frames.len()))
}

/// Distance between the edges of two crops. Overlapping crops get the
/// negated intersection over union instead.
#[must_use]
pub fn distance(a: &Frame, b: &Frame) -> f64 {
    let (a, b) = (a.bbox, b.bbox);
    if a.overlaps(&b) {
        let inter_w = f64::from(a.right.min(b.right) - a.left.max(b.left));
        let inter_h = f64::from(a.upper.min(b.upper) - a.lower.max(b.lower));
        let inter = inter_w * inter_h;
        let area = |bb: BoundingBox| f64::from(bb.width()) * f64::from(bb.height());
        let union = area(a) + area(b) - inter;
        return if union > 0.0 { -inter / union } else { 0.0 };
    }
    let dx = f64::from(a.left.saturating_sub(b.right).max(b.left.saturating_sub(a.right)));
    let dy = f64::from(a.lower.saturating_sub(b.upper).max(b.lower.saturating_sub(a.upper)));
    dx.hypot(dy)
}

fn numeric_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").ok()).as_ref()
}

/// First number in `text`; for a range such as `"10-15"` that is the lower end.
#[must_use]
pub fn coerce_to_numeric(text: &str) -> Option<f64> {
    let cleaned = text.replace(',', "");
    numeric_regex()
        .and_then(|re| re.find(&cleaned))
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::{DispatchConfig, SegmentConfig, SelectorConfig};
    use crate::dispatch::{Dispatcher, FnBackend, ModelOutput, ModelRegistry};

    fn frame_with(registry: ModelRegistry) -> (Dispatcher, Frame) {
        let dispatcher = Dispatcher::start(&DispatchConfig::default(), registry);
        let ctx = Arc::new(ApiContext::new(
            Arc::new(dispatcher.client(0)),
            SegmentConfig::default(),
            SelectorConfig::default(),
        ));
        let annotation = FrameAnnotation {
            bboxes: Vec::new(),
            subtitles: vec!["hello there".to_string()],
        };
        let frame = Frame::new(Arc::new(RgbImage::new(100, 80)), Arc::new(annotation), 3, ctx);
        (dispatcher, frame)
    }

    #[test]
    fn coerce_picks_first_yes_or_no() {
        assert_eq!(coerce_yes_no("Yes, clearly."), "yes");
        assert_eq!(coerce_yes_no("I think no; yes is wrong"), "no");
        assert_eq!(coerce_yes_no("nobody knows"), "no");
        assert_eq!(coerce_yes_no("eyes open"), "no");
        assert_eq!(bool_to_yesno(true), "yes");
    }

    #[test]
    fn numeric_coercion() {
        assert_eq!(coerce_to_numeric("about 10-15 people"), Some(10.0));
        assert_eq!(coerce_to_numeric("1,200.5 meters"), Some(1200.5));
        assert_eq!(coerce_to_numeric("none"), None);
    }

    #[test]
    fn find_returns_absolute_child_frames() {
        let registry = ModelRegistry::new().with(
            ModelId::ObjectDetector,
            FnBackend::new(|call| {
                let crop = call.image_arg().ok_or("no image")?;
                assert_eq!(call.text_arg(1), Some("person"));
                let w = i64::from(crop.bbox.width());
                Ok(ModelOutput::Boxes(vec![
                    BoundingBox::new(0, 0, 10, 10).map_err(|e| e.to_string())?,
                    BoundingBox::new(w / 2, 0, w, 20).map_err(|e| e.to_string())?,
                ]))
            }),
        );
        let (_dispatcher, frame) = frame_with(registry);
        let sub = frame.crop(20, 10, 60, 50).unwrap();
        assert_eq!(sub.bbox(), BoundingBox::new(20, 10, 60, 50).unwrap());

        let people = sub.find("person").unwrap();
        assert_eq!(people.len(), 2);
        assert_eq!(people[0].bbox(), BoundingBox::new(20, 10, 30, 20).unwrap());
        assert_eq!(people[1].bbox(), BoundingBox::new(40, 10, 60, 30).unwrap());
        assert_eq!(people[1].index(), 3);
        assert_eq!(people[1].get_subtitles(), ["hello there".to_string()]);
        assert!(sub.exists("person").unwrap());
    }

    #[test]
    fn simple_query_defaults_and_coerces() {
        let registry = ModelRegistry::new().with(
            ModelId::Vqa,
            FnBackend::new(|call| {
                let question = call.text_arg(1).unwrap_or_default();
                Ok(ModelOutput::Text(if question.ends_with("yes or no.") {
                    "Yes it is".to_string()
                } else {
                    format!("asked: {question}")
                }))
            }),
        );
        let (_dispatcher, frame) = frame_with(registry);
        assert_eq!(frame.simple_query(None, false).unwrap(), "asked: What is this?");
        assert_eq!(frame.simple_query(Some("Is it red?"), true).unwrap(), "yes");
    }

    #[test]
    fn dispatch_failure_surfaces_as_api_error() {
        let (_dispatcher, frame) = frame_with(ModelRegistry::new());
        let err = frame.llm_query("anything", false).unwrap_err();
        assert!(matches!(err, ApiError::Dispatch(_)));
    }

    #[test]
    fn crop_outside_is_rejected() {
        let (_dispatcher, frame) = frame_with(ModelRegistry::new());
        assert!(frame.crop(200, 0, 300, 10).is_err());
        assert!(frame.crop(10, 10, 5, 20).is_err());
        let clamped = frame.crop(-5, -5, 500, 500).unwrap();
        assert_eq!(clamped.bbox(), BoundingBox::full(100, 80));
    }

    #[test]
    fn geometry_helpers() {
        let (_dispatcher, frame) = frame_with(ModelRegistry::new());
        let a = frame.crop(0, 0, 10, 10).unwrap();
        let b = frame.crop(5, 5, 15, 15).unwrap();
        let c = frame.crop(20, 0, 30, 10).unwrap();
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(a.overlaps_with(10, 0, 20, 10));
        assert!((distance(&a, &c) - 10.0).abs() < 1e-9);
        // 25 shared pixels over a union of 175.
        assert!((distance(&a, &b) + 25.0 / 175.0).abs() < 1e-9);
    }
}
