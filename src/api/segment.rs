//! Segments: contiguous frame ranges of one video.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::ApiError;
use crate::media::Video;
use crate::selector::{AnswerSelector, Decision};

use super::frame::Frame;
use super::identity::{IdentityCache, IdentityId};
use super::ApiContext;

/// A view over frames `[start, end)` of a video, in the original video's
/// coordinates.
///
/// Each segment owns its identity cache. Trimming creates a new segment
/// with a fresh cache; nothing is shared between segments.
pub struct Segment {
    video: Arc<Video>,
    start: usize,
    end: usize,
    ctx: Arc<ApiContext>,
    identities: RefCell<IdentityCache>,
}

impl Segment {
    /// Segment over the whole video.
    pub fn new(video: Arc<Video>, ctx: Arc<ApiContext>) -> Result<Self, ApiError> {
        let end = video.len();
        Self::with_bounds(video, 0, end, ctx)
    }

    fn with_bounds(video: Arc<Video>, start: usize, end: usize, ctx: Arc<ApiContext>) -> Result<Self, ApiError> {
        if end <= start {
            return Err(ApiError::EmptySegment { start, end });
        }
        let identities = RefCell::new(IdentityCache::new(
            ctx.segment.face_match_threshold,
            ctx.segment.max_references,
        ));
        Ok(Self {
            video,
            start,
            end,
            ctx,
            identities,
        })
    }

    /// Absolute index of the first frame.
    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    /// Absolute index one past the last frame.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.end
    }

    /// Frames in the segment.
    #[must_use]
    pub const fn num_frames(&self) -> usize {
        self.end - self.start
    }

    /// Context the segment dispatches through.
    #[must_use]
    pub fn context(&self) -> &Arc<ApiContext> {
        &self.ctx
    }

    /// Sub-segment with bounds relative to this segment.
    ///
    /// Missing bounds default to this segment's own; both are clamped into
    /// `[0, num_frames]`, so trims compose without double offsetting.
    pub fn trim(&self, start: Option<i64>, end: Option<i64>) -> Result<Self, ApiError> {
        let n = self.num_frames();
        let clamp = |v: i64| usize::try_from(v.max(0)).unwrap_or(usize::MAX).min(n);
        let rel_start = start.map_or(0, clamp);
        let rel_end = end.map_or(n, clamp);
        let (abs_start, abs_end) = (self.start + rel_start, self.start + rel_end);
        debug!(from = %self, start = abs_start, end = abs_end, "trim");
        Self::with_bounds(Arc::clone(&self.video), abs_start, abs_end, Arc::clone(&self.ctx))
    }

    /// Lazily yields this segment's frames in order.
    ///
    /// Every call starts a new, independent pass.
    #[must_use]
    pub fn frame_iterator(&self) -> FrameIter {
        FrameIter {
            video: Arc::clone(&self.video),
            ctx: Arc::clone(&self.ctx),
            next: self.start,
            end: self.end,
        }
    }

    /// Frame at relative `index`; indexes past the end give the last frame.
    #[must_use]
    pub fn frame_from_index(&self, index: i64) -> Frame {
        let last = self.num_frames() - 1;
        let rel = usize::try_from(index.max(0)).unwrap_or(usize::MAX).min(last);
        self.frame_at(self.start + rel)
    }

    fn frame_at(&self, absolute: usize) -> Frame {
        make_frame(&self.video, &self.ctx, absolute)
    }

    /// Identity of the face in `frame`, or `None` when the embedding model
    /// finds no face. Unmatched faces are registered as new identities in
    /// this segment's cache.
    pub fn face_identify(&self, frame: &Frame) -> Result<Option<IdentityId>, ApiError> {
        let Some(embedding) = self.ctx.client.face_embedding(frame.payload())? else {
            return Ok(None);
        };
        let id = self.identities.borrow_mut().identify(embedding);
        Ok(Some(id))
    }

    /// Number of identities seen so far in this segment.
    #[must_use]
    pub fn identity_count(&self) -> usize {
        self.identities.borrow().len()
    }

    /// Compresses `evidence` and asks the decision model to pick one of
    /// `options`.
    pub fn select_answer(
        &self,
        evidence: &serde_json::Value,
        question: &str,
        options: &[String],
    ) -> Result<Decision, ApiError> {
        let selector = AnswerSelector::new(&self.ctx.selector, self.ctx.client.as_ref());
        Ok(selector.select(evidence, question, options)?)
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("identities", &self.identity_count())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Segment({}, {})", self.start, self.end)
    }
}

fn make_frame(video: &Video, ctx: &Arc<ApiContext>, absolute: usize) -> Frame {
    // Bounds were checked against the video when the segment was built.
    let image = video.frame(absolute).cloned().unwrap_or_default();
    let annotation = video.annotation(absolute).cloned().unwrap_or_default();
    Frame::new(image, annotation, absolute, Arc::clone(ctx))
}

/// Iterator over a segment's frames. Holds its own handles, so it outlives
/// the segment borrow that created it.
pub struct FrameIter {
    video: Arc<Video>,
    ctx: Arc<ApiContext>,
    next: usize,
    end: usize,
}

impl Iterator for FrameIter {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.next >= self.end {
            return None;
        }
        let frame = make_frame(&self.video, &self.ctx, self.next);
        self.next += 1;
        Some(frame)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end.saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for FrameIter {}

impl fmt::Debug for FrameIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameIter")
            .field("next", &self.next)
            .field("end", &self.end)
            .finish_non_exhaustive()
    }
}
