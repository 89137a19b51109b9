//! The frame/segment API that reasoning programs call into.
//!
//! Every perception or language operation is a pass-through to the
//! dispatch layer through the worker's [`DispatchClient`]; the only state
//! these types keep is geometry and each segment's identity cache.

pub mod frame;
pub mod identity;
pub mod segment;

use std::fmt;
use std::sync::Arc;

use crate::config::{SegmentConfig, SelectorConfig};
use crate::dispatch::DispatchClient;

pub use frame::{
    best_image_match, bool_to_yesno, coerce_to_numeric, coerce_yes_no, distance, llm_query, Frame,
};
pub use identity::{cosine_similarity, IdentityCache, IdentityId};
pub use segment::{FrameIter, Segment};

/// Everything a frame or segment needs to reach the models: the worker's
/// dispatch client plus segment and selector settings.
pub struct ApiContext {
    /// Dispatch client of the worker running the program.
    pub client: Arc<DispatchClient>,
    /// Frame iteration and identity matching settings.
    pub segment: SegmentConfig,
    /// Evidence summarization budgets.
    pub selector: SelectorConfig,
}

impl ApiContext {
    /// Bundles a context.
    #[must_use]
    pub const fn new(client: Arc<DispatchClient>, segment: SegmentConfig, selector: SelectorConfig) -> Self {
        Self {
            client,
            segment,
            selector,
        }
    }
}

impl fmt::Debug for ApiContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiContext")
            .field("worker", &self.client.worker())
            .field("segment", &self.segment)
            .finish_non_exhaustive()
    }
}
