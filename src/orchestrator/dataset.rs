//! Samples and the datasets that yield them.

use std::sync::Arc;

use crate::error::{VidError, VidResult};
use crate::media::Video;

/// One question about one video. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Unique sample identifier.
    pub id: String,
    /// Sampled frames and their annotation.
    pub video: Arc<Video>,
    /// The question.
    pub query: String,
    /// Answer options, usually `yes` and `no`.
    pub possible_answers: Vec<String>,
    /// Expected answer.
    pub groundtruth: String,
    /// Grouping key such as a question category; programs may be shared
    /// across samples with the same key.
    pub group: Option<String>,
}

/// Random access to samples. Loading and decoding live behind this trait.
pub trait Dataset: Send + Sync {
    /// Number of samples.
    fn len(&self) -> usize;

    /// Returns true if there are no samples.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample at `index`, `0 <= index < len()`.
    fn get(&self, index: usize) -> VidResult<Sample>;
}

/// A dataset held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    samples: Vec<Sample>,
}

impl InMemoryDataset {
    /// Dataset over `samples`, in order.
    #[must_use]
    pub const fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }
}

impl From<Vec<Sample>> for InMemoryDataset {
    fn from(samples: Vec<Sample>) -> Self {
        Self::new(samples)
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> VidResult<Sample> {
        self.samples
            .get(index)
            .cloned()
            .ok_or_else(|| VidError::dataset(format!("sample {index} out of range (len {})", self.samples.len())))
    }
}

/// Index ranges of consecutive batches of at most `batch_size` samples.
pub fn batch_ranges(len: usize, batch_size: usize) -> impl Iterator<Item = std::ops::Range<usize>> {
    let batch_size = batch_size.max(1);
    (0..len).step_by(batch_size).map(move |start| start..(start + batch_size).min(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    use image::RgbImage;

    fn sample(id: &str) -> Sample {
        Sample {
            id: id.to_string(),
            video: Arc::new(Video::unannotated(vec![RgbImage::new(2, 2)])),
            query: "q".to_string(),
            possible_answers: Vec::new(),
            groundtruth: "yes".to_string(),
            group: None,
        }
    }

    #[test]
    fn batches_cover_every_index_once() {
        let ranges: Vec<_> = batch_ranges(7, 3).collect();
        assert_eq!(ranges, vec![0..3, 3..6, 6..7]);
        assert_eq!(batch_ranges(0, 3).count(), 0);
        assert_eq!(batch_ranges(2, 0).count(), 2);
    }

    #[test]
    fn in_memory_access() {
        let dataset = InMemoryDataset::from(vec![sample("a"), sample("b")]);
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.get(1).unwrap().id, "b");
        assert!(dataset.get(2).is_err());
    }
}
