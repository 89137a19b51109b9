//! Per-segment face identity cache.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of one recognized individual.
///
/// Identifiers are random, so two segments never hand out the same one even
/// when they see the same face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityId(Uuid);

impl IdentityId {
    /// Fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for IdentityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "person-{}", self.0.simple())
    }
}

#[derive(Debug, Clone)]
struct Identity {
    id: IdentityId,
    references: Vec<Vec<f32>>,
}

/// Reference embeddings for the individuals seen so far in one segment.
#[derive(Debug, Clone)]
pub struct IdentityCache {
    threshold: f32,
    max_references: usize,
    identities: Vec<Identity>,
}

impl IdentityCache {
    /// Cache that accepts a match at `threshold` cosine similarity and keeps at
    /// most `max_references` embeddings per identity.
    #[must_use]
    pub fn new(threshold: f32, max_references: usize) -> Self {
        Self {
            threshold,
            max_references: max_references.max(1),
            identities: Vec::new(),
        }
    }

    /// Number of distinct individuals seen.
    #[must_use]
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    /// Returns true if no face has been seen.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Best matching identity for `embedding` and its similarity, if any
    /// identity reaches the threshold.
    ///
    /// An identity's score is the highest similarity over its references.
    #[must_use]
    pub fn lookup(&self, embedding: &[f32]) -> Option<(IdentityId, f32)> {
        self.identities
            .iter()
            .filter_map(|identity| {
                identity
                    .references
                    .iter()
                    .map(|reference| cosine_similarity(embedding, reference))
                    .fold(None, |best: Option<f32>, sim| Some(best.map_or(sim, |b| b.max(sim))))
                    .map(|score| (identity.id, score))
            })
            .filter(|(_, score)| *score >= self.threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Returns the identity `embedding` belongs to, registering a new one if
    /// nothing matches. Matched embeddings are kept as extra references until
    /// the per-identity cap is reached.
    pub fn identify(&mut self, embedding: Vec<f32>) -> IdentityId {
        if let Some((id, _)) = self.lookup(&embedding) {
            if let Some(identity) = self.identities.iter_mut().find(|identity| identity.id == id) {
                if identity.references.len() < self.max_references {
                    identity.references.push(embedding);
                }
            }
            return id;
        }

        let id = IdentityId::new();
        self.identities.push(Identity {
            id,
            references: vec![embedding],
        });
        id
    }
}

/// Cosine similarity; zero for empty, zero-norm or mismatched vectors.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.iter().zip(b.iter()) {
        let xf = f64::from(x);
        let yf = f64::from(y);
        dot += xf * yf;
        norm_a += xf * xf;
        norm_b += yf * yf;
    }

    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 0.0;
    }

    let sim = dot / (norm_a.sqrt() * norm_b.sqrt());
    if sim.is_finite() {
        #[allow(clippy::cast_possible_truncation)]
        let sim = sim as f32;
        sim
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_handles_degenerate_vectors() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn same_face_gets_same_id() {
        let mut cache = IdentityCache::new(0.9, 4);
        let a = cache.identify(vec![1.0, 0.0, 0.0]);
        let b = cache.identify(vec![0.99, 0.05, 0.0]);
        let c = cache.identify(vec![0.0, 1.0, 0.0]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn best_scoring_identity_wins() {
        let mut cache = IdentityCache::new(0.5, 4);
        let x = cache.identify(vec![1.0, 0.0]);
        let y = cache.identify(vec![0.0, 1.0]);
        assert_ne!(x, y);
        let (id, _) = cache.lookup(&[0.2, 0.9]).unwrap();
        assert_eq!(id, y);
    }

    #[test]
    fn references_are_capped() {
        let mut cache = IdentityCache::new(0.0, 2);
        for _ in 0..5 {
            cache.identify(vec![1.0, 1.0]);
        }
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.identities[0].references.len(), 2);
    }

    #[test]
    fn display_is_prefixed() {
        let id = IdentityId::new();
        let text = id.to_string();
        assert!(text.starts_with("person-"));
        assert_eq!(text.len(), "person-".len() + 32);
    }
}
