/// Maps a squared L2 distance onto `[0, 1]` with `1 - d / max_distance`.
///
/// The strong-retrieval guardrail is phrased in terms of this score, so a
/// positive confidence and a passing retrieval check always coincide.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceScorer {
    max_distance: f32,
}

impl Default for ConfidenceScorer {
    fn default() -> Self {
        Self { max_distance: 1.5 }
    }
}

impl ConfidenceScorer {
    pub fn new(max_distance: f32) -> Self {
        Self { max_distance }
    }

    pub fn max_distance(&self) -> f32 {
        self.max_distance
    }

    pub fn score(&self, distance: f32) -> f32 {
        if distance.is_nan() {
            return 0.0;
        }
        (1.0 - distance / self.max_distance).clamp(0.0, 1.0)
    }

    /// Confidence for a result list; no neighbours means no confidence.
    pub fn score_best(&self, best_distance: Option<f32>) -> f32 {
        best_distance.map_or(0.0, |distance| self.score(distance))
    }
}
