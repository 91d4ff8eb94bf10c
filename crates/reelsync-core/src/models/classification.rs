use serde::{Deserialize, Serialize};

/// Which tier produced a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationSource {
    Deterministic,
    Semantic,
}

/// Structured identity derived from a filename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub show_name: String,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    /// Always within [0, 1].
    pub confidence: f64,
    pub reasoning: String,
    pub source: ClassificationSource,
}

impl Classification {
    /// Confidence ceiling for a season with no episode.
    pub const SEASON_ONLY_CONFIDENCE: f64 = 0.4;

    pub fn deterministic(
        show_name: impl Into<String>,
        season: Option<u32>,
        episode: Option<u32>,
        confidence: f64,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            show_name: show_name.into(),
            season,
            episode,
            confidence,
            reasoning: reasoning.into(),
            source: ClassificationSource::Deterministic,
        }
        .normalized()
    }

    /// Clamp confidence and cap season-only results.
    pub fn normalized(mut self) -> Self {
        self.confidence = if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if self.season.is_some() && self.episode.is_none() {
            self.confidence = self.confidence.min(Self::SEASON_ONLY_CONFIDENCE);
        }
        self
    }

    pub fn is_routable(&self) -> bool {
        !self.show_name.is_empty() && self.episode.is_some()
    }
}
