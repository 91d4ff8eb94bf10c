//! Filename classification.
//!
//! Two tiers: when a semantic backend is configured it is consulted for every
//! filename and its answer is accepted at or above the confidence threshold.
//! Otherwise the deterministic pattern parser in [`patterns`] decides. Backend
//! failures of any kind fall back silently.

pub mod backends;
pub mod patterns;
pub mod semantic;
pub mod token;

pub use backends::{
    create_semantic_classifier, AnthropicClassifier, OllamaClassifier, OpenAiClassifier,
};
pub use semantic::{SemanticClassifier, SemanticResponse};
pub use token::extract_provided_token;

use crate::config::ClassifierSettings;
use crate::models::Classification;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Two-tier classifier handed to the pipeline at construction.
pub struct FilenameClassifier {
    semantic: Option<Arc<dyn SemanticClassifier>>,
    threshold: f64,
    timeout: Duration,
    /// Present when semantic calls must not overlap.
    gate: Option<Mutex<()>>,
}

impl FilenameClassifier {
    /// Deterministic tier only.
    pub fn deterministic() -> Self {
        Self {
            semantic: None,
            threshold: ClassifierSettings::DEFAULT_CONFIDENCE_THRESHOLD,
            timeout: Duration::from_millis(ClassifierSettings::DEFAULT_TIMEOUT_MS),
            gate: None,
        }
    }

    /// Build from settings. `semantic` is ignored when the settings disable it.
    pub fn new(semantic: Option<Arc<dyn SemanticClassifier>>, settings: &ClassifierSettings) -> Self {
        let semantic = semantic.filter(|_| settings.enabled);
        let gate = semantic
            .as_ref()
            .filter(|s| settings.serialize_calls || !s.concurrency_safe())
            .map(|_| Mutex::new(()));

        Self {
            semantic,
            threshold: settings.confidence_threshold,
            timeout: settings.timeout(),
            gate,
        }
    }

    pub fn semantic_enabled(&self) -> bool {
        self.semantic.is_some()
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Classify `filename`. Never fails.
    pub async fn classify(&self, filename: &str) -> Classification {
        let fallback = patterns::classify(filename);
        let Some(backend) = &self.semantic else {
            return fallback;
        };

        match self.consult(backend, filename).await {
            Some(result) if result.confidence >= self.threshold => {
                debug!(
                    "Semantic result accepted for {} (confidence {:.2})",
                    filename, result.confidence
                );
                result
            }
            Some(result) => {
                debug!(
                    "Semantic result below threshold for {} ({:.2} < {:.2})",
                    filename, result.confidence, self.threshold
                );
                fallback
            }
            None => fallback,
        }
    }

    async fn consult(
        &self,
        backend: &Arc<dyn SemanticClassifier>,
        filename: &str,
    ) -> Option<Classification> {
        let _turn = match &self.gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };

        let task_backend = Arc::clone(backend);
        let task_filename = filename.to_string();
        let handle = tokio::spawn(async move { task_backend.classify(&task_filename).await });
        let abort = handle.abort_handle();

        let response = match tokio::time::timeout(self.timeout, handle).await {
            Err(_) => {
                abort.abort();
                warn!(
                    "Semantic classifier {} timed out after {:?} on {}",
                    backend.name(),
                    self.timeout,
                    filename
                );
                return None;
            }
            Ok(Err(join_error)) => {
                warn!(
                    "Semantic classifier {} crashed on {}: {}",
                    backend.name(),
                    filename,
                    join_error
                );
                return None;
            }
            Ok(Ok(Err(e))) => {
                warn!("Semantic classifier {} failed on {}: {}", backend.name(), filename, e);
                return None;
            }
            Ok(Ok(Ok(response))) => response,
        };

        let mut result = match response.into_classification() {
            Ok(result) => result,
            Err(e) => {
                warn!("Discarding semantic result for {}: {}", filename, e);
                return None;
            }
        };

        if result.season.is_some() && !patterns::has_season_marker(filename) {
            result.season = None;
            result.reasoning.push_str(" (season dropped: not present in filename)");
        }
        Some(result.normalized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, SyncError};
    use crate::models::ClassificationSource;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behavior {
        Answer(SemanticResponse),
        Fail,
        Hang,
        Panic,
    }

    struct MockSemantic {
        behavior: Behavior,
        safe: bool,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl MockSemantic {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                safe: false,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }

        fn answering(show: &str, season: Option<i64>, episode: Option<i64>, confidence: f64) -> Arc<Self> {
            Self::new(Behavior::Answer(SemanticResponse {
                show_name: show.to_string(),
                season,
                episode,
                confidence,
                reasoning: Some("mock".to_string()),
            }))
        }
    }

    #[async_trait]
    impl SemanticClassifier for MockSemantic {
        fn name(&self) -> &str {
            "mock"
        }

        fn concurrency_safe(&self) -> bool {
            self.safe
        }

        async fn classify(&self, _filename: &str) -> Result<SemanticResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match &self.behavior {
                Behavior::Answer(r) => Ok(r.clone()),
                Behavior::Fail => Err(SyncError::Network {
                    message: "connection refused".to_string(),
                }),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!()
                }
                Behavior::Panic => panic!("backend exploded"),
            }
        }
    }

    fn enabled_settings() -> ClassifierSettings {
        ClassifierSettings {
            enabled: true,
            timeout_ms: 1_000,
            ..Default::default()
        }
    }

    fn with(mock: &Arc<MockSemantic>, settings: &ClassifierSettings) -> FilenameClassifier {
        let backend: Arc<dyn SemanticClassifier> = mock.clone();
        FilenameClassifier::new(Some(backend), settings)
    }

    // Deterministic tier gives 0.1 here.
    const OPAQUE: &str = "Some Opaque Release Name.mkv";

    #[tokio::test]
    async fn test_confident_semantic_result_is_used() {
        let mock = MockSemantic::answering("Opaque Show", None, Some(4), 0.9);
        let classifier = with(&mock, &enabled_settings());

        let result = classifier.classify(OPAQUE).await;
        assert_eq!(result.show_name, "Opaque Show");
        assert_eq!(result.episode, Some(4));
        assert_eq!(result.source, ClassificationSource::Semantic);
    }

    #[tokio::test]
    async fn test_low_confidence_falls_back_to_deterministic() {
        let mock = MockSemantic::answering("Opaque Show", None, Some(4), 0.69);
        let classifier = with(&mock, &enabled_settings());

        let result = classifier.classify(OPAQUE).await;
        assert_eq!(result, patterns::classify(OPAQUE));
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backend_consulted_even_when_patterns_are_confident() {
        let mock = MockSemantic::answering("Show Name (2019)", Some(2), Some(5), 0.9);
        let classifier = with(&mock, &enabled_settings());

        let result = classifier.classify("Show.Name.S02E05.mkv").await;
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.show_name, "Show Name (2019)");
        assert_eq!(result.source, ClassificationSource::Semantic);
    }

    #[tokio::test]
    async fn test_unsure_backend_keeps_confident_pattern_result() {
        let mock = MockSemantic::answering("Other", None, Some(1), 0.3);
        let classifier = with(&mock, &enabled_settings());

        let result = classifier.classify("Show.Name.S02E05.mkv").await;
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result, patterns::classify("Show.Name.S02E05.mkv"));
        assert_eq!(result.show_name, "Show Name");
    }

    #[tokio::test]
    async fn test_backend_error_falls_back() {
        let mock = MockSemantic::new(Behavior::Fail);
        let classifier = with(&mock, &enabled_settings());
        assert_eq!(classifier.classify(OPAQUE).await, patterns::classify(OPAQUE));
    }

    #[tokio::test]
    async fn test_backend_panic_falls_back() {
        let mock = MockSemantic::new(Behavior::Panic);
        let classifier = with(&mock, &enabled_settings());
        assert_eq!(classifier.classify(OPAQUE).await, patterns::classify(OPAQUE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_timeout_falls_back() {
        let mock = MockSemantic::new(Behavior::Hang);
        let classifier = with(&mock, &enabled_settings());
        assert_eq!(classifier.classify(OPAQUE).await, patterns::classify(OPAQUE));
    }

    #[tokio::test]
    async fn test_malformed_result_falls_back() {
        let mock = MockSemantic::answering("   ", None, Some(4), 0.99);
        let classifier = with(&mock, &enabled_settings());
        assert_eq!(classifier.classify(OPAQUE).await, patterns::classify(OPAQUE));
    }

    #[tokio::test]
    async fn test_unsupported_season_is_dropped() {
        let mock = MockSemantic::answering("Opaque Show", Some(2), Some(4), 0.95);
        let classifier = with(&mock, &enabled_settings());

        let result = classifier.classify(OPAQUE).await;
        assert_eq!(result.season, None);
        assert_eq!(result.episode, Some(4));
    }

    #[tokio::test]
    async fn test_season_only_semantic_result_is_rejected() {
        let mock = MockSemantic::answering("Opaque Show", Some(2), None, 0.95);
        let classifier = with(&mock, &enabled_settings());
        let name = "Opaque Release S2 Batch.mkv";
        let result = classifier.classify(name).await;
        assert_eq!(result.source, ClassificationSource::Deterministic);
        assert!(result.confidence <= 0.5);
    }

    #[tokio::test]
    async fn test_disabled_settings_ignore_backend() {
        let mock = MockSemantic::answering("Opaque Show", None, Some(4), 0.99);
        let settings = ClassifierSettings::default();
        let classifier = with(&mock, &settings);

        assert!(!classifier.semantic_enabled());
        assert_eq!(classifier.classify(OPAQUE).await, patterns::classify(OPAQUE));
        assert_eq!(mock.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_calls_are_serialized_through_gate() {
        let mock = MockSemantic::answering("Opaque Show", None, Some(4), 0.9);
        let classifier = Arc::new(with(&mock, &enabled_settings()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let classifier = Arc::clone(&classifier);
                tokio::spawn(async move { classifier.classify(OPAQUE).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(mock.calls.load(Ordering::SeqCst), 8);
        assert_eq!(mock.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_safe_backend_may_run_concurrently() {
        let mock = Arc::new(MockSemantic {
            behavior: Behavior::Answer(SemanticResponse {
                show_name: "Opaque Show".to_string(),
                season: None,
                episode: Some(4),
                confidence: 0.9,
                reasoning: None,
            }),
            safe: true,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let settings = ClassifierSettings {
            serialize_calls: false,
            ..enabled_settings()
        };
        let classifier = Arc::new(with(&mock, &settings));

        let results = futures::future::join_all((0..4).map(|_| classifier.classify(OPAQUE))).await;
        assert_eq!(results.len(), 4);
        assert!(mock.max_in_flight.load(Ordering::SeqCst) > 1);
    }
}
