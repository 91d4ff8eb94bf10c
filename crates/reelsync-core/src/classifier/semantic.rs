//! External semantic classifier contract.
//!
//! Backends turn a filename into a [`SemanticResponse`]. Whatever they return is
//! validated here before it can become a [`Classification`].

use crate::error::{Result, SyncError};
use crate::models::{Classification, ClassificationSource};
use async_trait::async_trait;
use serde::Deserialize;

/// Instruction sent ahead of the filename.
pub const PARSE_PROMPT: &str = "You extract TV show metadata from media filenames.\n\
Reply with a single JSON object and nothing else, using exactly these keys:\n\
  \"show_name\": the full show name as a string,\n\
  \"season\": the season number as an integer, or null unless the filename states a season,\n\
  \"episode\": the episode number as an integer, or null if absent,\n\
  \"confidence\": a number between 0.0 and 1.0,\n\
  \"reasoning\": one short sentence explaining the choices.\n\
Ignore release groups, resolutions, codecs and checksums.";

pub fn build_prompt(filename: &str) -> String {
    format!("{}\n\nFilename: {}", PARSE_PROMPT, filename)
}

/// Raw answer from a semantic backend, before validation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SemanticResponse {
    pub show_name: String,
    #[serde(default)]
    pub season: Option<i64>,
    #[serde(default)]
    pub episode: Option<i64>,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl SemanticResponse {
    /// Validate and convert into a classification.
    pub fn into_classification(self) -> Result<Classification> {
        let show_name = self.show_name.trim().to_string();
        if show_name.is_empty() {
            return Err(malformed("empty show_name"));
        }
        if !self.confidence.is_finite() {
            return Err(malformed("confidence is not a number"));
        }
        let season = to_number(self.season, "season")?;
        let episode = to_number(self.episode, "episode")?;

        Ok(Classification {
            show_name,
            season,
            episode,
            confidence: self.confidence,
            reasoning: self
                .reasoning
                .unwrap_or_else(|| "semantic classifier".to_string()),
            source: ClassificationSource::Semantic,
        }
        .normalized())
    }
}

fn to_number(value: Option<i64>, field: &str) -> Result<Option<u32>> {
    match value {
        None => Ok(None),
        Some(n) => u32::try_from(n)
            .map(Some)
            .map_err(|_| malformed(&format!("{} out of range: {}", field, n))),
    }
}

fn malformed(message: &str) -> SyncError {
    SyncError::Classification {
        message: format!("malformed semantic response: {}", message),
    }
}

/// Parse backend text that should contain one JSON object, possibly wrapped
/// in prose or a code fence.
pub fn parse_response(text: &str) -> Result<SemanticResponse> {
    let object = extract_json_object(text).ok_or_else(|| malformed("no JSON object found"))?;
    serde_json::from_str(object).map_err(|e| malformed(&e.to_string()))
}

/// First balanced `{...}` in `text`, respecting JSON string escapes.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// A semantic filename classifier reachable over some transport.
#[async_trait]
pub trait SemanticClassifier: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Whether concurrent `classify` calls are safe. Callers serialize when false.
    fn concurrency_safe(&self) -> bool {
        false
    }

    async fn classify(&self, filename: &str) -> Result<SemanticResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let response = parse_response(
            r#"{"show_name": "Show Name", "season": 2, "episode": 5, "confidence": 0.92, "reasoning": "SxxExx"}"#,
        )
        .unwrap();
        assert_eq!(response.show_name, "Show Name");
        assert_eq!(response.season, Some(2));
        assert_eq!(response.episode, Some(5));
    }

    #[test]
    fn test_parse_wrapped_json() {
        let text = "Sure! ```json\n{\"show_name\": \"A {weird} \\\"name\\\"\", \"season\": null, \"episode\": 3, \"confidence\": 0.8}\n```";
        let response = parse_response(text).unwrap();
        assert_eq!(response.show_name, "A {weird} \"name\"");
        assert_eq!(response.season, None);
        assert_eq!(response.reasoning, None);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_response("no json here").is_err());
        assert!(parse_response("{\"show_name\": \"x\"").is_err());
        assert!(parse_response("{\"season\": 1}").is_err());
    }

    #[test]
    fn test_validation() {
        let ok = SemanticResponse {
            show_name: "  Show  ".to_string(),
            season: Some(1),
            episode: Some(2),
            confidence: 1.7,
            reasoning: None,
        }
        .into_classification()
        .unwrap();
        assert_eq!(ok.show_name, "Show");
        assert_eq!(ok.confidence, 1.0);
        assert_eq!(ok.source, ClassificationSource::Semantic);

        let empty = SemanticResponse {
            show_name: " ".to_string(),
            season: None,
            episode: Some(2),
            confidence: 0.9,
            reasoning: None,
        };
        assert!(empty.into_classification().is_err());

        let negative = SemanticResponse {
            show_name: "Show".to_string(),
            season: None,
            episode: Some(-1),
            confidence: 0.9,
            reasoning: None,
        };
        assert!(negative.into_classification().is_err());
    }

    #[test]
    fn test_build_prompt_includes_filename() {
        let prompt = build_prompt("Show - 01.mkv");
        assert!(prompt.ends_with("Filename: Show - 01.mkv"));
    }
}
