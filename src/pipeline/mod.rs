//! Media and knowledge-graph pipeline.
//!
//! Three executors cover the long-running work the agent delegates to
//! background jobs: transcribing a media URL, extracting a knowledge graph
//! from a stored transcript and bootstrapping a merged graph from an
//! existing transcript library. Transcription and extraction call external
//! services and are only registered when their endpoints are configured.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::jobs::ExecutorRegistry;

pub mod bootstrap;
pub mod extraction;
pub mod transcription;

pub use bootstrap::BootstrapExecutor;
pub use extraction::ExtractionExecutor;
pub use transcription::TranscriptionExecutor;

/// Character budget per extractor request. Keeps chunks well under typical
/// service limits while leaving enough context for entity resolution.
pub const CHUNK_CHARS: usize = 4000;

/// A normalized transcript stored under `DATA_DIR/transcripts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub text: String,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
    pub created_at: DateTime<Utc>,
}

/// One timed span of speech, in seconds from the start of the media.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeGraph {
    #[serde(default)]
    pub entities: Vec<GraphEntity>,
    #[serde(default)]
    pub relations: Vec<GraphRelation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEntity {
    pub name: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRelation {
    pub source: String,
    pub target: String,
    pub label: String,
}

/// A stored graph file under `DATA_DIR/graphs`. Extraction writes one per
/// transcript; bootstrap writes one merged over the whole library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDocument {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_id: Option<String>,
    #[serde(flatten)]
    pub graph: KnowledgeGraph,
    pub created_at: DateTime<Utc>,
}

impl KnowledgeGraph {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty()
    }

    /// Fold `other` into this graph. Entities are matched by
    /// case-insensitive name; the first occurrence wins, later ones only
    /// backfill a missing description. Relations are deduplicated on
    /// (source, label, target), also case-insensitively.
    pub fn merge(&mut self, other: KnowledgeGraph) {
        for entity in other.entities {
            match self
                .entities
                .iter_mut()
                .find(|e| e.name.eq_ignore_ascii_case(&entity.name))
            {
                Some(existing) => {
                    if existing.description.is_none() {
                        existing.description = entity.description;
                    }
                }
                None => self.entities.push(entity),
            }
        }
        for relation in other.relations {
            let duplicate = self.relations.iter().any(|r| {
                r.source.eq_ignore_ascii_case(&relation.source)
                    && r.target.eq_ignore_ascii_case(&relation.target)
                    && r.label.eq_ignore_ascii_case(&relation.label)
            });
            if !duplicate {
                self.relations.push(relation);
            }
        }
    }
}

/// Split text into chunks of at most `max_chars` bytes, breaking after
/// sentence terminators and newlines where possible. A single run longer
/// than the budget is hard-split on a character boundary.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    for piece in text.split_inclusive(['.', '!', '?', '\n']) {
        if !current.is_empty() && current.len() + piece.len() > max_chars {
            flush_chunk(&mut chunks, &mut current);
        }
        if piece.len() > max_chars {
            flush_chunk(&mut chunks, &mut current);
            let mut rest = piece;
            while rest.len() > max_chars {
                let (head, tail) = split_at_char_boundary(rest, max_chars);
                let head = head.trim();
                if !head.is_empty() {
                    chunks.push(head.to_string());
                }
                rest = tail;
            }
            current.push_str(rest);
        } else {
            current.push_str(piece);
        }
    }
    flush_chunk(&mut chunks, &mut current);
    chunks
}

fn flush_chunk(chunks: &mut Vec<String>, current: &mut String) {
    let chunk = std::mem::take(current);
    let trimmed = chunk.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

fn split_at_char_boundary(s: &str, max: usize) -> (&str, &str) {
    let mut cut = max.min(s.len());
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    if cut == 0 {
        cut = s.chars().next().map(|c| c.len_utf8()).unwrap_or(s.len());
    }
    s.split_at(cut)
}

/// Build the executor registry for the current configuration. Executors
/// whose external service is not configured are left out, so submitting
/// their job type fails fast with a clear error.
pub fn build_executor_registry(config: &Config) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();

    match &config.pipeline.speech_api_url {
        Some(speech_url) => registry.register(Arc::new(TranscriptionExecutor::new(
            speech_url.clone(),
            config.pipeline.ffmpeg_path.clone(),
            config.data_dir.clone(),
        ))),
        None => info!("SPEECH_API_URL not set, transcription jobs are disabled"),
    }

    match &config.pipeline.extractor_api_url {
        Some(extractor_url) => registry.register(Arc::new(ExtractionExecutor::new(
            extractor_url.clone(),
            config.data_dir.clone(),
        ))),
        None => info!("EXTRACTOR_API_URL not set, extraction jobs are disabled"),
    }

    registry.register(Arc::new(BootstrapExecutor::new(config.data_dir.clone())));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobType;
    use std::path::PathBuf;

    fn entity(name: &str, kind: &str, description: Option<&str>) -> GraphEntity {
        GraphEntity {
            name: name.to_string(),
            kind: kind.to_string(),
            description: description.map(|d| d.to_string()),
        }
    }

    fn relation(source: &str, label: &str, target: &str) -> GraphRelation {
        GraphRelation {
            source: source.to_string(),
            target: target.to_string(),
            label: label.to_string(),
        }
    }

    #[test]
    fn chunks_respect_the_budget_and_keep_all_text() {
        let sentence = "The quick brown fox jumps over the lazy dog. ";
        let text = sentence.repeat(40);
        let chunks = chunk_text(&text, 200);

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() <= 200));
        let rejoined: usize = chunks.iter().map(|c| c.matches("fox").count()).sum();
        assert_eq!(rejoined, 40);
    }

    #[test]
    fn oversized_run_is_hard_split() {
        let text = "x".repeat(950);
        let chunks = chunk_text(&text, 300);
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.len() <= 300));
        assert_eq!(chunks.iter().map(String::len).sum::<usize>(), 950);
    }

    #[test]
    fn hard_split_respects_multibyte_boundaries() {
        let text = "é".repeat(100);
        let chunks = chunk_text(&text, 7);
        assert!(chunks.iter().all(|c| c.len() <= 7));
        assert_eq!(chunks.iter().map(|c| c.chars().count()).sum::<usize>(), 100);
    }

    #[test]
    fn empty_and_whitespace_input_produce_no_chunks() {
        assert!(chunk_text("", 100).is_empty());
        assert!(chunk_text("   \n\n  ", 100).is_empty());
    }

    #[test]
    fn merge_deduplicates_entities_case_insensitively() {
        let mut graph = KnowledgeGraph {
            entities: vec![entity("Ada Lovelace", "person", None)],
            relations: vec![],
        };
        graph.merge(KnowledgeGraph {
            entities: vec![
                entity("ada lovelace", "person", Some("First programmer")),
                entity("Analytical Engine", "machine", None),
            ],
            relations: vec![],
        });

        assert_eq!(graph.entities.len(), 2);
        assert_eq!(graph.entities[0].name, "Ada Lovelace");
        assert_eq!(
            graph.entities[0].description.as_deref(),
            Some("First programmer")
        );
    }

    #[test]
    fn merge_deduplicates_relations() {
        let mut graph = KnowledgeGraph {
            entities: vec![],
            relations: vec![relation("Ada", "designed", "Engine")],
        };
        graph.merge(KnowledgeGraph {
            entities: vec![],
            relations: vec![
                relation("ada", "DESIGNED", "engine"),
                relation("Ada", "wrote", "Notes"),
            ],
        });

        assert_eq!(graph.relations.len(), 2);
        assert_eq!(graph.relations[1].label, "wrote");
    }

    #[test]
    fn registry_reflects_configured_endpoints() {
        let mut config = Config::new(PathBuf::from("/tmp"));
        config.pipeline.speech_api_url = Some("http://localhost:9000/transcribe".to_string());
        config.pipeline.extractor_api_url = None;

        let registry = build_executor_registry(&config);
        assert!(registry.contains(JobType::Transcription));
        assert!(!registry.contains(JobType::Extraction));
        assert!(registry.contains(JobType::Bootstrap));
    }
}
