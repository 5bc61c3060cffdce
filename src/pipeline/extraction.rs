//! Extraction executor: stored transcript to knowledge graph.
//!
//! Chunks the transcript text, sends each chunk to the extractor service
//! and merges the per-chunk entities and relations into one graph document
//! under `DATA_DIR/graphs`. Entity resolution beyond case-insensitive name
//! matching is the extractor's concern.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info, warn};

use super::{chunk_text, GraphDocument, GraphEntity, GraphRelation, KnowledgeGraph, Transcript, CHUNK_CHARS};
use crate::jobs::{JobContext, JobExecutor, JobStage, JobType};

pub struct ExtractionExecutor {
    client: Client,
    extractor_api_url: String,
    data_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ExtractionParams {
    transcript_id: String,
}

#[derive(Debug, Deserialize)]
struct ExtractorResponse {
    #[serde(default)]
    entities: Vec<GraphEntity>,
    #[serde(default)]
    relations: Vec<GraphRelation>,
}

impl ExtractionExecutor {
    pub fn new(extractor_api_url: String, data_dir: PathBuf) -> Self {
        Self {
            client: Client::new(),
            extractor_api_url,
            data_dir,
        }
    }

    async fn load_transcript(&self, transcript_id: &str) -> Result<Transcript> {
        let path = self
            .data_dir
            .join("transcripts")
            .join(format!("{}.json", transcript_id));
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                anyhow::bail!("transcript {} not found", transcript_id)
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        serde_json::from_str(&raw)
            .with_context(|| format!("transcript {} is not valid JSON", transcript_id))
    }

    async fn extract_chunk(&self, chunk: &str) -> Result<ExtractorResponse> {
        let response = self
            .client
            .post(&self.extractor_api_url)
            .json(&json!({ "text": chunk }))
            .send()
            .await
            .context("extractor service request failed")?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("extractor service returned {}: {}", status, body);
        }
        serde_json::from_str(&body).context("failed to parse extractor service response")
    }
}

#[async_trait]
impl JobExecutor for ExtractionExecutor {
    fn job_type(&self) -> JobType {
        JobType::Extraction
    }

    async fn run(&self, ctx: JobContext) -> Result<String> {
        let params: ExtractionParams = serde_json::from_value(ctx.params.clone())
            .context("invalid extraction params, expected { transcript_id }")?;
        validate_transcript_id(&params.transcript_id)?;

        ctx.progress.stage(JobStage::LoadingTranscript).await;
        let transcript = self.load_transcript(&params.transcript_id).await?;
        let chunks = chunk_text(&transcript.text, CHUNK_CHARS);
        if chunks.is_empty() {
            anyhow::bail!("transcript {} has no text to extract from", transcript.id);
        }

        ctx.progress.stage(JobStage::ExtractingEntities).await;
        let mut graph = KnowledgeGraph::default();
        let chunk_count = chunks.len();
        for (n, chunk) in chunks.iter().enumerate() {
            ctx.check_cancelled()?;
            let extracted = self.extract_chunk(chunk).await?;
            debug!(
                "Job {}: chunk {}/{} yielded {} entities, {} relations",
                ctx.job_id,
                n + 1,
                chunk_count,
                extracted.entities.len(),
                extracted.relations.len()
            );
            graph.merge(KnowledgeGraph {
                entities: extracted.entities,
                relations: extracted.relations,
            });
        }

        ctx.check_cancelled()?;
        ctx.progress.stage(JobStage::ResolvingEntities).await;
        if graph.is_empty() {
            warn!(
                "Job {}: extractor returned no entities or relations for transcript {}",
                ctx.job_id, transcript.id
            );
        }
        info!(
            "Job {}: merged graph has {} entities and {} relations",
            ctx.job_id,
            graph.entities.len(),
            graph.relations.len()
        );

        ctx.progress.stage(JobStage::WritingGraph).await;
        let graphs_dir = self.data_dir.join("graphs");
        fs::create_dir_all(&graphs_dir)
            .await
            .with_context(|| format!("failed to create {}", graphs_dir.display()))?;
        let document = GraphDocument {
            id: ctx.job_id.to_string(),
            transcript_id: Some(transcript.id.clone()),
            graph,
            created_at: chrono::Utc::now(),
        };
        let graph_path = graphs_dir.join(format!("{}.json", document.id));
        let encoded = serde_json::to_string_pretty(&document)?;
        fs::write(&graph_path, encoded)
            .await
            .with_context(|| format!("failed to write {}", graph_path.display()))?;

        ctx.progress.stage(JobStage::Finalizing).await;
        Ok(format!(
            "Extracted {} entities and {} relations from \"{}\" ({} chunks). Graph id: {}.",
            document.graph.entities.len(),
            document.graph.relations.len(),
            transcript.title,
            chunk_count,
            document.id
        ))
    }
}

/// Transcript ids become file names, so anything resembling a path is
/// rejected outright.
fn validate_transcript_id(id: &str) -> Result<()> {
    if id.is_empty()
        || id.contains(['/', '\\'])
        || id.contains("..")
        || id.starts_with('.')
    {
        anyhow::bail!("invalid transcript id: {:?}", id);
    }
    Ok(())
}
