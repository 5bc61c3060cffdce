//! Bootstrap executor: build one merged graph over a transcript library.
//!
//! Walks a directory of transcript JSON files, imports them into
//! `DATA_DIR/transcripts` when they come from elsewhere, then folds every
//! per-transcript graph into a single `bootstrap-<job>.json` document.
//! Unreadable files are skipped with a warning so one bad record never
//! sinks the whole import.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{GraphDocument, KnowledgeGraph, Transcript};
use crate::jobs::{JobContext, JobExecutor, JobStage, JobType};

pub struct BootstrapExecutor {
    data_dir: PathBuf,
}

#[derive(Debug, Default, serde::Deserialize)]
struct BootstrapParams {
    #[serde(default)]
    library_dir: Option<String>,
}

impl BootstrapExecutor {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    fn transcripts_dir(&self) -> PathBuf {
        self.data_dir.join("transcripts")
    }

    fn graphs_dir(&self) -> PathBuf {
        self.data_dir.join("graphs")
    }
}

#[async_trait]
impl JobExecutor for BootstrapExecutor {
    fn job_type(&self) -> JobType {
        JobType::Bootstrap
    }

    async fn run(&self, ctx: JobContext) -> Result<String> {
        let params: BootstrapParams = if ctx.params.is_null() {
            BootstrapParams::default()
        } else {
            serde_json::from_value(ctx.params.clone())
                .context("invalid bootstrap params, expected { library_dir? }")?
        };
        let library_dir = params
            .library_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| self.transcripts_dir());
        if !library_dir.is_dir() {
            anyhow::bail!(
                "transcript library {} does not exist",
                library_dir.display()
            );
        }

        ctx.progress.stage(JobStage::ScanningLibrary).await;
        let files = scan_json_files(&library_dir);
        info!(
            "Job {}: found {} transcript files under {}",
            ctx.job_id,
            files.len(),
            library_dir.display()
        );

        ctx.progress.stage(JobStage::ImportingTranscripts).await;
        let transcripts_dir = self.transcripts_dir();
        fs::create_dir_all(&transcripts_dir)
            .await
            .with_context(|| format!("failed to create {}", transcripts_dir.display()))?;
        let importing = library_dir != transcripts_dir;
        let mut imported = 0usize;
        let mut skipped = 0usize;
        for file in &files {
            ctx.check_cancelled()?;
            let transcript = match read_transcript(file).await {
                Some(t) => t,
                None => {
                    skipped += 1;
                    continue;
                }
            };
            if importing {
                if !is_safe_file_id(&transcript.id) {
                    warn!(
                        "Skipping transcript with unsafe id {:?} from {}",
                        transcript.id,
                        file.display()
                    );
                    skipped += 1;
                    continue;
                }
                let dest = transcripts_dir.join(format!("{}.json", transcript.id));
                let encoded = serde_json::to_string_pretty(&transcript)?;
                fs::write(&dest, encoded)
                    .await
                    .with_context(|| format!("failed to write {}", dest.display()))?;
                debug!("Job {}: imported {}", ctx.job_id, dest.display());
            }
            imported += 1;
        }

        ctx.check_cancelled()?;
        ctx.progress.stage(JobStage::IndexingGraph).await;
        let graphs_dir = self.graphs_dir();
        fs::create_dir_all(&graphs_dir)
            .await
            .with_context(|| format!("failed to create {}", graphs_dir.display()))?;
        let mut graph = KnowledgeGraph::default();
        let mut merged_graphs = 0usize;
        // Earlier bootstrap outputs are left out so the merge only sees
        // per-transcript graphs.
        for file in scan_json_files(&graphs_dir) {
            if file_stem_starts_with(&file, "bootstrap-") {
                continue;
            }
            ctx.check_cancelled()?;
            match read_graph(&file).await {
                Some(document) => {
                    graph.merge(document.graph);
                    merged_graphs += 1;
                }
                None => skipped += 1,
            }
        }

        let document = GraphDocument {
            id: format!("bootstrap-{}", ctx.job_id),
            transcript_id: None,
            graph,
            created_at: chrono::Utc::now(),
        };
        let out_path = graphs_dir.join(format!("{}.json", document.id));
        let encoded = serde_json::to_string_pretty(&document)?;
        fs::write(&out_path, encoded)
            .await
            .with_context(|| format!("failed to write {}", out_path.display()))?;
        info!(
            "Job {}: bootstrap graph written to {}",
            ctx.job_id,
            out_path.display()
        );

        ctx.progress.stage(JobStage::Finalizing).await;
        Ok(format!(
            "Imported {} transcripts ({} skipped) and merged {} graphs: {} entities, {} relations.",
            imported,
            skipped,
            merged_graphs,
            document.graph.entities.len(),
            document.graph.relations.len()
        ))
    }
}

fn scan_json_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
        .collect()
}

async fn read_transcript(path: &Path) -> Option<Transcript> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!("Skipping unreadable transcript {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(transcript) => Some(transcript),
        Err(e) => {
            warn!("Skipping invalid transcript {}: {}", path.display(), e);
            None
        }
    }
}

async fn read_graph(path: &Path) -> Option<GraphDocument> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!("Skipping unreadable graph {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(document) => Some(document),
        Err(e) => {
            warn!("Skipping invalid graph {}: {}", path.display(), e);
            None
        }
    }
}

fn is_safe_file_id(id: &str) -> bool {
    !id.is_empty()
        && !id.contains(['/', '\\'])
        && !id.contains("..")
        && !id.starts_with('.')
}

fn file_stem_starts_with(path: &Path, prefix: &str) -> bool {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().starts_with(prefix))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::MemoryJobStore;
    use crate::jobs::{Job, JobStatus, ProgressHandle};
    use crate::pipeline::{GraphEntity, GraphRelation};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn test_ctx(params: serde_json::Value) -> (JobContext, Arc<Mutex<HashMap<Uuid, Job>>>) {
        let job = Job::new(JobType::Bootstrap, params.clone(), None);
        let mut map = HashMap::new();
        map.insert(job.id, job.clone());
        let index = Arc::new(Mutex::new(map));
        let ctx = JobContext {
            job_id: job.id,
            params,
            progress: ProgressHandle::new(
                job.id,
                JobType::Bootstrap,
                Arc::clone(&index),
                Arc::new(MemoryJobStore::new()),
            ),
            cancel: CancellationToken::new(),
        };
        (ctx, index)
    }

    fn transcript(id: &str, text: &str) -> Transcript {
        Transcript {
            id: id.to_string(),
            title: format!("Talk {}", id),
            source_url: None,
            text: text.to_string(),
            segments: vec![],
            created_at: chrono::Utc::now(),
        }
    }

    fn graph_doc(id: &str, entity: &str) -> GraphDocument {
        GraphDocument {
            id: id.to_string(),
            transcript_id: Some(id.to_string()),
            graph: KnowledgeGraph {
                entities: vec![GraphEntity {
                    name: entity.to_string(),
                    kind: "person".to_string(),
                    description: None,
                }],
                relations: vec![GraphRelation {
                    source: entity.to_string(),
                    target: "Graphs".to_string(),
                    label: "talks about".to_string(),
                }],
            },
            created_at: chrono::Utc::now(),
        }
    }

    async fn write_json<T: serde::Serialize>(path: &Path, value: &T) {
        fs::write(path, serde_json::to_string_pretty(value).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn merges_the_library_and_skips_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let transcripts = dir.path().join("transcripts");
        let graphs = dir.path().join("graphs");
        fs::create_dir_all(&transcripts).await.unwrap();
        fs::create_dir_all(&graphs).await.unwrap();

        write_json(&transcripts.join("t1.json"), &transcript("t1", "First talk.")).await;
        write_json(&transcripts.join("t2.json"), &transcript("t2", "Second talk.")).await;
        fs::write(transcripts.join("broken.json"), "{ nope").await.unwrap();

        write_json(&graphs.join("g1.json"), &graph_doc("g1", "Ada")).await;
        // Same entity under a different case plus one new relation.
        let mut g2 = graph_doc("g2", "ada");
        g2.graph.relations.push(GraphRelation {
            source: "Ada".to_string(),
            target: "Notes".to_string(),
            label: "wrote".to_string(),
        });
        write_json(&graphs.join("g2.json"), &g2).await;

        let executor = BootstrapExecutor::new(dir.path().to_path_buf());
        let (ctx, index) = test_ctx(json!(null));
        let job_id = ctx.job_id;
        let summary = executor.run(ctx).await.unwrap();

        assert!(summary.contains("Imported 2 transcripts (1 skipped)"));
        assert!(summary.contains("merged 2 graphs"));
        assert!(summary.contains("1 entities"));
        assert!(summary.contains("2 relations"));

        let out = graphs.join(format!("bootstrap-{}.json", job_id));
        let document: GraphDocument =
            serde_json::from_str(&fs::read_to_string(&out).await.unwrap()).unwrap();
        assert_eq!(document.graph.entities.len(), 1);
        assert_eq!(document.graph.entities[0].name, "Ada");
        assert_eq!(document.graph.relations.len(), 2);

        let job = index.lock().await.get(&job_id).cloned().unwrap();
        assert_eq!(job.progress_percent, 100);
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn imports_transcripts_from_an_external_library() {
        let dir = tempfile::tempdir().unwrap();
        let library = dir.path().join("library");
        fs::create_dir_all(&library).await.unwrap();
        write_json(&library.join("a.json"), &transcript("talk-a", "Alpha.")).await;
        write_json(&library.join("b.json"), &transcript("talk-b", "Beta.")).await;

        let executor = BootstrapExecutor::new(dir.path().to_path_buf());
        let (ctx, _) = test_ctx(json!({ "library_dir": library.to_string_lossy() }));
        let summary = executor.run(ctx).await.unwrap();

        assert!(summary.contains("Imported 2 transcripts (0 skipped)"));
        let transcripts = dir.path().join("transcripts");
        assert!(transcripts.join("talk-a.json").is_file());
        assert!(transcripts.join("talk-b.json").is_file());
    }

    #[tokio::test]
    async fn earlier_bootstrap_documents_are_not_folded_back_in() {
        let dir = tempfile::tempdir().unwrap();
        let transcripts = dir.path().join("transcripts");
        let graphs = dir.path().join("graphs");
        fs::create_dir_all(&transcripts).await.unwrap();
        fs::create_dir_all(&graphs).await.unwrap();
        write_json(&graphs.join("g1.json"), &graph_doc("g1", "Ada")).await;
        write_json(
            &graphs.join("bootstrap-old.json"),
            &graph_doc("bootstrap-old", "Stale"),
        )
        .await;

        let executor = BootstrapExecutor::new(dir.path().to_path_buf());
        let (ctx, _) = test_ctx(json!(null));
        let summary = executor.run(ctx).await.unwrap();

        assert!(summary.contains("merged 1 graphs"));
        assert!(!summary.contains("Stale"));
    }

    #[tokio::test]
    async fn missing_library_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let executor = BootstrapExecutor::new(dir.path().to_path_buf());
        let (ctx, _) = test_ctx(json!({ "library_dir": "/definitely/not/here" }));

        let err = executor.run(ctx).await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
