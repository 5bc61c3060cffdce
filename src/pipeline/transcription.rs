//! Transcription executor: media URL to stored transcript.
//!
//! Downloads the media, strips it to mono 16 kHz WAV with ffmpeg, sends the
//! audio to the speech service and writes the normalized transcript to
//! `DATA_DIR/transcripts/<job>.json`. Scratch media files are removed after
//! the run whether it succeeds or not.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};
use url::Url;

use super::{Transcript, TranscriptSegment};
use crate::jobs::{JobContext, JobExecutor, JobStage, JobType};

pub struct TranscriptionExecutor {
    client: Client,
    speech_api_url: String,
    ffmpeg_path: String,
    data_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct TranscriptionParams {
    media_url: String,
    #[serde(default)]
    title: Option<String>,
}

/// Speech service response. Segments and language are optional so plainer
/// backends that only return text still work.
#[derive(Debug, Deserialize)]
struct SpeechResponse {
    text: String,
    #[serde(default)]
    segments: Vec<SpeechSegment>,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SpeechSegment {
    start: f64,
    end: f64,
    text: String,
}

impl TranscriptionExecutor {
    pub fn new(speech_api_url: String, ffmpeg_path: String, data_dir: PathBuf) -> Self {
        Self {
            client: Client::new(),
            speech_api_url,
            ffmpeg_path,
            data_dir,
        }
    }

    async fn download(&self, ctx: &JobContext, url: &Url, dest: &Path) -> Result<u64> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .context("media download request failed")?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("media download failed: {}", status);
        }

        let mut file = fs::File::create(dest)
            .await
            .with_context(|| format!("failed to create {}", dest.display()))?;
        let mut stream = response.bytes_stream();
        let mut bytes: u64 = 0;
        while let Some(chunk) = stream.next().await {
            ctx.check_cancelled()?;
            let chunk = chunk.context("media download interrupted")?;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("failed to write {}", dest.display()))?;
            bytes += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(bytes)
    }

    async fn extract_audio(&self, media: &Path, wav: &Path) -> Result<()> {
        let output = Command::new(&self.ffmpeg_path)
            .arg("-i")
            .arg(media)
            .args(["-vn", "-ac", "1", "-ar", "16000", "-f", "wav", "-y"])
            .arg(wav)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    anyhow::anyhow!(
                        "ffmpeg not found at '{}'. Install ffmpeg or set FFMPEG_PATH.",
                        self.ffmpeg_path
                    )
                } else {
                    anyhow::anyhow!("failed to run ffmpeg: {}", e)
                }
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr_tail(&stderr, 500)
            );
        }
        Ok(())
    }

    async fn transcribe_audio(&self, wav: &Path) -> Result<SpeechResponse> {
        let audio = fs::read(wav)
            .await
            .with_context(|| format!("failed to read {}", wav.display()))?;
        let response = self
            .client
            .post(&self.speech_api_url)
            .header("Content-Type", "audio/wav")
            .body(audio)
            .send()
            .await
            .context("speech service request failed")?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("speech service returned {}: {}", status, body);
        }
        serde_json::from_str(&body).context("failed to parse speech service response")
    }

    async fn run_pipeline(
        &self,
        ctx: &JobContext,
        params: &TranscriptionParams,
        media_path: &Path,
        wav_path: &Path,
    ) -> Result<String> {
        let url = validate_media_url(&params.media_url)?;

        ctx.progress.stage(JobStage::Downloading).await;
        let bytes = self.download(ctx, &url, media_path).await?;
        debug!("Job {}: downloaded {} bytes from {}", ctx.job_id, bytes, url);

        ctx.check_cancelled()?;
        ctx.progress.stage(JobStage::ExtractingAudio).await;
        self.extract_audio(media_path, wav_path).await?;

        ctx.check_cancelled()?;
        ctx.progress.stage(JobStage::Transcribing).await;
        let speech = self.transcribe_audio(wav_path).await?;
        if let Some(language) = &speech.language {
            debug!("Job {}: detected language {}", ctx.job_id, language);
        }

        ctx.check_cancelled()?;
        ctx.progress.stage(JobStage::Processing).await;
        let transcript = Transcript {
            id: ctx.job_id.to_string(),
            title: params
                .title
                .clone()
                .unwrap_or_else(|| derive_title(&url)),
            source_url: Some(url.to_string()),
            text: normalize_text(&speech.text),
            segments: speech
                .segments
                .into_iter()
                .filter(|s| !s.text.trim().is_empty())
                .map(|s| TranscriptSegment {
                    start: s.start,
                    end: s.end,
                    text: s.text.trim().to_string(),
                })
                .collect(),
            created_at: chrono::Utc::now(),
        };
        if transcript.text.is_empty() {
            anyhow::bail!("speech service returned an empty transcript");
        }

        let transcripts_dir = self.data_dir.join("transcripts");
        fs::create_dir_all(&transcripts_dir)
            .await
            .with_context(|| format!("failed to create {}", transcripts_dir.display()))?;
        let transcript_path = transcripts_dir.join(format!("{}.json", transcript.id));
        let json = serde_json::to_string_pretty(&transcript)?;
        fs::write(&transcript_path, json)
            .await
            .with_context(|| format!("failed to write {}", transcript_path.display()))?;
        info!(
            "Job {}: transcript \"{}\" written to {}",
            ctx.job_id,
            transcript.title,
            transcript_path.display()
        );

        ctx.progress.stage(JobStage::Finalizing).await;
        Ok(format!(
            "Transcribed \"{}\" ({} segments, {} characters). Transcript id: {}.",
            transcript.title,
            transcript.segments.len(),
            transcript.text.chars().count(),
            transcript.id
        ))
    }
}

#[async_trait]
impl JobExecutor for TranscriptionExecutor {
    fn job_type(&self) -> JobType {
        JobType::Transcription
    }

    async fn run(&self, ctx: JobContext) -> Result<String> {
        let params: TranscriptionParams = serde_json::from_value(ctx.params.clone())
            .context("invalid transcription params, expected { media_url, title? }")?;

        let media_dir = self.data_dir.join("media");
        fs::create_dir_all(&media_dir)
            .await
            .with_context(|| format!("failed to create {}", media_dir.display()))?;
        let media_path = media_dir.join(format!("{}{}", ctx.job_id, guess_extension(&params.media_url)));
        let wav_path = media_dir.join(format!("{}.wav", ctx.job_id));

        let result = self.run_pipeline(&ctx, &params, &media_path, &wav_path).await;

        for scratch in [&media_path, &wav_path] {
            match fs::remove_file(scratch).await {
                Ok(()) => debug!("Job {}: removed scratch file {}", ctx.job_id, scratch.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    "Job {}: failed to remove scratch file {}: {}",
                    ctx.job_id,
                    scratch.display(),
                    e
                ),
            }
        }
        result
    }
}

fn validate_media_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("invalid media URL: {}", raw))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => anyhow::bail!("unsupported media URL scheme: {}", other),
    }
}

/// Extension for the scratch download, taken from the URL path so ffmpeg
/// can sniff the container format. Falls back to `.bin`.
fn guess_extension(raw_url: &str) -> String {
    let ext = Url::parse(raw_url).ok().and_then(|url| {
        let path = url.path().to_string();
        Path::new(&path)
            .extension()
            .map(|e| e.to_string_lossy().to_string())
    });
    match ext {
        Some(ext) if !ext.is_empty() && ext.len() <= 5 => format!(".{}", ext.to_lowercase()),
        _ => ".bin".to_string(),
    }
}

fn derive_title(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(|name| {
            Path::new(name)
                .file_stem()
                .map(|s| s.to_string_lossy().replace(['-', '_'], " "))
                .unwrap_or_else(|| name.to_string())
        })
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| "Untitled media".to_string())
}

fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.replace("\r\n", "\n").split('\n') {
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out.trim().to_string()
}

fn stderr_tail(stderr: &str, max: usize) -> &str {
    let trimmed = stderr.trim();
    if trimmed.len() <= max {
        return trimmed;
    }
    let mut cut = trimmed.len() - max;
    while cut < trimmed.len() && !trimmed.is_char_boundary(cut) {
        cut += 1;
    }
    &trimmed[cut..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_http_and_https_urls_are_accepted() {
        assert!(validate_media_url("https://example.com/talk.mp3").is_ok());
        assert!(validate_media_url("http://example.com/talk.mp4").is_ok());
        assert!(validate_media_url("ftp://example.com/talk.mp3").is_err());
        assert!(validate_media_url("file:///etc/passwd").is_err());
        assert!(validate_media_url("not a url").is_err());
    }

    #[test]
    fn extension_comes_from_the_url_path() {
        assert_eq!(guess_extension("https://example.com/a/talk.MP3?sig=abc"), ".mp3");
        assert_eq!(guess_extension("https://example.com/stream"), ".bin");
        assert_eq!(guess_extension("https://example.com/"), ".bin");
        // A long trailing token is not a real extension.
        assert_eq!(guess_extension("https://example.com/v/dQw4w9WgXcQ.mediafile"), ".bin");
    }

    #[test]
    fn title_falls_back_when_the_path_is_bare() {
        let url = Url::parse("https://example.com/talks/intro-to-graphs.mp3").unwrap();
        assert_eq!(derive_title(&url), "intro to graphs");
        let url = Url::parse("https://example.com/").unwrap();
        assert_eq!(derive_title(&url), "Untitled media");
    }

    #[test]
    fn normalization_strips_trailing_space_and_outer_blank_lines() {
        let raw = "  \nHello there.   \r\nSecond line.\t\n\n";
        assert_eq!(normalize_text(raw), "Hello there.\nSecond line.");
    }

    #[test]
    fn stderr_tail_keeps_the_end_of_long_output() {
        let long = format!("{}{}", "x".repeat(600), "the real error");
        let tail = stderr_tail(&long, 100);
        assert!(tail.len() <= 100);
        assert!(tail.ends_with("the real error"));
    }
}
