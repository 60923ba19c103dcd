// src/artifacts.rs - Local artifact lifecycle: downloads, naming, and
// cleanup of a run's intermediate files.
use crate::error::PipelineError;
use crate::types::ArtifactRef;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Fetches remote result references (provider-hosted URLs) to bytes.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, PipelineError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, PipelineError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(PipelineError::Download(format!(
                "failed to download {}: {}",
                url,
                response.status()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Directory-backed store for a pipeline's working files.
#[derive(Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, artifact: &ArtifactRef) -> PathBuf {
        self.dir.join(artifact.file_name())
    }

    /// Persist downloaded content. Zero-byte content is rejected so a
    /// truncated download never poisons later stages.
    pub async fn write(
        &self,
        artifact: &ArtifactRef,
        content: &[u8],
    ) -> Result<PathBuf, PipelineError> {
        if content.is_empty() {
            return Err(PipelineError::Download(format!(
                "refusing to write empty artifact {}",
                artifact.file_name()
            )));
        }
        let path = self.path_for(artifact);
        tokio::fs::write(&path, content).await?;

        let written = tokio::fs::metadata(&path).await?.len();
        if written == 0 {
            return Err(PipelineError::Download(format!(
                "artifact {} is empty after write",
                artifact.file_name()
            )));
        }
        tracing::debug!("Wrote artifact {} ({} bytes)", path.display(), written);
        Ok(path)
    }

    pub async fn read(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, PipelineError> {
        Ok(tokio::fs::read(self.path_for(artifact)).await?)
    }

    /// A frame is usable only if its file exists and is non-empty.
    pub async fn exists_non_empty(&self, artifact: &ArtifactRef) -> bool {
        match tokio::fs::metadata(self.path_for(artifact)).await {
            Ok(meta) => meta.len() > 0,
            Err(_) => false,
        }
    }

    /// Remove a run's intermediate images. The final video is the run's
    /// output and is left in place. Missing files are not an error, so
    /// the call is safe to repeat.
    pub async fn cleanup(&self, run_id: &str) -> std::io::Result<()> {
        let generated_prefix = format!("generated_{}_", run_id);
        let enhanced_prefix = format!("enhanced_{}_", run_id);

        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&generated_prefix) || name.starts_with(&enhanced_prefix) {
                tokio::fs::remove_file(entry.path()).await?;
                tracing::debug!("Removed temp file {}", name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ArtifactRef, Stage};

    async fn temp_store(tag: &str) -> ArtifactStore {
        let dir = std::env::temp_dir().join(format!("artifacts_test_{}_{}", tag, std::process::id()));
        ArtifactStore::new(dir).await.unwrap()
    }

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let store = temp_store("rw").await;
        let artifact = ArtifactRef::scene("run1", Stage::Generated, 1);

        let path = store.write(&artifact, b"png-bytes").await.unwrap();
        assert!(path.ends_with("generated_run1_scene_1.png"));
        assert_eq!(store.read(&artifact).await.unwrap(), b"png-bytes");
        assert!(store.exists_non_empty(&artifact).await);
    }

    #[tokio::test]
    async fn test_empty_content_rejected() {
        let store = temp_store("empty").await;
        let artifact = ArtifactRef::scene("run2", Stage::Generated, 1);

        let err = store.write(&artifact, b"").await.unwrap_err();
        assert!(matches!(err, PipelineError::Download(_)));
        assert!(!store.exists_non_empty(&artifact).await);
    }

    #[tokio::test]
    async fn test_cleanup_removes_intermediates_but_keeps_video() {
        let store = temp_store("cleanup").await;
        let generated = ArtifactRef::scene("run3", Stage::Generated, 1);
        let enhanced = ArtifactRef::final_frame("run3", Stage::Enhanced);
        let video = ArtifactRef::video("run3");
        let other_run = ArtifactRef::scene("run4", Stage::Generated, 1);

        store.write(&generated, b"g").await.unwrap();
        store.write(&enhanced, b"e").await.unwrap();
        store.write(&video, b"v").await.unwrap();
        store.write(&other_run, b"x").await.unwrap();

        store.cleanup("run3").await.unwrap();

        assert!(!store.exists_non_empty(&generated).await);
        assert!(!store.exists_non_empty(&enhanced).await);
        assert!(store.exists_non_empty(&video).await);
        assert!(store.exists_non_empty(&other_run).await);

        // Repeating the cleanup is harmless.
        store.cleanup("run3").await.unwrap();
    }
}
