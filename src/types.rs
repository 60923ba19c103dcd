// src/types.rs - Common data structures for the generation pipeline
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Remote generation provider identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// gpt-image-1 still image synthesis (gen-api.ru)
    GptImage,
    /// Flux realism enhancement (gen-api.ru)
    Flux,
    /// Kling video-element generation (gen-api.ru)
    Kling,
    /// Pika frame-interpolation video assembly
    Pika,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::GptImage => "gpt-image-1",
            Provider::Flux => "flux",
            Provider::Kling => "kling",
            Provider::Pika => "pika",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal-once job state. A handle moves Pending -> {Succeeded | Failed |
/// TimedOut} exactly once; the owning poll loop is the only mutator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending)
    }
}

/// Handle for one remote job, created on submit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
    pub provider: Provider,
    pub status: JobStatus,
    /// Present iff status is Succeeded.
    pub result_ref: Option<String>,
    /// Present iff status is Failed or TimedOut.
    pub error_message: Option<String>,
}

impl JobHandle {
    pub fn pending(id: impl Into<String>, provider: Provider) -> Self {
        Self {
            id: id.into(),
            provider,
            status: JobStatus::Pending,
            result_ref: None,
            error_message: None,
        }
    }

    /// Terminal transition for a job that completed inline or on poll.
    pub fn succeeded(mut self, result_ref: impl Into<String>) -> Self {
        self.status = JobStatus::Succeeded;
        self.result_ref = Some(result_ref.into());
        self
    }

    pub fn failed(mut self, message: impl Into<String>) -> Self {
        self.status = JobStatus::Failed;
        self.error_message = Some(message.into());
        self
    }
}

/// Pipeline stage an artifact belongs to.
///
/// The final frame is addressed through `scene_index: None` on `ArtifactRef`
/// rather than a stage of its own, because it produces both a generated and
/// an enhanced file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Generated,
    Enhanced,
    Video,
}

impl Stage {
    pub fn prefix(&self) -> &'static str {
        match self {
            Stage::Generated => "generated",
            Stage::Enhanced => "enhanced",
            Stage::Video => "final_video",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Stage::Generated | Stage::Enhanced => "png",
            Stage::Video => "mp4",
        }
    }
}

/// Reference to one on-disk intermediate artifact, owned by the
/// `ArtifactStore`. External components only ever see read-only paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub run_id: String,
    pub stage: Stage,
    /// `Some(n)` for scene `n` (1-based), `None` for the final frame.
    pub scene_index: Option<u32>,
}

impl ArtifactRef {
    pub fn scene(run_id: impl Into<String>, stage: Stage, scene: u32) -> Self {
        Self {
            run_id: run_id.into(),
            stage,
            scene_index: Some(scene),
        }
    }

    pub fn final_frame(run_id: impl Into<String>, stage: Stage) -> Self {
        Self {
            run_id: run_id.into(),
            stage,
            scene_index: None,
        }
    }

    pub fn video(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            stage: Stage::Video,
            scene_index: None,
        }
    }

    /// Deterministic file name: `{stage}_{run}_{scene|final_frame}.{ext}`.
    pub fn file_name(&self) -> String {
        match (self.stage, self.scene_index) {
            (Stage::Video, _) => format!("final_video_{}.mp4", self.run_id),
            (stage, Some(scene)) => format!(
                "{}_{}_scene_{}.{}",
                stage.prefix(),
                self.run_id,
                scene,
                stage.extension()
            ),
            (stage, None) => format!(
                "{}_{}_final_frame.{}",
                stage.prefix(),
                self.run_id,
                stage.extension()
            ),
        }
    }
}

/// Outcome of one scene (or the final frame, with `scene_index: None`).
/// A scene with no enhanced frame contributes nothing to the video but never
/// aborts the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneResult {
    pub scene_index: Option<u32>,
    pub generated_ref: Option<ArtifactRef>,
    pub enhanced_ref: Option<ArtifactRef>,
    pub succeeded: bool,
}

impl SceneResult {
    pub fn scene(scene_index: u32) -> Self {
        Self {
            scene_index: Some(scene_index),
            generated_ref: None,
            enhanced_ref: None,
            succeeded: false,
        }
    }

    pub fn final_frame() -> Self {
        Self {
            scene_index: None,
            generated_ref: None,
            enhanced_ref: None,
            succeeded: false,
        }
    }
}

/// State of the orchestrator's run state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Planning,
    Scene(u32),
    FinalFrame,
    VideoAssembly,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

/// One end-to-end pipeline execution. Not persisted beyond process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub plan: crate::plan::PipelinePlan,
    pub scene_results: Vec<SceneResult>,
    pub final_frame: Option<SceneResult>,
    pub video_ref: Option<ArtifactRef>,
    pub status: RunStatus,
    pub state: PipelineState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(run_id: impl Into<String>, plan: crate::plan::PipelinePlan) -> Self {
        Self {
            run_id: run_id.into(),
            plan,
            scene_results: Vec::new(),
            final_frame: None,
            video_ref: None,
            status: RunStatus::Running,
            state: PipelineState::Planning,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_file_names() {
        let generated = ArtifactRef::scene("1234", Stage::Generated, 2);
        assert_eq!(generated.file_name(), "generated_1234_scene_2.png");

        let enhanced_final = ArtifactRef::final_frame("1234", Stage::Enhanced);
        assert_eq!(enhanced_final.file_name(), "enhanced_1234_final_frame.png");

        let video = ArtifactRef::video("1234");
        assert_eq!(video.file_name(), "final_video_1234.mp4");
    }

    #[test]
    fn test_job_handle_terminal_transition() {
        let handle = JobHandle::pending("abc", Provider::Flux);
        assert_eq!(handle.status, JobStatus::Pending);
        assert!(!handle.status.is_terminal());

        let done = handle.succeeded("https://example.com/out.png");
        assert!(done.status.is_terminal());
        assert_eq!(done.result_ref.as_deref(), Some("https://example.com/out.png"));
        assert!(done.error_message.is_none());
    }
}
