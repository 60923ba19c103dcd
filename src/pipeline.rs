// src/pipeline.rs - The run state machine: plan, scene-by-scene
// synthesis and enhancement, final frame, video assembly, cleanup.
use crate::artifacts::{ArtifactStore, RemoteFetcher};
use crate::error::PipelineError;
use crate::job_client::{generate, JobClient, JobRequest};
use crate::pika_client::{VideoAssembler, VideoAssemblyRequest};
use crate::plan::{PipelinePlan, ScenePlanner};
use crate::retry::{retry_stage, RetryPolicy};
use crate::types::{
    ArtifactRef, PipelineRun, PipelineState, Provider, RunStatus, SceneResult, Stage,
};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Seconds of runtime each planned scene contributes to the video.
const SCENE_DURATION_SECS: u32 = 5;

const CLEANUP_MAX_RETRIES: u32 = 2;
const CLEANUP_RETRY_DELAY_SECS: u64 = 5;

/// Appended to every scene image prompt to keep the look coherent
/// across generations.
const SCENE_STYLE_SUFFIX: &str =
    ", maintain consistent background, lighting, and style across all scenes unless explicitly requested otherwise";
const FINAL_FRAME_STYLE_SUFFIX: &str =
    ", maintain consistent background, lighting, and style with previous scenes";

const SCENE_ENHANCE_PROMPT: &str =
    "Enhance the realism of this image, preserving all background elements, non-clothing details, and textures exactly as they are, maintaining consistent style, lighting, and colors across all scenes";
const FINAL_FRAME_ENHANCE_PROMPT: &str =
    "Enhance the realism of this image, preserving all background elements, non-clothing details, and textures exactly as they are, maintaining consistent style, lighting, and colors with previous scenes";

/// The enhancer keeps more of the source image than its default would.
const ENHANCE_STRENGTH: f64 = 0.3;

pub struct PipelineOrchestrator {
    planner: Arc<dyn ScenePlanner>,
    synthesizer: Arc<dyn JobClient>,
    enhancer: Arc<dyn JobClient>,
    assembler: Arc<dyn VideoAssembler>,
    fetcher: Arc<dyn RemoteFetcher>,
    store: ArtifactStore,
    call_deadline: RetryPolicy,
}

impl PipelineOrchestrator {
    pub fn new(
        planner: Arc<dyn ScenePlanner>,
        synthesizer: Arc<dyn JobClient>,
        enhancer: Arc<dyn JobClient>,
        assembler: Arc<dyn VideoAssembler>,
        fetcher: Arc<dyn RemoteFetcher>,
        store: ArtifactStore,
    ) -> Self {
        Self {
            planner,
            synthesizer,
            enhancer,
            assembler,
            fetcher,
            store,
            call_deadline: RetryPolicy::default(),
        }
    }

    /// Run the whole pipeline for one request. Intermediate artifacts
    /// are cleaned up whether the run completes or fails; the final
    /// video is left in the artifact directory.
    pub async fn run(
        &self,
        run_id: &str,
        user_query: &str,
        photo_urls: &[String],
    ) -> Result<PipelineRun, PipelineError> {
        let plan = match self.planner.plan(user_query, photo_urls).await {
            Ok(text) => PipelinePlan::from_planner_output(&text, user_query),
            Err(e) => {
                tracing::warn!("Planner failed: {}. Using fallback prompts", e);
                PipelinePlan::fallback(user_query)
            }
        };

        let mut run = PipelineRun::new(run_id, plan);
        let result = self.execute(&mut run, photo_urls).await;

        self.cleanup_with_retry(run_id).await;

        run.completed_at = Some(Utc::now());
        match result {
            Ok(()) => {
                run.status = RunStatus::Completed;
                run.state = PipelineState::Done;
                tracing::info!("Pipeline run {} completed", run_id);
                Ok(run)
            }
            Err(e) => {
                run.status = RunStatus::Failed;
                run.state = PipelineState::Failed;
                tracing::error!("Pipeline run {} failed: {}", run_id, e);
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        run: &mut PipelineRun,
        photo_urls: &[String],
    ) -> Result<(), PipelineError> {
        let run_id = run.run_id.clone();
        let num_scenes = run.plan.num_scenes;

        // Continuity chain: the latest enhanced image URL, handed to the
        // next generation as an extra style reference. It is only ever
        // this local value, advanced or reset per scene.
        let mut continuity: Option<String> = None;

        for scene in 1..=num_scenes as u32 {
            run.state = PipelineState::Scene(scene);
            tracing::info!("Processing scene {}/{}", scene, num_scenes);

            let image_prompt = format!(
                "{}{}",
                run.plan.scenes[scene as usize - 1].image_prompt, SCENE_STYLE_SUFFIX
            );
            let (result, next) = self
                .process_frame(
                    &run_id,
                    Some(scene),
                    &image_prompt,
                    SCENE_ENHANCE_PROMPT,
                    photo_urls,
                    continuity,
                )
                .await;
            continuity = next;
            run.scene_results.push(result);
        }

        run.state = PipelineState::FinalFrame;
        tracing::info!("Processing final frame");
        let final_prompt = format!("{}{}", run.plan.final_frame_prompt, FINAL_FRAME_STYLE_SUFFIX);
        let (final_result, _) = self
            .process_frame(
                &run_id,
                None,
                &final_prompt,
                FINAL_FRAME_ENHANCE_PROMPT,
                photo_urls,
                continuity,
            )
            .await;
        run.final_frame = Some(final_result);

        run.state = PipelineState::VideoAssembly;
        let video_ref = self.assemble_video(run).await?;
        run.video_ref = Some(video_ref);
        Ok(())
    }

    /// One shot unit: synthesize (with stage retry), then a single
    /// enhancement attempt. Returns the unit's outcome and the
    /// continuity reference for the next unit. A failed unit never
    /// aborts the run.
    async fn process_frame(
        &self,
        run_id: &str,
        scene_index: Option<u32>,
        image_prompt: &str,
        enhance_prompt: &str,
        photo_urls: &[String],
        continuity: Option<String>,
    ) -> (SceneResult, Option<String>) {
        let label = match scene_index {
            Some(n) => format!("scene {}", n),
            None => "final frame".to_string(),
        };
        let mut result = match scene_index {
            Some(n) => SceneResult::scene(n),
            None => SceneResult::final_frame(),
        };

        let mut image_urls = photo_urls.to_vec();
        if let Some(previous) = &continuity {
            image_urls.push(previous.clone());
        }

        let generated_ref = frame_ref(run_id, Stage::Generated, scene_index);
        let generation = retry_stage(&format!("{} generation", label), || {
            let request = JobRequest::new(image_prompt).with_image_urls(image_urls.clone());
            let artifact = generated_ref.clone();
            async move {
                self.fetch_and_store(self.synthesizer.as_ref(), &request, &artifact)
                    .await
            }
        })
        .await;

        let generated_url = match generation {
            Ok(url) => {
                tracing::info!("{} image generated: {}", label, url);
                result.generated_ref = Some(generated_ref);
                url
            }
            Err(e) => {
                tracing::error!("Giving up on {} generation: {}. Continuing", label, e);
                // The chain keeps its previous anchor when nothing new
                // was produced.
                return (result, continuity);
            }
        };

        // Single enhancement attempt. Failure skips the frame and drops
        // the continuity anchor so the next scene starts from the
        // original photos again.
        let enhanced_ref = frame_ref(run_id, Stage::Enhanced, scene_index);
        let request = JobRequest::new(enhance_prompt)
            .with_image_urls(vec![generated_url])
            .with_override("strength", json!(ENHANCE_STRENGTH));
        match self
            .fetch_and_store(self.enhancer.as_ref(), &request, &enhanced_ref)
            .await
        {
            Ok(url) => {
                tracing::info!("{} image enhanced: {}", label, url);
                result.enhanced_ref = Some(enhanced_ref);
                result.succeeded = true;
                (result, Some(url))
            }
            Err(e) => {
                tracing::error!("Enhancement failed for {}: {}. Continuing", label, e);
                (result, None)
            }
        }
    }

    /// Drive one provider call under the deadline, then download and
    /// persist its result. Returns the remote URL.
    async fn fetch_and_store(
        &self,
        client: &dyn JobClient,
        request: &JobRequest,
        artifact: &ArtifactRef,
    ) -> Result<String, PipelineError> {
        let url = self
            .call_deadline
            .run(client.provider(), generate(client, request))
            .await?;
        let content = self.fetcher.fetch(&url).await?;
        self.store.write(artifact, &content).await?;
        Ok(url)
    }

    /// Collect the surviving enhanced frames in order, gate on the
    /// two-frame minimum, and hand them to the assembler on a blocking
    /// thread (its login flow must not stall the async scheduler).
    async fn assemble_video(&self, run: &PipelineRun) -> Result<ArtifactRef, PipelineError> {
        let mut frame_paths = Vec::new();
        let mut transition_prompts = Vec::new();

        for result in &run.scene_results {
            if let (Some(scene), Some(enhanced)) = (result.scene_index, &result.enhanced_ref) {
                if self.store.exists_non_empty(enhanced).await {
                    frame_paths.push(self.store.path_for(enhanced));
                    transition_prompts
                        .push(run.plan.scenes[scene as usize - 1].video_prompt.clone());
                } else {
                    tracing::warn!("Enhanced image for scene {} not found or empty", scene);
                }
            }
        }
        if let Some(enhanced) = run.final_frame.as_ref().and_then(|f| f.enhanced_ref.as_ref()) {
            if self.store.exists_non_empty(enhanced).await {
                frame_paths.push(self.store.path_for(enhanced));
            }
        }

        if frame_paths.len() < 2 {
            tracing::error!(
                "Only {} usable frames for run {}, need at least 2",
                frame_paths.len(),
                run.run_id
            );
            return Err(PipelineError::InsufficientFrames {
                found: frame_paths.len(),
            });
        }

        let per_transition = per_transition_duration(run.plan.num_scenes, frame_paths.len());
        let frame_durations = vec![per_transition; frame_paths.len() - 1];

        let video_ref = ArtifactRef::video(&run.run_id);
        let request = VideoAssemblyRequest {
            frame_paths,
            frame_durations,
            transition_prompts,
            output_path: self.store.path_for(&video_ref),
            loop_video: false,
        };

        let output = retry_stage("video assembly", || {
            let assembler = Arc::clone(&self.assembler);
            let request = request.clone();
            async move {
                tokio::task::spawn_blocking(move || assembler.assemble(&request))
                    .await
                    .map_err(|e| PipelineError::ProviderJob {
                        provider: Provider::Pika,
                        message: format!("assembly task failed: {}", e),
                    })?
            }
        })
        .await?;

        tracing::info!("Video assembled at {}", output.display());
        Ok(video_ref)
    }

    async fn cleanup_with_retry(&self, run_id: &str) {
        cleanup_with_retries(run_id, || self.store.cleanup(run_id)).await;
    }
}

/// Best-effort terminal cleanup. Permission errors get a couple of
/// delayed retries; everything else is logged and dropped. Never
/// escalates, so the run's outcome is unaffected.
async fn cleanup_with_retries<F, Fut>(run_id: &str, mut cleanup: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::io::Result<()>>,
{
    for attempt in 0.. {
        match cleanup().await {
            Ok(()) => return,
            Err(e)
                if e.kind() == std::io::ErrorKind::PermissionDenied
                    && attempt < CLEANUP_MAX_RETRIES =>
            {
                tracing::warn!(
                    "Cleanup for run {} denied ({}), retrying in {}s",
                    run_id,
                    e,
                    CLEANUP_RETRY_DELAY_SECS
                );
                tokio::time::sleep(Duration::from_secs(CLEANUP_RETRY_DELAY_SECS)).await;
            }
            Err(e) => {
                tracing::warn!("Cleanup for run {} failed: {}", run_id, e);
                return;
            }
        }
    }
}

fn frame_ref(run_id: &str, stage: Stage, scene_index: Option<u32>) -> ArtifactRef {
    match scene_index {
        Some(n) => ArtifactRef::scene(run_id, stage, n),
        None => ArtifactRef::final_frame(run_id, stage),
    }
}

/// Uniform seconds per transition: total runtime is five seconds per
/// planned scene, split across the surviving transitions. Integer
/// division drops any remainder from the total runtime.
pub(crate) fn per_transition_duration(num_scenes: usize, frame_count: usize) -> u32 {
    let total = num_scenes as u32 * SCENE_DURATION_SECS;
    total / (frame_count as u32 - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactStore;
    use crate::types::JobHandle;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    const QUERY: &str = "a day at the fair";

    struct StubPlanner {
        text: String,
    }

    #[async_trait]
    impl ScenePlanner for StubPlanner {
        async fn plan(&self, _q: &str, _p: &[String]) -> Result<String, PipelineError> {
            Ok(self.text.clone())
        }
    }

    /// Synchronous provider stub: each submit pops the next scripted
    /// outcome; an empty script yields numbered success URLs.
    struct StubJobClient {
        provider: Provider,
        script: Mutex<VecDeque<Result<String, String>>>,
        calls: Mutex<Vec<JobRequest>>,
    }

    impl StubJobClient {
        fn ok(provider: Provider) -> Self {
            Self::scripted(provider, vec![])
        }

        fn scripted(provider: Provider, script: Vec<Result<String, String>>) -> Self {
            Self {
                provider,
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<JobRequest> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobClient for StubJobClient {
        fn provider(&self) -> Provider {
            self.provider
        }

        fn is_sync(&self) -> bool {
            true
        }

        fn max_poll_secs(&self) -> u64 {
            600
        }

        async fn submit(&self, request: &JobRequest) -> Result<JobHandle, PipelineError> {
            let call_number = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(request.clone());
                calls.len()
            };
            let outcome = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(format!("https://{}/out-{}.png", self.provider, call_number)));
            match outcome {
                Ok(url) => Ok(JobHandle::pending("sync", self.provider).succeeded(url)),
                Err(msg) => Err(PipelineError::ProviderJob {
                    provider: self.provider,
                    message: msg,
                }),
            }
        }

        async fn poll(&self, handle: &JobHandle) -> Result<JobHandle, PipelineError> {
            Ok(handle.clone())
        }
    }

    struct StubFetcher;

    #[async_trait]
    impl RemoteFetcher for StubFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, PipelineError> {
            Ok(format!("content of {}", url).into_bytes())
        }
    }

    struct StubAssembler {
        requests: Mutex<Vec<VideoAssemblyRequest>>,
        failures_before_success: Mutex<u32>,
    }

    impl StubAssembler {
        fn new() -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                failures_before_success: Mutex::new(0),
            }
        }

        fn failing(times: u32) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                failures_before_success: Mutex::new(times),
            }
        }

        fn requests(&self) -> Vec<VideoAssemblyRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl VideoAssembler for StubAssembler {
        fn assemble(&self, request: &VideoAssemblyRequest) -> Result<PathBuf, PipelineError> {
            self.requests.lock().unwrap().push(request.clone());
            let mut failures = self.failures_before_success.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(PipelineError::ProviderJob {
                    provider: Provider::Pika,
                    message: "generation rejected".into(),
                });
            }
            std::fs::write(&request.output_path, b"mp4-bytes")?;
            Ok(request.output_path.clone())
        }
    }

    struct Harness {
        synthesizer: Arc<StubJobClient>,
        enhancer: Arc<StubJobClient>,
        assembler: Arc<StubAssembler>,
        store: ArtifactStore,
        orchestrator: PipelineOrchestrator,
    }

    async fn harness(
        tag: &str,
        plan_text: &str,
        synthesizer: StubJobClient,
        enhancer: StubJobClient,
        assembler: StubAssembler,
    ) -> Harness {
        let dir = std::env::temp_dir().join(format!("pipeline_test_{}_{}", tag, std::process::id()));
        let store = ArtifactStore::new(dir).await.unwrap();
        let synthesizer = Arc::new(synthesizer);
        let enhancer = Arc::new(enhancer);
        let assembler = Arc::new(assembler);
        let orchestrator = PipelineOrchestrator::new(
            Arc::new(StubPlanner {
                text: plan_text.to_string(),
            }),
            synthesizer.clone(),
            enhancer.clone(),
            assembler.clone(),
            Arc::new(StubFetcher),
            store.clone(),
        );
        Harness {
            synthesizer,
            enhancer,
            assembler,
            store,
            orchestrator,
        }
    }

    const TWO_SCENE_PLAN: &str = "\
Number of scenes: 2
Scene 1 Image prompt: Opening shot.
Scene 1 Video prompt: Opening motion.
Scene 2 Image prompt: Second shot.
Scene 2 Video prompt: Second motion.
Final Frame Image prompt: Closing shot.";

    #[test]
    fn test_per_transition_duration_table() {
        // 4 scenes, 5 frames: 20s over 4 transitions.
        assert_eq!(per_transition_duration(4, 5), 5);
        // 3 scenes, 4 frames: 15s over 3 transitions.
        assert_eq!(per_transition_duration(3, 4), 5);
        // 4 scenes, 3 frames: 20s over 2 transitions.
        assert_eq!(per_transition_duration(4, 3), 10);
        // 3 scenes, 3 frames: 15/2 truncates to 7.
        assert_eq!(per_transition_duration(3, 3), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_builds_continuity_chain() {
        let h = harness(
            "happy",
            TWO_SCENE_PLAN,
            StubJobClient::ok(Provider::GptImage),
            StubJobClient::ok(Provider::Flux),
            StubAssembler::new(),
        )
        .await;
        let photos = vec!["https://u/photo1.jpg".to_string()];

        let run = h.orchestrator.run("r1", QUERY, &photos).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.state, PipelineState::Done);
        assert!(run.video_ref.is_some());
        assert!(run.scene_results.iter().all(|s| s.succeeded));

        // Each generation sees the user photos; later ones also get the
        // previous enhanced URL as the last reference.
        let gen_calls = h.synthesizer.calls();
        assert_eq!(gen_calls.len(), 3);
        assert_eq!(gen_calls[0].image_urls, photos);
        assert!(gen_calls[0].prompt.starts_with("Opening shot."));
        assert!(gen_calls[0].prompt.ends_with(SCENE_STYLE_SUFFIX));
        assert_eq!(gen_calls[1].image_urls.len(), 2);
        assert_eq!(gen_calls[1].image_urls[1], "https://flux/out-1.png");
        assert_eq!(gen_calls[2].image_urls[1], "https://flux/out-2.png");
        assert!(gen_calls[2].prompt.ends_with(FINAL_FRAME_STYLE_SUFFIX));

        // Enhancement works on the freshly generated image with reduced
        // strength.
        let enhance_calls = h.enhancer.calls();
        assert_eq!(enhance_calls.len(), 3);
        assert_eq!(enhance_calls[0].image_urls, vec!["https://gpt-image-1/out-1.png"]);
        assert_eq!(enhance_calls[0].overrides["strength"], json!(0.3));

        // Assembly gets both scene frames plus the final frame, with a
        // prompt per transition and 10s split over 2 transitions.
        let requests = h.assembler.requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.frame_paths.len(), 3);
        assert!(request.frame_paths[0].ends_with("enhanced_r1_scene_1.png"));
        assert!(request.frame_paths[2].ends_with("enhanced_r1_final_frame.png"));
        assert_eq!(request.frame_durations, vec![5, 5]);
        assert_eq!(
            request.transition_prompts,
            vec!["Opening motion.", "Second motion."]
        );

        // Intermediates are gone, the video stays.
        assert!(!h.store.exists_non_empty(&ArtifactRef::scene("r1", Stage::Enhanced, 1)).await);
        assert!(h.store.exists_non_empty(&ArtifactRef::video("r1")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_scene_generation_skips_scene_only() {
        // Scene 2 generation fails all three attempts; the run carries
        // on through the final frame.
        let synthesizer = StubJobClient::scripted(
            Provider::GptImage,
            vec![
                Ok("https://g/s1.png".into()),
                Err("NSFW content rejected".into()),
                Err("NSFW content rejected".into()),
                Err("NSFW content rejected".into()),
            ],
        );
        let h = harness(
            "skip",
            TWO_SCENE_PLAN,
            synthesizer,
            StubJobClient::ok(Provider::Flux),
            StubAssembler::new(),
        )
        .await;

        let run = h.orchestrator.run("r2", QUERY, &[]).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.scene_results[0].succeeded);
        assert!(!run.scene_results[1].succeeded);
        assert!(run.scene_results[1].generated_ref.is_none());

        // 1 for scene 1, 3 failed attempts for scene 2, 1 final frame.
        assert_eq!(h.synthesizer.calls().len(), 5);

        // Scene 1 frame plus final frame survive: 10s over 1 transition
        // and only scene 1's prompt.
        let request = &h.assembler.requests()[0];
        assert_eq!(request.frame_paths.len(), 2);
        assert_eq!(request.frame_durations, vec![10]);
        assert_eq!(request.transition_prompts, vec!["Opening motion."]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enhancement_failure_resets_continuity() {
        // Scene 2's enhancement fails; the final frame must fall back
        // to the original photos only.
        let enhancer = StubJobClient::scripted(
            Provider::Flux,
            vec![
                Ok("https://f/s1.png".into()),
                Err("enhancement rejected".into()),
            ],
        );
        let h = harness(
            "reset",
            TWO_SCENE_PLAN,
            StubJobClient::ok(Provider::GptImage),
            enhancer,
            StubAssembler::new(),
        )
        .await;
        let photos = vec!["https://u/photo1.jpg".to_string()];

        let run = h.orchestrator.run("r3", QUERY, &photos).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);

        let gen_calls = h.synthesizer.calls();
        // Scene 2 still chains from scene 1's enhanced frame.
        assert_eq!(gen_calls[1].image_urls[1], "https://f/s1.png");
        // After the failed enhancement the final frame sees photos only.
        assert_eq!(gen_calls[2].image_urls, photos);

        // Enhancement is never retried: one call per generated frame.
        assert_eq!(h.enhancer.calls().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_insufficient_frames_never_invokes_assembler() {
        let one_scene = "\
Number of scenes: 1
Scene 1 Image prompt: Only shot.
Scene 1 Video prompt: Only motion.
Final Frame Image prompt: Closing shot.";
        // The final frame's enhancement fails, leaving one usable frame.
        let enhancer = StubJobClient::scripted(
            Provider::Flux,
            vec![Ok("https://f/s1.png".into()), Err("rejected".into())],
        );
        let h = harness(
            "short",
            one_scene,
            StubJobClient::ok(Provider::GptImage),
            enhancer,
            StubAssembler::new(),
        )
        .await;

        let err = h.orchestrator.run("r4", QUERY, &[]).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InsufficientFrames { found: 1 }
        ));
        assert!(h.assembler.requests().is_empty());

        // Generated intermediates were written, then cleaned up.
        assert!(!h
            .store
            .exists_non_empty(&ArtifactRef::scene("r4", Stage::Generated, 1))
            .await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_assembly_retries_then_succeeds() {
        let h = harness(
            "retry",
            TWO_SCENE_PLAN,
            StubJobClient::ok(Provider::GptImage),
            StubJobClient::ok(Provider::Flux),
            StubAssembler::failing(2),
        )
        .await;

        let run = h.orchestrator.run("r5", QUERY, &[]).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(h.assembler.requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_retries_permission_denials_with_fixed_delay() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let started = tokio::time::Instant::now();

        cleanup_with_retries("r-perm", || {
            let calls = calls_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(std::io::Error::new(
                        std::io::ErrorKind::PermissionDenied,
                        "denied",
                    ))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two fixed 5s delays between the three attempts.
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_gives_up_without_escalating() {
        // Persistent denial: initial attempt plus two retries, then done.
        let denials = Arc::new(AtomicU32::new(0));
        let denials_clone = denials.clone();
        cleanup_with_retries("r-denied", || {
            let calls = denials_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "denied",
                ))
            }
        })
        .await;
        assert_eq!(denials.load(Ordering::SeqCst), 1 + CLEANUP_MAX_RETRIES);

        // Any other error kind is logged once and never retried.
        let others = Arc::new(AtomicU32::new(0));
        let others_clone = others.clone();
        cleanup_with_retries("r-other", || {
            let calls = others_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))
            }
        })
        .await;
        assert_eq!(others.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_assembly_exhaustion_fails_run_after_cleanup() {
        let h = harness(
            "fail",
            TWO_SCENE_PLAN,
            StubJobClient::ok(Provider::GptImage),
            StubJobClient::ok(Provider::Flux),
            StubAssembler::failing(5),
        )
        .await;

        let err = h.orchestrator.run("r6", QUERY, &[]).await.unwrap_err();
        assert!(matches!(err, PipelineError::ProviderJob { .. }));
        assert_eq!(h.assembler.requests().len(), 3);
        assert!(!h
            .store
            .exists_non_empty(&ArtifactRef::scene("r6", Stage::Enhanced, 1))
            .await);
    }
}
