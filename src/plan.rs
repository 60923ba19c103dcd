// src/plan.rs - Shot plan data model, planner-output parsing and fallback
//! The planner collaborator (a vision-capable language model, out of scope
//! here) returns free text in a fixed "Number of scenes / Scene N Image
//! prompt / Scene N Video prompt / Final Frame Image prompt" layout. This
//! module turns that text into an immutable `PipelinePlan`, filling any gap
//! with deterministic fallback prompts so no scene is ever left blank.

use crate::error::PipelineError;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Hard cap on scenes per run.
pub const MAX_SCENES: usize = 4;

lazy_static! {
    static ref NUM_SCENES_RE: Regex = Regex::new(r"^Number of scenes:\s*(\d+)").unwrap();
    static ref SCENE_PROMPT_RE: Regex =
        Regex::new(r"^Scene (\d+) (Image|Video) prompt:\s*(.+)$").unwrap();
    static ref FINAL_FRAME_RE: Regex = Regex::new(r"^Final Frame Image prompt:\s*(.+)$").unwrap();
}

/// Prompts for a single shot unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenePlan {
    pub image_prompt: String,
    pub video_prompt: String,
}

/// Structured multi-scene shot plan. Created once per run; immutable after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelinePlan {
    pub num_scenes: usize,
    pub scenes: Vec<ScenePlan>,
    pub final_frame_prompt: String,
}

impl PipelinePlan {
    /// Parse the planner's text output, filling missing prompts with
    /// fallbacks derived from the user's request. Scene counts are clamped
    /// into 1..=MAX_SCENES; a missing count line defaults to MAX_SCENES.
    pub fn from_planner_output(text: &str, user_query: &str) -> Self {
        let mut num_scenes = MAX_SCENES;
        let mut image_prompts: [Option<String>; MAX_SCENES] = Default::default();
        let mut video_prompts: [Option<String>; MAX_SCENES] = Default::default();
        let mut final_frame_prompt: Option<String> = None;

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(caps) = NUM_SCENES_RE.captures(line) {
                if let Ok(n) = caps[1].parse::<usize>() {
                    num_scenes = n.clamp(1, MAX_SCENES);
                    tracing::info!("Planner selected {} scenes", num_scenes);
                }
            } else if let Some(caps) = SCENE_PROMPT_RE.captures(line) {
                if let Ok(scene) = caps[1].parse::<usize>() {
                    if (1..=MAX_SCENES).contains(&scene) {
                        let prompt = caps[3].trim().to_string();
                        if !prompt.is_empty() {
                            match &caps[2] {
                                "Image" => image_prompts[scene - 1] = Some(prompt),
                                _ => video_prompts[scene - 1] = Some(prompt),
                            }
                        }
                    }
                }
            } else if let Some(caps) = FINAL_FRAME_RE.captures(line) {
                let prompt = caps[1].trim().to_string();
                if !prompt.is_empty() {
                    final_frame_prompt = Some(prompt);
                }
            }
        }

        let mut scenes = Vec::with_capacity(num_scenes);
        for scene in 1..=num_scenes {
            let image = match image_prompts[scene - 1].take() {
                Some(p) => p,
                None => {
                    tracing::warn!("Missing image prompt for scene {}, using fallback", scene);
                    fallback_image_prompt(scene, user_query)
                }
            };
            let video = match video_prompts[scene - 1].take() {
                Some(p) => p,
                None => {
                    tracing::warn!("Missing video prompt for scene {}, using fallback", scene);
                    fallback_video_prompt(scene, user_query)
                }
            };
            scenes.push(ScenePlan {
                image_prompt: image,
                video_prompt: video,
            });
        }

        let final_frame_prompt = final_frame_prompt.unwrap_or_else(|| {
            tracing::warn!("Missing final frame prompt, using fallback");
            fallback_final_frame_prompt(user_query)
        });

        Self {
            num_scenes,
            scenes,
            final_frame_prompt,
        }
    }

    /// Fully synthetic plan used when the planner call fails outright.
    pub fn fallback(user_query: &str) -> Self {
        Self::from_planner_output("", user_query)
    }
}

fn fallback_image_prompt(scene: usize, user_query: &str) -> String {
    format!(
        "A detailed realistic scene {} inspired by: {}, maintaining consistent background and style",
        scene, user_query
    )
}

fn fallback_video_prompt(scene: usize, user_query: &str) -> String {
    format!(
        "A dynamic video scene {} inspired by: {}, maintaining consistent background and style",
        scene, user_query
    )
}

fn fallback_final_frame_prompt(user_query: &str) -> String {
    format!(
        "A concluding realistic image inspired by: {}, maintaining consistent background and style",
        user_query
    )
}

/// Boundary to the external shot-plan collaborator. Implementations return
/// the raw plan text; parsing and fallback live in `PipelinePlan`.
#[async_trait]
pub trait ScenePlanner: Send + Sync {
    async fn plan(
        &self,
        user_query: &str,
        photo_data_urls: &[String],
    ) -> Result<String, PipelineError>;
}

/// Planner of last resort: yields no text, so every prompt comes from the
/// deterministic fallback.
pub struct FallbackPlanner;

#[async_trait]
impl ScenePlanner for FallbackPlanner {
    async fn plan(
        &self,
        _user_query: &str,
        _photo_data_urls: &[String],
    ) -> Result<String, PipelineError> {
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUERY: &str = "a walk on the beach";

    #[test]
    fn test_parse_complete_plan() {
        let text = "\
Number of scenes: 2
Scene 1 Image prompt: A woman at sunrise on an empty beach.
Scene 1 Video prompt: The camera tracks the woman along the shoreline.
Scene 2 Image prompt: The same woman resting on a dune at noon.
Scene 2 Video prompt: A slow pan over the dunes toward the sea.
Final Frame Image prompt: Footprints in wet sand at dusk.";

        let plan = PipelinePlan::from_planner_output(text, QUERY);
        assert_eq!(plan.num_scenes, 2);
        assert_eq!(plan.scenes.len(), 2);
        assert_eq!(
            plan.scenes[0].image_prompt,
            "A woman at sunrise on an empty beach."
        );
        assert_eq!(
            plan.scenes[1].video_prompt,
            "A slow pan over the dunes toward the sea."
        );
        assert_eq!(plan.final_frame_prompt, "Footprints in wet sand at dusk.");
    }

    #[test]
    fn test_fallback_fills_missing_prompts() {
        // Scene 2 video prompt and the final frame are missing.
        let text = "\
Number of scenes: 3
Scene 1 Image prompt: First shot.
Scene 1 Video prompt: First motion.
Scene 2 Image prompt: Second shot.
Scene 3 Image prompt: Third shot.
Scene 3 Video prompt: Third motion.";

        let plan = PipelinePlan::from_planner_output(text, QUERY);
        assert_eq!(plan.num_scenes, 3);
        for (i, scene) in plan.scenes.iter().enumerate() {
            assert!(!scene.image_prompt.is_empty(), "scene {} image empty", i + 1);
            assert!(!scene.video_prompt.is_empty(), "scene {} video empty", i + 1);
        }
        assert!(plan.scenes[1].video_prompt.contains(QUERY));
        assert!(plan.final_frame_prompt.contains(QUERY));
    }

    #[test]
    fn test_every_scene_count_yields_non_empty_prompts() {
        for n in 1..=MAX_SCENES {
            // Fewer explicit prompts than scenes: only scene 1 is given.
            let text = format!(
                "Number of scenes: {}\nScene 1 Image prompt: Opening shot.\n",
                n
            );
            let plan = PipelinePlan::from_planner_output(&text, QUERY);
            assert_eq!(plan.num_scenes, n);
            assert_eq!(plan.scenes.len(), n);
            for scene in &plan.scenes {
                assert!(!scene.image_prompt.is_empty());
                assert!(!scene.video_prompt.is_empty());
            }
            assert!(!plan.final_frame_prompt.is_empty());
        }
    }

    #[test]
    fn test_scene_count_clamped() {
        let plan = PipelinePlan::from_planner_output("Number of scenes: 9", QUERY);
        assert_eq!(plan.num_scenes, MAX_SCENES);

        let plan = PipelinePlan::from_planner_output("Number of scenes: 0", QUERY);
        assert_eq!(plan.num_scenes, 1);
    }

    #[test]
    fn test_fallback_plan_uses_scene_cap() {
        let plan = PipelinePlan::fallback(QUERY);
        assert_eq!(plan.num_scenes, MAX_SCENES);
        assert!(plan.scenes[2].image_prompt.contains("scene 3"));
    }
}
