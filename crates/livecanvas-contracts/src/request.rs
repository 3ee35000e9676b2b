use serde::{Deserialize, Deserializer, Serialize};

pub const DEFAULT_PROMPT: &str = "a captain with white beard, teal hat and uniform";
pub const DEFAULT_NEGATIVE_PROMPT: &str = "nsfw, nude";
pub const DEFAULT_SEED: i64 = 1;
pub const DEFAULT_STEPS: u32 = 20;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.0;
pub const DEFAULT_DIMENSION: u32 = 1024;
pub const MAX_DIMENSION: u32 = 8192;

/// Full parameter set driving one render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub seed: i64,
    pub steps: u32,
    pub guidance_scale: f64,
    pub height: u32,
    pub width: u32,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
            seed: DEFAULT_SEED,
            steps: DEFAULT_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            height: DEFAULT_DIMENSION,
            width: DEFAULT_DIMENSION,
        }
    }
}

impl GenerationRequest {
    /// Whitespace-only prompts never reach the synthesis engine.
    pub fn has_prompt(&self) -> bool {
        !self.prompt.trim().is_empty()
    }

    /// Exact field-wise comparison. `guidance_scale` is compared by value with
    /// no epsilon, so `7` and `7.0` are equal while `7.0000001` is not.
    pub fn differs_from(&self, other: &GenerationRequest) -> bool {
        self != other
    }
}

/// Partial update decoded from one controller line. Absent fields leave the
/// tracked request untouched; an explicit `"prompt": null` clears the prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterUpdate {
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Option::is_none"
    )]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
}

impl ParameterUpdate {
    pub fn is_empty(&self) -> bool {
        self == &ParameterUpdate::default()
    }

    pub fn apply_to(&self, request: &mut GenerationRequest) {
        if let Some(prompt) = &self.prompt {
            request.prompt.clone_from(prompt);
        }
        if let Some(negative_prompt) = &self.negative_prompt {
            request.negative_prompt.clone_from(negative_prompt);
        }
        if let Some(seed) = self.seed {
            request.seed = seed;
        }
        if let Some(steps) = self.steps {
            request.steps = steps;
        }
        if let Some(guidance_scale) = self.guidance_scale {
            request.guidance_scale = guidance_scale;
        }
        if let Some(height) = self.height {
            request.height = height;
        }
        if let Some(width) = self.width {
            request.width = width;
        }
    }

    /// Returns the first range violation, if any.
    pub fn validate(&self) -> Result<(), String> {
        if self.steps == Some(0) {
            return Err("steps must be a positive integer".to_string());
        }
        if let Some(guidance_scale) = self.guidance_scale {
            if !guidance_scale.is_finite() || guidance_scale < 0.0 {
                return Err(format!(
                    "guidance_scale must be a finite non-negative number (got {guidance_scale})"
                ));
            }
        }
        for (field, value) in [("height", self.height), ("width", self.width)] {
            match value {
                Some(0) => return Err(format!("{field} must be a positive integer")),
                Some(value) if value > MAX_DIMENSION => {
                    return Err(format!("{field} must be at most {MAX_DIMENSION} (got {value})"))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Some(Option::<String>::deserialize(deserializer)?.unwrap_or_default()))
}
