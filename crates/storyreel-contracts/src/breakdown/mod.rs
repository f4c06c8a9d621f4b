use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::recovery::parse_with_repair;

/// What the text model is asked to return for a pasted script: the cast
/// and a scene-by-scene outline. Every optional field defaults so a
/// partial response still deserializes; `from_model_text` is the schema's
/// only entry point for raw model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ScriptBreakdown {
    pub title: Option<String>,
    pub logline: Option<String>,
    #[serde(default)]
    pub characters: Vec<CharacterProfile>,
    #[serde(default)]
    pub scenes: Vec<SceneOutline>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterProfile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub portrait_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneOutline {
    pub heading: Option<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub characters: Vec<String>,
    pub image_prompt: Option<String>,
    pub narration: Option<String>,
    pub duration_seconds: Option<f64>,
}

impl ScriptBreakdown {
    /// Recover structured data from raw model output and decode it into
    /// the breakdown schema. Repair failures and schema mismatches both
    /// surface as errors; there is no partial extraction.
    pub fn from_model_text(raw: &str) -> anyhow::Result<Self> {
        let value = parse_with_repair(raw)?;
        let breakdown = serde_json::from_value(value)
            .context("model output parsed but did not match the breakdown schema")?;
        Ok(breakdown)
    }
}
