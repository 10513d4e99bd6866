//! Prompt Type Registry
//!
//! Fixed set of annotation styles, built once and never mutated. The built-in
//! registry is a process-wide value; [`PromptRegistry::from_types`] builds a
//! custom one (tests, alternative engines).

use crate::error::{CoreError, CoreResult};
use crate::models::PromptType;
use once_cell::sync::Lazy;
use std::sync::Arc;

/// Tags kept from tag-style outputs
pub const DEFAULT_TAG_LIMIT: usize = 30;

static BUILTIN: Lazy<Arc<PromptRegistry>> = Lazy::new(|| {
    Arc::new(PromptRegistry::from_types(vec![
        PromptType::new("caption", "Caption", "<CAPTION>"),
        PromptType::new("detailed_description", "Detailed Caption", "<DETAILED_CAPTION>"),
        PromptType::new("more_detailed_description", "More Detailed", "<MORE_DETAILED_CAPTION>"),
        PromptType::new("general_tags", "Tags (General)", "<GENERATE_TAGS>")
            .with_tag_limit(DEFAULT_TAG_LIMIT),
        PromptType::new("object_tags", "Tags (Objects)", "<GENERATE_TAGS_OBJECT>")
            .with_tag_limit(DEFAULT_TAG_LIMIT),
        PromptType::new("style_tags", "Tags (Style)", "<GENERATE_TAGS_STYLE>")
            .with_tag_limit(DEFAULT_TAG_LIMIT),
        PromptType::new("composition_tags", "Tags (Composition)", "<GENERATE_TAGS_COMPOSITION>")
            .with_tag_limit(DEFAULT_TAG_LIMIT),
        PromptType::new("sd_prompt", "Prompt (SD)", "<GENERATE_PROMPT>"),
        PromptType::new("sd_prompt_v2", "Prompt (V2)", "<GENERATE_PROMPT_V2>"),
    ]))
});

/// Immutable set of prompt types
#[derive(Debug)]
pub struct PromptRegistry {
    types: Vec<Arc<PromptType>>,
}

impl PromptRegistry {
    /// The built-in registry shared by the whole process
    pub fn builtin() -> Arc<PromptRegistry> {
        Arc::clone(&BUILTIN)
    }

    /// Build a registry from an explicit list; later duplicates of an id are dropped
    pub fn from_types(types: Vec<PromptType>) -> Self {
        let mut unique: Vec<Arc<PromptType>> = Vec::with_capacity(types.len());
        for prompt in types {
            if unique.iter().any(|p| p.id == prompt.id) {
                tracing::warn!(prompt_type = %prompt.id, "Duplicate prompt type ignored");
                continue;
            }
            unique.push(Arc::new(prompt));
        }
        Self { types: unique }
    }

    /// Look up by identifier, or case-insensitively by label
    pub fn resolve(&self, name: &str) -> CoreResult<Arc<PromptType>> {
        let name = name.trim();
        self.types
            .iter()
            .find(|p| p.id == name)
            .or_else(|| self.types.iter().find(|p| p.label.eq_ignore_ascii_case(name)))
            .cloned()
            .ok_or_else(|| CoreError::InvalidPromptType(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_ok()
    }

    /// All prompt types in registration order
    pub fn all(&self) -> &[Arc<PromptType>] {
        &self.types
    }

    pub fn ids(&self) -> Vec<&str> {
        self.types.iter().map(|p| p.id.as_str()).collect()
    }
}
