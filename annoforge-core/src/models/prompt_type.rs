//! Annotation styles understood by the inference engine

use serde::{Deserialize, Serialize};

/// A named annotation style
///
/// Immutable once the registry is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptType {
    /// Stable identifier (`caption`, `style_tags`, ...)
    pub id: String,

    /// Human-readable label
    pub label: String,

    /// Task template passed to the inference engine
    pub template: String,

    /// Maximum number of comma-separated tags kept from the output
    pub tag_limit: Option<usize>,
}

impl PromptType {
    pub fn new(id: &str, label: &str, template: &str) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            template: template.to_string(),
            tag_limit: None,
        }
    }

    pub fn with_tag_limit(mut self, limit: usize) -> Self {
        self.tag_limit = Some(limit);
        self
    }

    /// Clean raw inference output for storage
    ///
    /// Trims surrounding whitespace; for tag styles, re-joins the first
    /// `tag_limit` non-empty tags with `", "`.
    pub fn normalize_output(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        match self.tag_limit {
            Some(limit) => trimmed
                .split(',')
                .map(str::trim)
                .filter(|tag| !tag.is_empty())
                .take(limit)
                .collect::<Vec<_>>()
                .join(", "),
            None => trimmed.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_output_is_trimmed() {
        let prompt = PromptType::new("caption", "Caption", "<CAPTION>");
        assert_eq!(prompt.normalize_output("  a red car \n"), "a red car");
    }

    #[test]
    fn test_tag_output_is_limited() {
        let prompt = PromptType::new("style_tags", "Tags (Style)", "<GENERATE_TAGS_STYLE>")
            .with_tag_limit(3);
        assert_eq!(
            prompt.normalize_output("anime,  watercolor ,, sketch, noir"),
            "anime, watercolor, sketch"
        );
    }
}
