//! Prompt engineering applied by adapters before the provider call.

use crate::provider::{ColorMode, GenerationOptions, SafetyLevel};

const MONOCHROME_SUFFIX: &str = "black and white ink illustration, monochrome, grayscale shading, \
     no color, high contrast line art";
const COLOR_SUFFIX: &str = "full color illustration, rich palette, detailed lighting";
const STRICT_SAFETY_SUFFIX: &str = "family friendly, no gore, no nudity";

/// Compose the final provider prompt from the scene prompt and options.
pub fn compose(prompt: &str, options: &GenerationOptions) -> String {
    let mut parts = vec![prompt.trim().trim_end_matches('.').to_string()];

    if let Some(style) = options
        .style_template
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        parts.push(format!("{} style", style));
    }

    parts.push(
        match options.color_mode {
            ColorMode::Monochrome => MONOCHROME_SUFFIX,
            ColorMode::Color => COLOR_SUFFIX,
        }
        .to_string(),
    );

    if options.safety_level == SafetyLevel::Strict {
        parts.push(STRICT_SAFETY_SUFFIX.to_string());
    }

    parts.join(", ")
}
