use serde_json::{json, Value};

use crate::models::{Language, ProductAnalysis, StoryboardItem};

pub const ADVISOR_SYSTEM_INSTRUCTION: &str = "You are an expert E-Commerce Art Director and Marketing Consultant for the 'E-Commerce Detail Studio' app. \
Your job is to help users optimize their product detail pages, provide copywriting advice, suggest visual themes, \
and answer technical questions about product photography and AI generation. Keep responses concise and professional.";

pub fn analysis_prompt(description: &str) -> String {
    format!(
        "Analyze this product. Description provided: {description}. \
        Extract technical details for design planning. Be specific about materials and texture."
    )
}

pub fn analysis_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "mainColor": { "type": "STRING", "description": "Hex color code" },
            "secondaryColor": { "type": "STRING", "description": "Hex color code" },
            "backgroundColor": { "type": "STRING", "description": "Suggested hex background color" },
            "features": { "type": "ARRAY", "items": { "type": "STRING" } },
            "material": { "type": "STRING" },
            "category": { "type": "STRING" },
            "styleKeywords": { "type": "ARRAY", "items": { "type": "STRING" } }
        },
        "required": ["mainColor", "secondaryColor", "backgroundColor", "features", "material", "category", "styleKeywords"]
    })
}

pub fn plan_prompt(analysis: &ProductAnalysis, language: Language) -> String {
    let features = analysis.features.join(", ");
    format!(
        "Create an 8-image e-commerce detail storyboard. All content text MUST be in {language}.
Product Info: Category {category}, Material {material}, Features: {features}.
The 8 scenes must follow this flow:
1. Aesthetic Cover (Overall beauty)
2. Product Close-up (Technical detail/Material)
3. Feature Highlight (Functionality)
4. Usage Scene (Lifestyle setting)
5. Craftsmanship/Quality (Durability/Strict QC)
6. Size Comparison (With human hands or ruler)
7. Set/Combo (Showing items together/Organization)
8. Purchase Advice/Summary (CTA/Value proposition)

For each scene, provide:
- type: one of Cover, CloseUp, Feature, Usage, Craftsmanship, Size, Set, Advice
- title: Brief catchy title in {language}
- description: Scene context in {language}
- visualPrompt: Detailed English prompt for an image generator (Instruction: Keep the original product's shape/color/texture identical, only change the environment/props).
- overlayText: High-converting marketing copy to overlay on image in {language}.",
        language = language.name(),
        category = analysis.category,
        material = analysis.material,
    )
}

pub fn plan_schema() -> Value {
    json!({
        "type": "ARRAY",
        "items": {
            "type": "OBJECT",
            "properties": {
                "type": { "type": "STRING" },
                "title": { "type": "STRING" },
                "description": { "type": "STRING" },
                "visualPrompt": { "type": "STRING" },
                "overlayText": { "type": "STRING" }
            },
            "required": ["type", "title", "description", "visualPrompt", "overlayText"]
        }
    })
}

/// Only the visual prompt reaches the image model; overlay copy is composed by the client.
pub fn render_prompt(item: &StoryboardItem) -> String {
    format!(
        "High-end commercial studio photography.
Environment: {}.
Maintain product integrity: shape, textures, and specific color details of the central product must remain exactly as shown in the source image.
Ensure lighting on the product matches the new environment naturally.",
        item.visual_prompt.trim()
    )
}
