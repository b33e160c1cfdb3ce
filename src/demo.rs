//! Offline stand-in for the remote service, selected when no API key is configured.

use async_trait::async_trait;
use base64::Engine;
use tracing::info;

use crate::models::{
    ChatTurn, EncodedImage, GeneratedImage, Language, ProductAnalysis, SceneRole, StoryboardDraft, StoryboardItem,
};
use crate::service::{GenerationService, ServiceError};

#[derive(Debug, Default, Clone, Copy)]
pub struct DemoService;

impl DemoService {
    fn scene_brief(role: SceneRole) -> (&'static str, &'static str, &'static str) {
        match role {
            SceneRole::Cover => ("Aesthetic cover", "The product on a clean, softly lit set", "Designed to be noticed"),
            SceneRole::CloseUp => ("Close-up", "Macro view of surface and material", "Every detail, considered"),
            SceneRole::Feature => ("Feature highlight", "The key function shown in action", "Made to work harder"),
            SceneRole::Usage => ("In daily life", "The product in a lived-in lifestyle setting", "Fits the way you live"),
            SceneRole::Craftsmanship => ("Craftsmanship", "Build quality and finishing under inspection", "Quality you can feel"),
            SceneRole::Size => ("Size reference", "Scale shown against hands and a ruler", "Just the right size"),
            SceneRole::Set => ("The full set", "Items arranged together as a collection", "Better together"),
            SceneRole::Advice => ("Why choose it", "Summary of value with a clear call to action", "Order yours today"),
        }
    }

    fn colour(role: SceneRole) -> &'static str {
        match role {
            SceneRole::Cover => "#3B82F6",
            SceneRole::CloseUp => "#EF4444",
            SceneRole::Feature => "#10B981",
            SceneRole::Usage => "#F59E0B",
            SceneRole::Craftsmanship => "#8B5CF6",
            SceneRole::Size => "#0EA5E9",
            SceneRole::Set => "#EC4899",
            SceneRole::Advice => "#64748B",
        }
    }

    fn placeholder_svg(item: &StoryboardItem) -> String {
        let colour = Self::colour(item.role);
        format!(
            r#"<svg width="600" height="800" xmlns="http://www.w3.org/2000/svg">
            <defs>
                <linearGradient id="grad" x1="0%" y1="0%" x2="100%" y2="100%">
                    <stop offset="0%" style="stop-color:{colour};stop-opacity:1" />
                    <stop offset="100%" style="stop-color:{colour};stop-opacity:0.6" />
                </linearGradient>
            </defs>
            <rect width="600" height="800" fill="url(#grad)" />
            <text x="300" y="380" font-family="Arial, sans-serif" font-size="32" font-weight="bold"
                  text-anchor="middle" fill="white">{title}</text>
            <text x="300" y="430" font-family="Arial, sans-serif" font-size="18"
                  text-anchor="middle" fill="white" opacity="0.8">{overlay}</text>
        </svg>"#,
            title = xml_escape(&format!("{} · {}", item.id, item.role.label())),
            overlay = xml_escape(&item.overlay_text),
        )
    }
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[async_trait]
impl GenerationService for DemoService {
    async fn analyze(&self, image: &EncodedImage, description: &str) -> Result<ProductAnalysis, ServiceError> {
        info!("Using demo mode - canned analysis for {} byte image", image.data.len());
        let category = description.trim();
        Ok(ProductAnalysis {
            main_color: "#FFFFFF".into(),
            secondary_color: "#D6D3D1".into(),
            background_color: "#F5F0E8".into(),
            features: vec!["clean silhouette".into(), "durable finish".into(), "easy care".into()],
            material: "ceramic".into(),
            category: if category.is_empty() { "product".into() } else { category.to_string() },
            style_keywords: vec!["minimalist".into(), "natural light".into()],
        })
    }

    async fn plan(&self, analysis: &ProductAnalysis, language: Language) -> Result<Vec<StoryboardDraft>, ServiceError> {
        info!("Using demo mode - canned storyboard in {}", language);
        Ok(SceneRole::ALL
            .into_iter()
            .map(|role| {
                let (title, description, overlay) = Self::scene_brief(role);
                StoryboardDraft {
                    role,
                    title: format!("{} ({})", title, language.native_name()),
                    description: format!("{} for the {}.", description, analysis.category),
                    visual_prompt: format!(
                        "{} of a {} {}, background {}; keep the product's shape, colour and texture identical",
                        description, analysis.material, analysis.category, analysis.background_color
                    ),
                    overlay_text: overlay.to_string(),
                }
            })
            .collect())
    }

    async fn render(&self, _image: &EncodedImage, item: &StoryboardItem) -> Result<GeneratedImage, ServiceError> {
        let svg = Self::placeholder_svg(item);
        info!("📦 Generated placeholder image for scene {}", item.id);
        Ok(GeneratedImage {
            mime_type: "image/svg+xml".into(),
            data: base64::engine::general_purpose::STANDARD.encode(svg.as_bytes()),
        })
    }

    async fn converse(&self, history: &[ChatTurn], message: &str) -> Result<String, ServiceError> {
        Ok(format!(
            "Demo advisor (turn {}): for \"{}\", lead with one clear benefit per scene and keep overlay copy under eight words.",
            history.len() / 2 + 1,
            message.trim()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> EncodedImage {
        EncodedImage::new("image/png", vec![1u8, 2, 3]).unwrap()
    }

    #[tokio::test]
    async fn plans_eight_scenes_in_role_order() {
        let svc = DemoService;
        let analysis = svc.analyze(&image(), "minimalist ceramic dish").await.unwrap();
        assert_eq!(analysis.category, "minimalist ceramic dish");

        let drafts = svc.plan(&analysis, Language::Korean).await.unwrap();
        assert_eq!(drafts.len(), 8);
        assert!(drafts.iter().zip(SceneRole::ALL).all(|(d, r)| d.role == r));
        assert!(drafts[0].title.contains("한국어"));
    }

    #[tokio::test]
    async fn renders_escaped_svg_placeholder() {
        let svc = DemoService;
        let item = StoryboardItem::from_draft(
            2,
            StoryboardDraft {
                role: SceneRole::CloseUp,
                title: "t".into(),
                description: "d".into(),
                visual_prompt: "v".into(),
                overlay_text: "Glaze <&> grain".into(),
            },
        );
        let generated = svc.render(&image(), &item).await.unwrap();
        assert_eq!(generated.mime_type, "image/svg+xml");
        assert!(generated.data.starts_with("PHN2Zy"));

        let svg = String::from_utf8(base64::engine::general_purpose::STANDARD.decode(&generated.data).unwrap()).unwrap();
        assert!(svg.contains("Glaze &lt;&amp;&gt; grain"));
        assert!(svg.contains("#EF4444"));
    }
}
