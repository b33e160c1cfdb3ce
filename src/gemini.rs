use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::models::{
    ChatRole, ChatTurn, EncodedImage, GeneratedImage, Language, ProductAnalysis, SceneRole, StoryboardDraft,
    StoryboardItem,
};
use crate::prompts;
use crate::service::{GenerationService, ServiceError, STORYBOARD_LEN};

// Helper function to truncate base64 data in JSON for cleaner logging
fn truncate_base64_in_json(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                if key == "data" {
                    if let Value::String(s) = val {
                        if s.len() > 100 && s.chars().all(is_base64_char) {
                            *val = Value::String(format!("{}...[truncated {} chars]", &s[..50], s.len() - 50));
                        }
                    }
                } else {
                    truncate_base64_in_json(val);
                }
            }
        }
        Value::Array(arr) => {
            for val in arr.iter_mut() {
                truncate_base64_in_json(val);
            }
        }
        _ => {}
    }
}

fn is_base64_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '='
}

fn preview(data: &str) -> String {
    match data.char_indices().nth(50) {
        Some((cut, _)) => format!("{}...[{} chars total]", &data[..cut], data.chars().count()),
        None => data.to_string(),
    }
}

pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    analysis_model: String,
    render_model: String,
    advisor_model: String,
    aspect_ratio: String,
}

impl GeminiClient {
    pub fn new(api_key: String, config: &Config) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| ServiceError::Http(e.to_string()))?;
        Ok(Self {
            client,
            api_key,
            base_url: config.api_base.clone(),
            analysis_model: config.analysis_model.clone(),
            render_model: config.render_model.clone(),
            advisor_model: config.advisor_model.clone(),
            aspect_ratio: config.render_aspect_ratio.clone(),
        })
    }

    async fn generate_content(&self, model: &str, request_body: Value) -> Result<GeminiResponse, ServiceError> {
        let url = format!("{}/models/{}:generateContent?key={}", self.base_url, model, self.api_key);

        info!("🔗 Making request to: {}", url.replace(&self.api_key, "***"));

        let mut logged_body = request_body.clone();
        truncate_base64_in_json(&mut logged_body);
        info!("📤 Request body: {}", serde_json::to_string_pretty(&logged_body).unwrap_or_default());

        let response = self
            .client
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| ServiceError::Http(e.to_string()))?;

        let status = response.status();
        info!("📥 Response status: {}", status);

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            error!("❌ API Error response: {}", error_body);
            return Err(ServiceError::Api { status: status.as_u16(), body: error_body });
        }

        let response_text = response.text().await.map_err(|e| ServiceError::Http(e.to_string()))?;

        // Truncate base64 image data for cleaner logging
        let truncated_response = match serde_json::from_str::<Value>(&response_text) {
            Ok(mut json_value) => {
                truncate_base64_in_json(&mut json_value);
                serde_json::to_string(&json_value).unwrap_or_default()
            }
            Err(_) => response_text.chars().take(1000).collect(),
        };
        info!("📥 Raw Gemini API response: {}", truncated_response);

        serde_json::from_str(&response_text).map_err(|e| ServiceError::Malformed(format!("response envelope: {}", e)))
    }

    fn image_part(image: &EncodedImage) -> Value {
        json!({ "inlineData": { "mimeType": image.mime_type, "data": image.to_base64() } })
    }
}

#[async_trait]
impl GenerationService for GeminiClient {
    async fn analyze(&self, image: &EncodedImage, description: &str) -> Result<ProductAnalysis, ServiceError> {
        info!("🔍 Analyzing product image ({}, {} bytes)", image.mime_type, image.data.len());
        let body = json!({
            "contents": [{
                "parts": [
                    Self::image_part(image),
                    { "text": prompts::analysis_prompt(description) }
                ]
            }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": prompts::analysis_schema()
            }
        });
        let response = self.generate_content(&self.analysis_model, body).await?;
        let text = extract_text(&response).ok_or(ServiceError::Empty("analysis text"))?;
        let analysis: ProductAnalysis =
            serde_json::from_str(&text).map_err(|e| ServiceError::Malformed(format!("analysis: {}", e)))?;
        info!("✅ Analysis ready: category={} material={}", analysis.category, analysis.material);
        Ok(analysis)
    }

    async fn plan(&self, analysis: &ProductAnalysis, language: Language) -> Result<Vec<StoryboardDraft>, ServiceError> {
        info!("🗂️ Planning storyboard in {}", language);
        let body = json!({
            "contents": [{ "parts": [{ "text": prompts::plan_prompt(analysis, language) }] }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": prompts::plan_schema()
            }
        });
        let response = self.generate_content(&self.analysis_model, body).await?;
        let text = extract_text(&response).ok_or(ServiceError::Empty("storyboard text"))?;
        let drafts = parse_plan(&text)?;
        info!("✅ Storyboard planned with {} scenes", drafts.len());
        Ok(drafts)
    }

    async fn render(&self, image: &EncodedImage, item: &StoryboardItem) -> Result<GeneratedImage, ServiceError> {
        let prompt = prompts::render_prompt(item);
        info!("🎯 Rendering scene {} ({}) with prompt: {}", item.id, item.role.label(), prompt.chars().take(100).collect::<String>());
        let body = json!({
            "contents": [{
                "parts": [Self::image_part(image), { "text": prompt }]
            }],
            "generationConfig": {
                "responseModalities": ["TEXT", "IMAGE"],
                "imageConfig": { "aspectRatio": self.aspect_ratio }
            }
        });
        let response = self.generate_content(&self.render_model, body).await?;
        let Some(generated) = extract_first_image(&response) else {
            warn!("⚠️ No image data found in render response for scene {}", item.id);
            return Err(ServiceError::Empty("image data"));
        };
        let image_type = if generated.data.starts_with("PHN2Zy") {
            "SVG"
        } else if generated.data.starts_with("iVBORw0KGgo") {
            "PNG"
        } else if generated.data.starts_with("/9j/") {
            "JPEG"
        } else {
            "Unknown"
        };
        info!("🖼️ Extracted {} image for scene {}: {}", image_type, item.id, preview(&generated.data));
        Ok(generated)
    }

    async fn converse(&self, history: &[ChatTurn], message: &str) -> Result<String, ServiceError> {
        let mut contents: Vec<Value> = history
            .iter()
            .map(|turn| {
                let role = match turn.role {
                    ChatRole::User => "user",
                    ChatRole::Model => "model",
                };
                json!({ "role": role, "parts": [{ "text": turn.text }] })
            })
            .collect();
        contents.push(json!({ "role": "user", "parts": [{ "text": message }] }));

        let body = json!({
            "systemInstruction": { "parts": [{ "text": prompts::ADVISOR_SYSTEM_INSTRUCTION }] },
            "contents": contents
        });
        let response = self.generate_content(&self.advisor_model, body).await?;
        extract_text(&response).ok_or(ServiceError::Empty("reply text"))
    }
}

/// Parses the plan JSON array into drafts, enforcing the fixed scene count.
pub fn parse_plan(text: &str) -> Result<Vec<StoryboardDraft>, ServiceError> {
    let wire: Vec<DraftWire> =
        serde_json::from_str(text).map_err(|e| ServiceError::Malformed(format!("storyboard: {}", e)))?;
    if wire.len() != STORYBOARD_LEN {
        return Err(ServiceError::Malformed(format!(
            "expected {} scenes, got {}",
            STORYBOARD_LEN,
            wire.len()
        )));
    }
    Ok(wire
        .into_iter()
        .enumerate()
        .map(|(index, draft)| {
            let role = SceneRole::from_label(&draft.kind)
                .or_else(|| SceneRole::at_position(index))
                .unwrap_or(SceneRole::Advice);
            StoryboardDraft {
                role,
                title: draft.title,
                description: draft.description,
                visual_prompt: draft.visual_prompt,
                overlay_text: draft.overlay_text,
            }
        })
        .collect())
}

// --- Response Parsing Helpers ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DraftWire {
    #[serde(rename = "type")]
    kind: String,
    title: String,
    description: String,
    visual_prompt: String,
    overlay_text: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Content,
}

#[derive(Debug, Deserialize, Default)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Part {
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
    Text {
        text: String,
    },
    #[allow(dead_code)]
    Other(Value),
}

#[derive(Debug, Deserialize)]
struct InlineData {
    data: String,
    #[serde(rename = "mimeType")]
    mime_type: String,
}

fn extract_first_image(resp: &GeminiResponse) -> Option<GeneratedImage> {
    resp.candidates.iter().flat_map(|c| &c.content.parts).find_map(|p| match p {
        Part::Inline { inline_data } if !inline_data.data.is_empty() => Some(GeneratedImage {
            mime_type: inline_data.mime_type.clone(),
            data: inline_data.data.clone(),
        }),
        _ => None,
    })
}

/// Concatenated text parts of the first candidate, `None` when there is no text at all.
fn extract_text(resp: &GeminiResponse) -> Option<String> {
    let candidate = resp.candidates.first()?;
    let text: String = candidate
        .content
        .parts
        .iter()
        .filter_map(|p| match p {
            Part::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}
