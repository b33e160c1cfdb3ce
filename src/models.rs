use std::{fmt, str::FromStr};

use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where the user is in the upload → analysis → storyboard → render flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStep {
    Upload,
    Analyzing,
    /// Analysis is stored and shown for review; planning has not started.
    AnalysisReady,
    Planning,
    Editing,
    Generating,
    Complete,
}

impl WorkflowStep {
    /// 1-based position in the four-stage step indicator.
    pub fn stage(self) -> u8 {
        match self {
            WorkflowStep::Upload => 1,
            WorkflowStep::Analyzing | WorkflowStep::AnalysisReady => 2,
            WorkflowStep::Planning | WorkflowStep::Editing => 3,
            WorkflowStep::Generating | WorkflowStep::Complete => 4,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            WorkflowStep::Upload => "Upload product photo",
            WorkflowStep::Analyzing => "Analyzing product",
            WorkflowStep::AnalysisReady => "Review analysis",
            WorkflowStep::Planning => "Planning storyboard",
            WorkflowStep::Editing => "Edit storyboard",
            WorkflowStep::Generating => "Generating images",
            WorkflowStep::Complete => "Complete",
        }
    }
}

/// Target market language for every piece of generated copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum Language {
    #[default]
    Chinese,
    Japanese,
    English,
    Korean,
    Spanish,
}

impl Language {
    pub const ALL: [Language; 5] = [
        Language::Chinese,
        Language::Japanese,
        Language::English,
        Language::Korean,
        Language::Spanish,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Language::Chinese => "Chinese",
            Language::Japanese => "Japanese",
            Language::English => "English",
            Language::Korean => "Korean",
            Language::Spanish => "Spanish",
        }
    }

    pub fn native_name(self) -> &'static str {
        match self {
            Language::Chinese => "中文",
            Language::Japanese => "日本語",
            Language::English => "English",
            Language::Korean => "한국어",
            Language::Spanish => "Español",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Language::ALL
            .into_iter()
            .find(|l| l.name().eq_ignore_ascii_case(s) || l.native_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unsupported language: {s}"))
    }
}

impl TryFrom<String> for Language {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// The eight fixed scene roles, in storyboard order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SceneRole {
    Cover,
    CloseUp,
    Feature,
    Usage,
    Craftsmanship,
    Size,
    Set,
    Advice,
}

impl SceneRole {
    pub const ALL: [SceneRole; 8] = [
        SceneRole::Cover,
        SceneRole::CloseUp,
        SceneRole::Feature,
        SceneRole::Usage,
        SceneRole::Craftsmanship,
        SceneRole::Size,
        SceneRole::Set,
        SceneRole::Advice,
    ];

    pub fn label(self) -> &'static str {
        match self {
            SceneRole::Cover => "Cover",
            SceneRole::CloseUp => "CloseUp",
            SceneRole::Feature => "Feature",
            SceneRole::Usage => "Usage",
            SceneRole::Craftsmanship => "Craftsmanship",
            SceneRole::Size => "Size",
            SceneRole::Set => "Set",
            SceneRole::Advice => "Advice",
        }
    }

    /// Case and punctuation insensitive match, so "Close-up" and "close up" are `CloseUp`.
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized: String = label
            .chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(char::to_lowercase)
            .collect();
        SceneRole::ALL
            .into_iter()
            .find(|role| role.label().to_lowercase() == normalized)
    }

    /// Role expected at a 0-based storyboard position.
    pub fn at_position(index: usize) -> Option<Self> {
        SceneRole::ALL.get(index).copied()
    }
}

/// Visual analysis of the uploaded product. Every field is mandatory on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductAnalysis {
    pub main_color: String,
    pub secondary_color: String,
    pub background_color: String,
    pub features: Vec<String>,
    pub material: String,
    pub category: String,
    pub style_keywords: Vec<String>,
}

/// A planned scene before the controller numbers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryboardDraft {
    pub role: SceneRole,
    pub title: String,
    pub description: String,
    pub visual_prompt: String,
    pub overlay_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryboardItem {
    pub id: u32,
    #[serde(rename = "type")]
    pub role: SceneRole,
    pub title: String,
    pub description: String,
    pub overlay_text: String,
    /// English instruction for the render call.
    pub visual_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_image_url: Option<String>,
}

impl StoryboardItem {
    pub fn from_draft(id: u32, draft: StoryboardDraft) -> Self {
        Self {
            id,
            role: draft.role,
            title: draft.title,
            description: draft.description,
            overlay_text: draft.overlay_text,
            visual_prompt: draft.visual_prompt,
            generated_image_url: None,
        }
    }

    pub fn field(&self, field: EditableField) -> &str {
        match field {
            EditableField::Title => &self.title,
            EditableField::Description => &self.description,
            EditableField::OverlayText => &self.overlay_text,
            EditableField::VisualPrompt => &self.visual_prompt,
        }
    }

    pub fn set_field(&mut self, field: EditableField, value: String) {
        let slot = match field {
            EditableField::Title => &mut self.title,
            EditableField::Description => &mut self.description,
            EditableField::OverlayText => &mut self.overlay_text,
            EditableField::VisualPrompt => &mut self.visual_prompt,
        };
        *slot = value;
    }

    /// Download name used by the bulk export, e.g. `Product_Scene_3_Feature.png`.
    pub fn export_file_name(&self, extension: &str) -> String {
        format!("Product_Scene_{}_{}.{}", self.id, self.role.label(), extension)
    }
}

/// Text fields of a storyboard item the user may edit. `id` and `type` are not among them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EditableField {
    Title,
    Description,
    OverlayText,
    VisualPrompt,
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image payload is empty")]
    Empty,
    #[error("malformed data URL")]
    InvalidDataUrl,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// An uploaded image: raw bytes plus the mime type they were declared or sniffed as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub mime_type: String,
    pub data: Bytes,
}

impl EncodedImage {
    pub fn new(mime_type: impl Into<String>, data: impl Into<Bytes>) -> Result<Self, ImageError> {
        let data = data.into();
        if data.is_empty() {
            return Err(ImageError::Empty);
        }
        Ok(Self { mime_type: mime_type.into(), data })
    }

    /// Accepts `data:<mime>;base64,<payload>` or bare base64.
    pub fn parse(input: &str) -> Result<Self, ImageError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ImageError::Empty);
        }
        let (declared, payload) = match input.strip_prefix("data:") {
            Some(rest) => {
                let (header, payload) = rest.split_once(',').ok_or(ImageError::InvalidDataUrl)?;
                let mime = header.strip_suffix(";base64").ok_or(ImageError::InvalidDataUrl)?;
                (Some(mime).filter(|m| !m.is_empty()), payload)
            }
            None => (None, input),
        };
        let data = base64::engine::general_purpose::STANDARD.decode(payload.trim())?;
        let mime_type = match declared {
            Some(mime) => mime.to_string(),
            None => sniff_mime(&data),
        };
        Self::new(mime_type, data)
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.to_base64())
    }

    pub fn extension(&self) -> &'static str {
        extension_for(&self.mime_type)
    }
}

/// Image returned by a render call, still base64 encoded as the service sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub mime_type: String,
    pub data: String,
}

impl GeneratedImage {
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

fn sniff_mime(data: &[u8]) -> String {
    image::guess_format(data)
        .map(|format| format.to_mime_type().to_string())
        .unwrap_or_else(|_| "image/png".to_string())
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        "image/gif" => "gif",
        _ => "png",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub text: String,
    pub at: DateTime<Utc>,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self { role: ChatRole::User, text: text.into(), at: Utc::now() }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self { role: ChatRole::Model, text: text.into(), at: Utc::now() }
    }
}

// --- HTTP request bodies ---

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzeRequest {
    /// Data URL or bare base64.
    pub image: String,
    pub description: String,
    #[serde(default)]
    pub language: Option<Language>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateFieldRequest {
    pub field: EditableField,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdvisorMessageRequest {
    pub text: String,
}
