use async_trait::async_trait;
use thiserror::Error;

use crate::models::{
    ChatTurn, EncodedImage, GeneratedImage, Language, ProductAnalysis, StoryboardDraft, StoryboardItem,
};

/// Number of scenes every plan must contain.
pub const STORYBOARD_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("no {0} in response")]
    Empty(&'static str),
}

/// The remote multimodal capability the workflow is built on.
///
/// Implementations make exactly one attempt per call and report every
/// failure, including a well-formed response that lacks the expected payload,
/// as a `ServiceError`.
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn analyze(&self, image: &EncodedImage, description: &str) -> Result<ProductAnalysis, ServiceError>;

    /// Returns exactly [`STORYBOARD_LEN`] drafts in response order.
    async fn plan(&self, analysis: &ProductAnalysis, language: Language) -> Result<Vec<StoryboardDraft>, ServiceError>;

    async fn render(&self, image: &EncodedImage, item: &StoryboardItem) -> Result<GeneratedImage, ServiceError>;

    /// One advisory turn. `history` holds the earlier turns of the conversation.
    async fn converse(&self, history: &[ChatTurn], message: &str) -> Result<String, ServiceError>;
}
