use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    advisor::{Advisor, AdvisorError, AdvisoryTranscript},
    models::{AdvisorMessageRequest, AnalyzeRequest, EncodedImage, StoryboardItem, UpdateFieldRequest},
    pdf::{generate_pdf, BriefFont},
    workflow::{WorkflowController, WorkflowError, WorkflowSnapshot},
};

#[derive(Clone)]
pub struct AppState {
    pub workflow: Arc<WorkflowController>,
    pub advisor: Arc<Advisor>,
    pub brief_font: BriefFont,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    Advisor(#[from] AdvisorError),
    #[error("export failed: {0}")]
    Export(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Workflow(e) => match e {
                WorkflowError::MissingInput(_) | WorkflowError::Image(_) => StatusCode::BAD_REQUEST,
                WorkflowError::UnknownItem(_) | WorkflowError::NoImage(_) => StatusCode::NOT_FOUND,
                WorkflowError::Service(_) => StatusCode::BAD_GATEWAY,
                WorkflowError::InvalidStep { .. }
                | WorkflowError::MissingAnalysis
                | WorkflowError::MissingImage
                | WorkflowError::EmptyStoryboard
                | WorkflowError::Stale => StatusCode::CONFLICT,
            },
            ApiError::Advisor(AdvisorError::UnknownSession(_)) => StatusCode::NOT_FOUND,
            ApiError::Export(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("❌ {}", self);
        } else {
            tracing::warn!("⚠️ {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// `max_upload_bytes` applies to the upload route only; other bodies keep axum's default limit.
pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/api/workflow", get(get_workflow))
        .route(
            "/api/workflow/analyze",
            post(start_analysis).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/api/workflow/plan", post(confirm_and_plan))
        .route("/api/workflow/storyboard/:id", patch(update_storyboard_item))
        .route("/api/workflow/storyboard/:id/image", get(download_item_image))
        .route("/api/workflow/generate", post(generate_all))
        .route("/api/workflow/restart", post(restart))
        .route("/api/workflow/export", get(export_manifest))
        .route("/api/workflow/export/pdf", get(export_pdf))
        .route("/api/advisor/sessions", post(open_advisor_session))
        .route(
            "/api/advisor/sessions/:id",
            get(get_advisor_transcript).delete(close_advisor_session),
        )
        .route("/api/advisor/sessions/:id/messages", post(send_advisor_message))
        .with_state(state)
}

pub async fn get_workflow(State(state): State<AppState>) -> Json<WorkflowSnapshot> {
    Json(state.workflow.snapshot())
}

pub async fn start_analysis(
    State(state): State<AppState>,
    Json(body): Json<AnalyzeRequest>,
) -> Result<Json<WorkflowSnapshot>, ApiError> {
    let image = EncodedImage::parse(&body.image).map_err(WorkflowError::from)?;
    let language = body.language.unwrap_or_else(|| state.workflow.snapshot().target_language);
    tracing::info!("📸 Upload received: {} ({} bytes)", image.mime_type, image.data.len());
    state.workflow.start_analysis(image, &body.description, language).await?;
    Ok(Json(state.workflow.snapshot()))
}

pub async fn confirm_and_plan(State(state): State<AppState>) -> Result<Json<WorkflowSnapshot>, ApiError> {
    state.workflow.confirm_analysis_and_plan().await?;
    Ok(Json(state.workflow.snapshot()))
}

pub async fn update_storyboard_item(
    Path(id): Path<u32>,
    State(state): State<AppState>,
    Json(body): Json<UpdateFieldRequest>,
) -> Result<Json<StoryboardItem>, ApiError> {
    Ok(Json(state.workflow.update_storyboard_field(id, body.field, body.value)?))
}

#[derive(Debug, Default, Deserialize)]
pub struct GenerateParams {
    #[serde(default)]
    pub wait: bool,
}

/// Starts the batch and returns 202 at once; progress is read back through
/// `GET /api/workflow`. With `?wait=true` the batch runs inside the request
/// and the response is the final report.
pub async fn generate_all(
    Query(params): Query<GenerateParams>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    if params.wait {
        let report = state.workflow.generate_all().await?;
        return Ok(Json(report).into_response());
    }
    let run = state.workflow.begin_generation()?;
    let workflow = state.workflow.clone();
    tokio::spawn(async move {
        match workflow.run_generation(run).await {
            Ok(report) => tracing::info!("📦 Batch finished: rendered={:?} failed={:?}", report.rendered, report.failed),
            Err(e) => tracing::warn!("⚠️ Batch stopped: {}", e),
        }
    });
    Ok((StatusCode::ACCEPTED, Json(state.workflow.snapshot())).into_response())
}

pub async fn restart(State(state): State<AppState>) -> Json<WorkflowSnapshot> {
    state.workflow.restart();
    Json(state.workflow.snapshot())
}

pub async fn download_item_image(Path(id): Path<u32>, State(state): State<AppState>) -> Result<Response, ApiError> {
    let (item, image) = state.workflow.item_image(id)?;
    let disposition = format!("attachment; filename=\"Scene_{}.{}\"", item.id, image.extension());
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, image.mime_type.clone()), (header::CONTENT_DISPOSITION, disposition)],
        image.data,
    )
        .into_response())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportEntry {
    pub id: u32,
    pub file_name: String,
    pub mime_type: String,
    pub data_url: String,
}

/// Every generated image with its bulk-download file name. Items without an image are skipped.
pub async fn export_manifest(State(state): State<AppState>) -> Json<Vec<ExportEntry>> {
    let ids: Vec<u32> = state.workflow.snapshot().storyboard.iter().map(|item| item.id).collect();
    let entries = ids
        .into_iter()
        .filter_map(|id| state.workflow.item_image(id).ok())
        .map(|(item, image)| ExportEntry {
            id: item.id,
            file_name: item.export_file_name(image.extension()),
            mime_type: image.mime_type.clone(),
            data_url: image.to_data_url(),
        })
        .collect();
    Json(entries)
}

pub async fn export_pdf(State(state): State<AppState>) -> Result<Response, ApiError> {
    let snapshot = state.workflow.snapshot();
    let pdf_bytes = generate_pdf(&snapshot, &state.brief_font).map_err(ApiError::Export)?;
    let disposition = format!("attachment; filename=\"storyboard_{}.pdf\"", snapshot.session_id);
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/pdf".to_string()), (header::CONTENT_DISPOSITION, disposition)],
        pdf_bytes,
    )
        .into_response())
}

pub async fn open_advisor_session(State(state): State<AppState>) -> (StatusCode, Json<AdvisoryTranscript>) {
    (StatusCode::CREATED, Json(state.advisor.open_session()))
}

pub async fn get_advisor_transcript(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<AdvisoryTranscript>, ApiError> {
    Ok(Json(state.advisor.transcript(id).await?))
}

pub async fn send_advisor_message(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    Json(body): Json<AdvisorMessageRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let reply = state.advisor.send_message(id, &body.text).await?;
    Ok(Json(json!({ "reply": reply })))
}

pub async fn close_advisor_session(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.advisor.close_session(id)?;
    Ok(StatusCode::NO_CONTENT)
}
