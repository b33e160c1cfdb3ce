//! The workflow controller: owns the single user session, drives the step
//! state machine and reduces remote results into session state.
//!
//! Every operation that awaits the remote service captures the session id
//! first and re-checks it before touching state again, so a response that
//! arrives after [`WorkflowController::restart`] is dropped instead of being
//! applied to the new session.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::{
    EditableField, EncodedImage, ImageError, Language, ProductAnalysis, StoryboardItem, WorkflowStep,
};
use crate::service::{GenerationService, ServiceError, STORYBOARD_LEN};

/// Broadcast channel capacity for workflow events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("{operation} is not allowed at step {step:?}")]
    InvalidStep { operation: &'static str, step: WorkflowStep },
    #[error("missing input: {0}")]
    MissingInput(&'static str),
    #[error("no product analysis available")]
    MissingAnalysis,
    #[error("no original image stored")]
    MissingImage,
    #[error("storyboard is empty")]
    EmptyStoryboard,
    #[error("storyboard item {0} not found")]
    UnknownItem(u32),
    #[error("storyboard item {0} has no generated image")]
    NoImage(u32),
    #[error("session was restarted while the request was in flight")]
    Stale,
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Mutable state of one user flow. Replaced wholesale on restart.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub step: WorkflowStep,
    pub original_image: Option<EncodedImage>,
    pub base_prompt: String,
    pub target_language: Language,
    pub analysis: Option<ProductAnalysis>,
    pub storyboard: Vec<StoryboardItem>,
    /// Items processed in the current generation batch, rendered or failed.
    pub generation_progress: usize,
    pub failed_items: Vec<u32>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    fn new(language: Language) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            step: WorkflowStep::Upload,
            original_image: None,
            base_prompt: String::new(),
            target_language: language,
            analysis: None,
            storyboard: Vec::new(),
            generation_progress: 0,
            failed_items: Vec::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSummary {
    pub mime_type: String,
    pub bytes: usize,
}

/// Read-only view of the session handed to the view layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSnapshot {
    pub session_id: Uuid,
    pub step: WorkflowStep,
    pub stage: u8,
    pub step_label: &'static str,
    pub original_image: Option<ImageSummary>,
    pub base_prompt: String,
    pub target_language: Language,
    pub analysis: Option<ProductAnalysis>,
    pub storyboard: Vec<StoryboardItem>,
    pub generation_progress: usize,
    pub total: usize,
    pub failed_items: Vec<u32>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Session> for WorkflowSnapshot {
    fn from(s: &Session) -> Self {
        Self {
            session_id: s.id,
            step: s.step,
            stage: s.step.stage(),
            step_label: s.step.label(),
            original_image: s.original_image.as_ref().map(|img| ImageSummary {
                mime_type: img.mime_type.clone(),
                bytes: img.data.len(),
            }),
            base_prompt: s.base_prompt.clone(),
            target_language: s.target_language,
            analysis: s.analysis.clone(),
            storyboard: s.storyboard.clone(),
            generation_progress: s.generation_progress,
            total: s.storyboard.len(),
            failed_items: s.failed_items.clone(),
            last_error: s.last_error.clone(),
            created_at: s.created_at,
            updated_at: s.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    StepChanged { session_id: Uuid, step: WorkflowStep },
    AnalysisCompleted { session_id: Uuid },
    StoryboardPlanned { session_id: Uuid, items: usize },
    ItemUpdated { session_id: Uuid, id: u32, field: EditableField },
    ItemRendered { session_id: Uuid, id: u32, progress: usize, total: usize },
    ItemFailed { session_id: Uuid, id: u32, progress: usize, total: usize, error: String },
    PhaseFailed { session_id: Uuid, step: WorkflowStep, message: String },
    Restarted { session_id: Uuid },
}

/// A validated generation batch, produced by [`WorkflowController::begin_generation`].
#[derive(Debug)]
pub struct GenerationRun {
    session_id: Uuid,
    ids: Vec<u32>,
    image: EncodedImage,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GenerationReport {
    pub rendered: Vec<u32>,
    pub failed: Vec<u32>,
}

pub struct WorkflowController {
    service: Arc<dyn GenerationService>,
    default_language: Language,
    session: RwLock<Session>,
    events: broadcast::Sender<WorkflowEvent>,
}

impl WorkflowController {
    pub fn new(service: Arc<dyn GenerationService>, default_language: Language) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            service,
            default_language,
            session: RwLock::new(Session::new(default_language)),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot::from(&*self.session.read())
    }

    pub fn step(&self) -> WorkflowStep {
        self.session.read().step
    }

    fn emit(&self, event: WorkflowEvent) {
        // Zero receivers is fine.
        let _ = self.events.send(event);
    }

    /// Runs `f` against the session only if it is still the one identified by `session_id`.
    fn apply<T>(&self, session_id: Uuid, f: impl FnOnce(&mut Session) -> T) -> Result<T, WorkflowError> {
        let mut session = self.session.write();
        if session.id != session_id {
            debug!(stale = %session_id, current = %session.id, "Dropping response for a restarted session");
            return Err(WorkflowError::Stale);
        }
        let out = f(&mut *session);
        session.updated_at = Utc::now();
        Ok(out)
    }

    /// Upload → Analyzing → AnalysisReady, or back to Upload on failure.
    pub async fn start_analysis(
        &self,
        image: EncodedImage,
        description: &str,
        language: Language,
    ) -> Result<ProductAnalysis, WorkflowError> {
        let description = description.trim();
        if description.is_empty() {
            return Err(WorkflowError::MissingInput("description"));
        }

        let session_id = {
            let mut session = self.session.write();
            expect_step(&session, "start_analysis", &[WorkflowStep::Upload])?;
            session.original_image = Some(image.clone());
            session.base_prompt = description.to_string();
            session.target_language = language;
            session.analysis = None;
            session.last_error = None;
            session.step = WorkflowStep::Analyzing;
            session.updated_at = Utc::now();
            session.id
        };
        self.emit(WorkflowEvent::StepChanged { session_id, step: WorkflowStep::Analyzing });
        info!(%session_id, "🔍 Starting analysis ({} market): {}", language, description);

        match self.service.analyze(&image, description).await {
            Ok(analysis) => {
                self.apply(session_id, |s| {
                    s.analysis = Some(analysis.clone());
                    s.step = WorkflowStep::AnalysisReady;
                })?;
                info!(%session_id, "✅ Analysis ready for review");
                self.emit(WorkflowEvent::AnalysisCompleted { session_id });
                self.emit(WorkflowEvent::StepChanged { session_id, step: WorkflowStep::AnalysisReady });
                Ok(analysis)
            }
            Err(e) => {
                error!(%session_id, "❌ Analysis failed: {}", e);
                let message = format!("Analysis failed: {e}");
                self.apply(session_id, |s| {
                    s.analysis = None;
                    s.step = WorkflowStep::Upload;
                    s.last_error = Some(message.clone());
                })?;
                self.emit(WorkflowEvent::PhaseFailed { session_id, step: WorkflowStep::Analyzing, message });
                self.emit(WorkflowEvent::StepChanged { session_id, step: WorkflowStep::Upload });
                Err(e.into())
            }
        }
    }

    /// AnalysisReady → Planning → Editing, or back to AnalysisReady on failure.
    pub async fn confirm_analysis_and_plan(&self) -> Result<Vec<StoryboardItem>, WorkflowError> {
        let (session_id, analysis, language) = {
            let mut session = self.session.write();
            expect_step(&session, "confirm_analysis_and_plan", &[WorkflowStep::AnalysisReady])?;
            let analysis = session.analysis.clone().ok_or(WorkflowError::MissingAnalysis)?;
            session.step = WorkflowStep::Planning;
            session.last_error = None;
            session.updated_at = Utc::now();
            (session.id, analysis, session.target_language)
        };
        self.emit(WorkflowEvent::StepChanged { session_id, step: WorkflowStep::Planning });
        info!(%session_id, "🗂️ Planning {}-scene storyboard in {}", STORYBOARD_LEN, language);

        let planned = self.service.plan(&analysis, language).await.and_then(|drafts| {
            if drafts.len() == STORYBOARD_LEN {
                Ok(drafts)
            } else {
                Err(ServiceError::Malformed(format!("expected {} scenes, got {}", STORYBOARD_LEN, drafts.len())))
            }
        });

        match planned {
            Ok(drafts) => {
                let items: Vec<StoryboardItem> = drafts
                    .into_iter()
                    .zip(1u32..)
                    .map(|(draft, id)| StoryboardItem::from_draft(id, draft))
                    .collect();
                self.apply(session_id, |s| {
                    s.storyboard = items.clone();
                    s.generation_progress = 0;
                    s.failed_items.clear();
                    s.step = WorkflowStep::Editing;
                })?;
                info!(%session_id, "✅ Storyboard ready with {} scenes", items.len());
                self.emit(WorkflowEvent::StoryboardPlanned { session_id, items: items.len() });
                self.emit(WorkflowEvent::StepChanged { session_id, step: WorkflowStep::Editing });
                Ok(items)
            }
            Err(e) => {
                error!(%session_id, "❌ Storyboard planning failed: {}", e);
                let message = format!("Storyboard planning failed: {e}");
                self.apply(session_id, |s| {
                    s.step = WorkflowStep::AnalysisReady;
                    s.last_error = Some(message.clone());
                })?;
                self.emit(WorkflowEvent::PhaseFailed { session_id, step: WorkflowStep::Planning, message });
                self.emit(WorkflowEvent::StepChanged { session_id, step: WorkflowStep::AnalysisReady });
                Err(e.into())
            }
        }
    }

    /// Local edit of one text field. Allowed at any step once a storyboard exists.
    pub fn update_storyboard_field(
        &self,
        id: u32,
        field: EditableField,
        value: impl Into<String>,
    ) -> Result<StoryboardItem, WorkflowError> {
        let (session_id, item) = {
            let mut session = self.session.write();
            if session.storyboard.is_empty() {
                return Err(WorkflowError::EmptyStoryboard);
            }
            let item = session
                .storyboard
                .iter_mut()
                .find(|item| item.id == id)
                .ok_or(WorkflowError::UnknownItem(id))?;
            item.set_field(field, value.into());
            let item = item.clone();
            session.updated_at = Utc::now();
            (session.id, item)
        };
        debug!(%session_id, id, ?field, value = item.field(field), "✏️ Storyboard field updated");
        self.emit(WorkflowEvent::ItemUpdated { session_id, id, field });
        Ok(item)
    }

    /// Validates and enters `Generating`. Every item loses its previous image.
    pub fn begin_generation(&self) -> Result<GenerationRun, WorkflowError> {
        let run = {
            let mut guard = self.session.write();
            let session = &mut *guard;
            if session.storyboard.is_empty() {
                return Err(WorkflowError::EmptyStoryboard);
            }
            expect_step(session, "generate_all", &[WorkflowStep::Editing, WorkflowStep::Complete])?;
            let image = session.original_image.clone().ok_or(WorkflowError::MissingImage)?;

            for item in &mut session.storyboard {
                item.generated_image_url = None;
            }
            session.generation_progress = 0;
            session.failed_items.clear();
            session.last_error = None;
            session.step = WorkflowStep::Generating;
            session.updated_at = Utc::now();

            let mut ids: Vec<u32> = session.storyboard.iter().map(|item| item.id).collect();
            ids.sort_unstable();
            GenerationRun { session_id: session.id, ids, image }
        };
        self.emit(WorkflowEvent::StepChanged { session_id: run.session_id, step: WorkflowStep::Generating });
        info!(session_id = %run.session_id, "🚀 Generating {} scenes", run.ids.len());
        Ok(run)
    }

    /// Renders every item of `run` one at a time in ascending id order. A failed
    /// scene is recorded and skipped; the batch always ends in `Complete`.
    pub async fn run_generation(&self, run: GenerationRun) -> Result<GenerationReport, WorkflowError> {
        let GenerationRun { session_id, ids, image } = run;
        let total = ids.len();
        let mut report = GenerationReport::default();

        for id in ids {
            let item = {
                let session = self.session.read();
                if session.id != session_id {
                    debug!(stale = %session_id, "Generation abandoned after restart");
                    return Err(WorkflowError::Stale);
                }
                session.storyboard.iter().find(|item| item.id == id).cloned()
            };

            let outcome = match item {
                Some(item) => self.service.render(&image, &item).await,
                None => Err(ServiceError::Malformed(format!("storyboard item {id} disappeared"))),
            };

            let progress = self.apply(session_id, |s| {
                match &outcome {
                    Ok(generated) => {
                        if let Some(slot) = s.storyboard.iter_mut().find(|item| item.id == id) {
                            slot.generated_image_url = Some(generated.to_data_url());
                        }
                    }
                    Err(_) => s.failed_items.push(id),
                }
                s.generation_progress += 1;
                s.generation_progress
            })?;

            match outcome {
                Ok(_) => {
                    info!(%session_id, "✅ Scene {} rendered ({}/{})", id, progress, total);
                    report.rendered.push(id);
                    self.emit(WorkflowEvent::ItemRendered { session_id, id, progress, total });
                }
                Err(e) => {
                    warn!(%session_id, "⚠️ Scene {} failed, continuing: {}", id, e);
                    report.failed.push(id);
                    self.emit(WorkflowEvent::ItemFailed { session_id, id, progress, total, error: e.to_string() });
                }
            }
        }

        self.apply(session_id, |s| s.step = WorkflowStep::Complete)?;
        info!(
            %session_id,
            "🏁 Generation complete: {} rendered, {} failed",
            report.rendered.len(),
            report.failed.len()
        );
        self.emit(WorkflowEvent::StepChanged { session_id, step: WorkflowStep::Complete });
        Ok(report)
    }

    pub async fn generate_all(&self) -> Result<GenerationReport, WorkflowError> {
        let run = self.begin_generation()?;
        self.run_generation(run).await
    }

    /// Discards the whole session and returns to `Upload`. Returns the new session id.
    pub fn restart(&self) -> Uuid {
        let (previous, current) = {
            let mut session = self.session.write();
            let previous = session.id;
            *session = Session::new(self.default_language);
            (previous, session.id)
        };
        info!(%previous, %current, "🔄 Session restarted");
        self.emit(WorkflowEvent::Restarted { session_id: current });
        self.emit(WorkflowEvent::StepChanged { session_id: current, step: WorkflowStep::Upload });
        current
    }

    /// Decoded generated image of one item, for download.
    pub fn item_image(&self, id: u32) -> Result<(StoryboardItem, EncodedImage), WorkflowError> {
        let item = {
            let session = self.session.read();
            session
                .storyboard
                .iter()
                .find(|item| item.id == id)
                .cloned()
                .ok_or(WorkflowError::UnknownItem(id))?
        };
        let url = item.generated_image_url.as_deref().ok_or(WorkflowError::NoImage(id))?;
        let image = EncodedImage::parse(url)?;
        Ok((item, image))
    }
}

fn expect_step(session: &Session, operation: &'static str, allowed: &[WorkflowStep]) -> Result<(), WorkflowError> {
    if allowed.contains(&session.step) {
        Ok(())
    } else {
        Err(WorkflowError::InvalidStep { operation, step: session.step })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChatTurn, GeneratedImage, SceneRole, StoryboardDraft};
    use async_trait::async_trait;
    use base64::Engine;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use tokio::sync::Notify;

    fn image() -> EncodedImage {
        EncodedImage::new("image/png", vec![0x89, b'P', b'N', b'G']).unwrap()
    }

    fn analysis() -> ProductAnalysis {
        ProductAnalysis {
            main_color: "#FFFFFF".into(),
            secondary_color: "#D9D4CC".into(),
            background_color: "#F4EFE6".into(),
            features: vec!["hand glazed".into()],
            material: "ceramic".into(),
            category: "tableware".into(),
            style_keywords: vec!["minimalist".into()],
        }
    }

    fn drafts(count: usize) -> Vec<StoryboardDraft> {
        (0..count)
            .map(|i| StoryboardDraft {
                role: SceneRole::at_position(i).unwrap_or(SceneRole::Advice),
                title: format!("Scene {}", i + 1),
                description: "desc".into(),
                visual_prompt: format!("prompt {}", i + 1),
                overlay_text: format!("copy {}", i + 1),
            })
            .collect()
    }

    #[derive(Default)]
    struct ScriptedService {
        fail_analyze: Mutex<bool>,
        fail_plan: Mutex<bool>,
        plan_len: Option<usize>,
        fail_render: Vec<u32>,
        /// (id, overlay text) seen by each render call, in call order.
        render_calls: Mutex<Vec<(u32, String)>>,
    }

    #[async_trait]
    impl GenerationService for ScriptedService {
        async fn analyze(&self, _image: &EncodedImage, _description: &str) -> Result<ProductAnalysis, ServiceError> {
            if *self.fail_analyze.lock() {
                return Err(ServiceError::Http("connection reset".into()));
            }
            Ok(analysis())
        }

        async fn plan(&self, _analysis: &ProductAnalysis, _language: Language) -> Result<Vec<StoryboardDraft>, ServiceError> {
            if *self.fail_plan.lock() {
                return Err(ServiceError::Empty("storyboard text"));
            }
            Ok(drafts(self.plan_len.unwrap_or(STORYBOARD_LEN)))
        }

        async fn render(&self, _image: &EncodedImage, item: &StoryboardItem) -> Result<GeneratedImage, ServiceError> {
            self.render_calls.lock().push((item.id, item.overlay_text.clone()));
            if self.fail_render.contains(&item.id) {
                return Err(ServiceError::Empty("image data"));
            }
            Ok(GeneratedImage {
                mime_type: "image/png".into(),
                data: base64::engine::general_purpose::STANDARD.encode(format!("img{}", item.id)),
            })
        }

        async fn converse(&self, _history: &[ChatTurn], _message: &str) -> Result<String, ServiceError> {
            Ok("ok".into())
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Gate {
        Analyze,
        Plan,
        Render(u32),
    }

    /// Blocks the gated call until `release` is notified.
    struct GatedService {
        inner: ScriptedService,
        gate: Gate,
        entered: Notify,
        release: Notify,
    }

    impl GatedService {
        fn new(gate: Gate) -> Self {
            Self { inner: ScriptedService::default(), gate, entered: Notify::new(), release: Notify::new() }
        }

        async fn hold(&self, at: Gate) {
            if self.gate == at {
                self.entered.notify_one();
                self.release.notified().await;
            }
        }
    }

    #[async_trait]
    impl GenerationService for GatedService {
        async fn analyze(&self, image: &EncodedImage, description: &str) -> Result<ProductAnalysis, ServiceError> {
            self.hold(Gate::Analyze).await;
            self.inner.analyze(image, description).await
        }

        async fn plan(&self, analysis: &ProductAnalysis, language: Language) -> Result<Vec<StoryboardDraft>, ServiceError> {
            self.hold(Gate::Plan).await;
            self.inner.plan(analysis, language).await
        }

        async fn render(&self, image: &EncodedImage, item: &StoryboardItem) -> Result<GeneratedImage, ServiceError> {
            self.hold(Gate::Render(item.id)).await;
            self.inner.render(image, item).await
        }

        async fn converse(&self, history: &[ChatTurn], message: &str) -> Result<String, ServiceError> {
            self.inner.converse(history, message).await
        }
    }

    fn controller(service: ScriptedService) -> (Arc<ScriptedService>, WorkflowController) {
        let service = Arc::new(service);
        let controller = WorkflowController::new(service.clone(), Language::Chinese);
        (service, controller)
    }

    async fn to_editing(controller: &WorkflowController) {
        controller.start_analysis(image(), "minimalist ceramic dish", Language::English).await.unwrap();
        controller.confirm_analysis_and_plan().await.unwrap();
    }

    #[tokio::test]
    async fn full_flow_with_one_failed_scene() {
        let (service, controller) = controller(ScriptedService { fail_render: vec![5], ..Default::default() });
        let mut events = controller.subscribe();

        let analysis = controller
            .start_analysis(image(), "minimalist ceramic dish", Language::English)
            .await
            .unwrap();
        assert_eq!(analysis.main_color, "#FFFFFF");
        assert_eq!(controller.step(), WorkflowStep::AnalysisReady);

        let items = controller.confirm_analysis_and_plan().await.unwrap();
        assert_eq!(items.iter().map(|i| i.id).collect::<Vec<_>>(), (1..=8).collect::<Vec<u32>>());
        assert_eq!(controller.step(), WorkflowStep::Editing);

        controller.update_storyboard_field(3, EditableField::OverlayText, "Limited Edition").unwrap();

        let report = controller.generate_all().await.unwrap();
        assert_eq!(report.failed, vec![5]);
        assert_eq!(report.rendered, vec![1, 2, 3, 4, 6, 7, 8]);

        let snap = controller.snapshot();
        assert_eq!(snap.step, WorkflowStep::Complete);
        assert_eq!(snap.generation_progress, 8);
        assert_eq!(snap.failed_items, vec![5]);
        assert_eq!(snap.target_language, Language::English);
        for item in &snap.storyboard {
            assert_eq!(item.generated_image_url.is_some(), item.id != 5, "item {}", item.id);
        }
        assert_eq!(snap.storyboard[2].overlay_text, "Limited Edition");

        let calls = service.render_calls.lock().clone();
        assert_eq!(calls.iter().map(|(id, _)| *id).collect::<Vec<_>>(), (1..=8).collect::<Vec<u32>>());
        assert_eq!(calls[2].1, "Limited Edition");

        let mut progress = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                WorkflowEvent::ItemRendered { progress: p, .. } | WorkflowEvent::ItemFailed { progress: p, .. } => {
                    progress.push(p)
                }
                _ => {}
            }
        }
        assert_eq!(progress, (1..=8).collect::<Vec<usize>>());
    }

    #[tokio::test]
    async fn analysis_failure_returns_to_upload_and_keeps_inputs() {
        let (service, controller) = controller(ScriptedService::default());
        *service.fail_analyze.lock() = true;

        let err = controller.start_analysis(image(), "ceramic dish", Language::Korean).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Service(ServiceError::Http(_))));

        let snap = controller.snapshot();
        assert_eq!(snap.step, WorkflowStep::Upload);
        assert!(snap.analysis.is_none());
        assert_eq!(snap.base_prompt, "ceramic dish");
        assert_eq!(snap.target_language, Language::Korean);
        assert!(snap.original_image.is_some());
        assert!(snap.last_error.as_deref().unwrap_or_default().starts_with("Analysis failed"));

        *service.fail_analyze.lock() = false;
        controller.start_analysis(image(), "ceramic dish", Language::Korean).await.unwrap();
        let snap = controller.snapshot();
        assert_eq!(snap.step, WorkflowStep::AnalysisReady);
        assert!(snap.last_error.is_none());
    }

    #[tokio::test]
    async fn planning_failure_keeps_analysis_for_retry() {
        let (service, controller) = controller(ScriptedService::default());
        controller.start_analysis(image(), "dish", Language::Spanish).await.unwrap();
        *service.fail_plan.lock() = true;

        assert!(controller.confirm_analysis_and_plan().await.is_err());
        let snap = controller.snapshot();
        assert_eq!(snap.step, WorkflowStep::AnalysisReady);
        assert_eq!(snap.analysis, Some(analysis()));
        assert!(snap.storyboard.is_empty());

        *service.fail_plan.lock() = false;
        let items = controller.confirm_analysis_and_plan().await.unwrap();
        assert_eq!(items.len(), 8);
        assert_eq!(controller.step(), WorkflowStep::Editing);
    }

    #[tokio::test]
    async fn plan_with_wrong_scene_count_is_rejected() {
        let (_, controller) = controller(ScriptedService { plan_len: Some(6), ..Default::default() });
        controller.start_analysis(image(), "dish", Language::English).await.unwrap();

        let err = controller.confirm_analysis_and_plan().await.unwrap_err();
        assert!(matches!(err, WorkflowError::Service(ServiceError::Malformed(_))));
        assert_eq!(controller.step(), WorkflowStep::AnalysisReady);
    }

    #[tokio::test]
    async fn operations_out_of_order_are_rejected_without_side_effects() {
        let (_, controller) = controller(ScriptedService::default());

        assert!(matches!(
            controller.confirm_analysis_and_plan().await,
            Err(WorkflowError::InvalidStep { step: WorkflowStep::Upload, .. })
        ));
        assert!(matches!(controller.generate_all().await, Err(WorkflowError::EmptyStoryboard)));
        assert!(matches!(
            controller.update_storyboard_field(1, EditableField::Title, "x"),
            Err(WorkflowError::EmptyStoryboard)
        ));
        assert!(matches!(
            controller.start_analysis(image(), "   ", Language::English).await,
            Err(WorkflowError::MissingInput("description"))
        ));
        assert_eq!(controller.step(), WorkflowStep::Upload);

        controller.start_analysis(image(), "dish", Language::English).await.unwrap();
        assert!(matches!(
            controller.start_analysis(image(), "dish", Language::English).await,
            Err(WorkflowError::InvalidStep { step: WorkflowStep::AnalysisReady, .. })
        ));
    }

    #[tokio::test]
    async fn edits_touch_only_the_named_field_and_are_idempotent() {
        let (_, controller) = controller(ScriptedService::default());
        to_editing(&controller).await;
        let before = controller.snapshot().storyboard;

        controller.update_storyboard_field(4, EditableField::Title, "Brunch ready").unwrap();
        let once = controller.snapshot().storyboard;
        controller.update_storyboard_field(4, EditableField::Title, "Brunch ready").unwrap();
        let twice = controller.snapshot().storyboard;
        assert_eq!(once, twice);

        for (old, new) in before.iter().zip(&once) {
            assert_eq!(old.id, new.id);
            assert_eq!(old.role, new.role);
            if old.id == 4 {
                assert_eq!(new.title, "Brunch ready");
                assert_eq!(new.description, old.description);
                assert_eq!(new.overlay_text, old.overlay_text);
                assert_eq!(new.visual_prompt, old.visual_prompt);
            } else {
                assert_eq!(old, new);
            }
        }

        assert!(matches!(
            controller.update_storyboard_field(42, EditableField::Title, "x"),
            Err(WorkflowError::UnknownItem(42))
        ));
    }

    #[tokio::test]
    async fn regenerating_reprocesses_every_item() {
        let (service, controller) = controller(ScriptedService::default());
        to_editing(&controller).await;

        controller.generate_all().await.unwrap();
        controller.update_storyboard_field(1, EditableField::VisualPrompt, "on marble").unwrap();
        let report = controller.generate_all().await.unwrap();

        assert_eq!(report.rendered.len(), 8);
        assert_eq!(service.render_calls.lock().len(), 16);
        let snap = controller.snapshot();
        assert_eq!(snap.step, WorkflowStep::Complete);
        assert_eq!(snap.generation_progress, 8);
        assert!(snap.failed_items.is_empty());
    }

    #[tokio::test]
    async fn restart_from_any_step_returns_to_upload() {
        let (_, controller) = controller(ScriptedService::default());
        let first = controller.snapshot().session_id;
        to_editing(&controller).await;
        controller.generate_all().await.unwrap();

        let second = controller.restart();
        assert_ne!(first, second);
        let snap = controller.snapshot();
        assert_eq!(snap.session_id, second);
        assert_eq!(snap.step, WorkflowStep::Upload);
        assert!(snap.analysis.is_none());
        assert!(snap.storyboard.is_empty());
        assert!(snap.original_image.is_none());
        assert_eq!(snap.generation_progress, 0);
        assert_eq!(snap.target_language, Language::Chinese);

        assert_ne!(controller.restart(), second);
        assert_eq!(controller.step(), WorkflowStep::Upload);
    }

    #[tokio::test]
    async fn item_image_decodes_generated_payload() {
        let (_, controller) = controller(ScriptedService { fail_render: vec![2], ..Default::default() });
        to_editing(&controller).await;
        controller.generate_all().await.unwrap();

        let (item, image) = controller.item_image(1).unwrap();
        assert_eq!(item.id, 1);
        assert_eq!(image.mime_type, "image/png");
        assert_eq!(&image.data[..], b"img1");
        assert!(matches!(controller.item_image(2), Err(WorkflowError::NoImage(2))));
        assert!(matches!(controller.item_image(9), Err(WorkflowError::UnknownItem(9))));
    }

    #[tokio::test]
    async fn late_analysis_after_restart_is_dropped() {
        let service = Arc::new(GatedService::new(Gate::Analyze));
        let controller = Arc::new(WorkflowController::new(service.clone(), Language::Chinese));

        let task = tokio::spawn({
            let controller = controller.clone();
            async move { controller.start_analysis(image(), "dish", Language::English).await }
        });
        service.entered.notified().await;
        assert_eq!(controller.step(), WorkflowStep::Analyzing);

        let fresh = controller.restart();
        service.release.notify_one();
        let result = task.await.unwrap();

        assert!(matches!(result, Err(WorkflowError::Stale)));
        let snap = controller.snapshot();
        assert_eq!(snap.session_id, fresh);
        assert_eq!(snap.step, WorkflowStep::Upload);
        assert!(snap.analysis.is_none());
        assert!(snap.base_prompt.is_empty());
    }

    #[tokio::test]
    async fn late_plan_after_restart_is_dropped() {
        let service = Arc::new(GatedService::new(Gate::Plan));
        let controller = Arc::new(WorkflowController::new(service.clone(), Language::Chinese));
        controller.start_analysis(image(), "dish", Language::English).await.unwrap();

        let task = tokio::spawn({
            let controller = controller.clone();
            async move { controller.confirm_analysis_and_plan().await }
        });
        service.entered.notified().await;
        controller.restart();
        service.release.notify_one();

        assert!(matches!(task.await.unwrap(), Err(WorkflowError::Stale)));
        assert!(controller.snapshot().storyboard.is_empty());
        assert_eq!(controller.step(), WorkflowStep::Upload);
    }

    #[tokio::test]
    async fn late_render_after_restart_stops_the_batch() {
        let service = Arc::new(GatedService::new(Gate::Render(3)));
        let controller = Arc::new(WorkflowController::new(service.clone(), Language::Chinese));
        to_editing(&controller).await;

        let task = tokio::spawn({
            let controller = controller.clone();
            async move { controller.generate_all().await }
        });
        service.entered.notified().await;
        assert_eq!(controller.snapshot().generation_progress, 2);

        controller.restart();
        service.release.notify_one();

        assert!(matches!(task.await.unwrap(), Err(WorkflowError::Stale)));
        let snap = controller.snapshot();
        assert_eq!(snap.step, WorkflowStep::Upload);
        assert_eq!(snap.generation_progress, 0);
        assert!(snap.storyboard.is_empty());
        assert_eq!(service.inner.render_calls.lock().len(), 3);
    }
}
