use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::gemini::StyleProvider;
use crate::ingest::ingest;
use crate::models::{
    default_variation_prompts, AspectRatio, GenerationSession, Phase, SetAspectRatioRequest,
    SetPromptsRequest, StoredImage, StyleDescription, UploadInfo, ViewerTarget, VARIATION_COUNT,
};
use crate::orchestrator::{self, SessionSlot};

/// Everything the user edits before pressing "generate": the two uploads,
/// the style fields, the aspect ratio, the nine prompts, plus the viewer
/// overlay selection.
pub struct Studio {
    pub source: Option<StoredImage>,
    pub inspiration: Option<StoredImage>,
    pub style: StyleDescription,
    pub aspect_ratio: AspectRatio,
    pub prompts: Vec<String>,
    pub viewer: Option<String>,
}

impl Default for Studio {
    fn default() -> Self {
        Self {
            source: None,
            inspiration: None,
            style: StyleDescription::default(),
            aspect_ratio: AspectRatio::default(),
            prompts: default_variation_prompts(),
            viewer: None,
        }
    }
}

impl Studio {
    fn slot_mut(&mut self, kind: UploadKind) -> &mut Option<StoredImage> {
        match kind {
            UploadKind::Source => &mut self.source,
            UploadKind::Inspiration => &mut self.inspiration,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub studio: Arc<RwLock<Studio>>,
    pub session: SessionSlot,
    pub provider: Arc<dyn StyleProvider>,
}

impl AppState {
    pub fn new(provider: Arc<dyn StyleProvider>) -> Self {
        Self {
            studio: Arc::default(),
            session: Arc::default(),
            provider,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UploadKind {
    Source,
    Inspiration,
}

#[derive(Serialize)]
pub struct StudioView {
    pub source: Option<UploadInfo>,
    pub inspiration: Option<UploadInfo>,
    pub style: StyleDescription,
    pub aspect_ratio: AspectRatio,
    pub prompts: Vec<String>,
}

#[derive(Serialize)]
pub struct ViewerView {
    pub selected: Option<String>,
}

/// What `GET /api/session` reports. Before any run has started (and after
/// the slot is cleared) the phase is `Idle` rather than an absent body.
#[derive(Serialize)]
#[serde(untagged)]
pub enum SessionStatus {
    Active(GenerationSession),
    Idle { phase: Phase },
}

pub async fn upload_image(
    Path(kind): Path<UploadKind>,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadInfo>, AppError> {
    let field = multipart
        .next_field()
        .await
        .map_err(|e| AppError::InvalidInput(e.to_string()))?
        .ok_or_else(|| AppError::InvalidInput("no file in upload".into()))?;
    let bytes = field
        .bytes()
        .await
        .map_err(|e| AppError::InvalidInput(e.to_string()))?;

    let stored = ingest(bytes)?;
    let upload_info = stored.info();

    let mut studio = state.studio.write();
    if let Some(old) = studio.slot_mut(kind).replace(stored) {
        info!("🗑️ Released superseded preview {}", old.id);
    }
    Ok(Json(upload_info))
}

pub async fn remove_image(
    Path(kind): Path<UploadKind>,
    State(state): State<AppState>,
) -> StatusCode {
    let mut studio = state.studio.write();
    match studio.slot_mut(kind).take() {
        Some(old) => {
            info!("🗑️ Released preview {}", old.id);
            StatusCode::NO_CONTENT
        }
        None => StatusCode::NOT_FOUND,
    }
}

pub async fn get_preview(Path(id): Path<Uuid>, State(state): State<AppState>) -> Response {
    let studio = state.studio.read();
    let found = [&studio.source, &studio.inspiration]
        .into_iter()
        .flatten()
        .find(|img| img.id == id);
    match found {
        Some(img) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, img.mime_type.clone())],
            img.bytes.clone(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub async fn get_studio(State(state): State<AppState>) -> Json<StudioView> {
    let studio = state.studio.read();
    Json(StudioView {
        source: studio.source.as_ref().map(StoredImage::info),
        inspiration: studio.inspiration.as_ref().map(StoredImage::info),
        style: studio.style.clone(),
        aspect_ratio: studio.aspect_ratio,
        prompts: studio.prompts.clone(),
    })
}

pub async fn set_style(
    State(state): State<AppState>,
    Json(style): Json<StyleDescription>,
) -> Json<StyleDescription> {
    state.studio.write().style = style.clone();
    Json(style)
}

pub async fn set_aspect_ratio(
    State(state): State<AppState>,
    Json(body): Json<SetAspectRatioRequest>,
) -> Json<SetAspectRatioRequest> {
    state.studio.write().aspect_ratio = body.aspect_ratio;
    Json(body)
}

pub async fn set_prompts(
    State(state): State<AppState>,
    Json(body): Json<SetPromptsRequest>,
) -> Result<Json<SetPromptsRequest>, AppError> {
    if body.prompts.len() != VARIATION_COUNT {
        return Err(AppError::InvalidInput(format!(
            "expected {VARIATION_COUNT} variation prompts, got {}",
            body.prompts.len()
        )));
    }
    state.studio.write().prompts = body.prompts.clone();
    Ok(Json(body))
}

/// One style-analysis call against the inspiration image. The style fields
/// are only overwritten on success.
pub async fn analyze_style(
    State(state): State<AppState>,
) -> Result<Json<StyleDescription>, AppError> {
    let inspiration = state
        .studio
        .read()
        .inspiration
        .clone()
        .ok_or_else(|| AppError::MissingField("upload the inspiration image first".into()))?;

    let style = state.provider.analyze_style(&inspiration).await?;
    state.studio.write().style = style.clone();
    Ok(Json(style))
}

/// Validate preconditions, install a fresh session (superseding any prior
/// run) and spawn the drive task. The response is the just-installed
/// session; progress is observed via `GET /api/session`.
pub async fn start_generation(
    State(state): State<AppState>,
) -> Result<Json<GenerationSession>, AppError> {
    let (token, source) = {
        let studio = state.studio.read();
        orchestrator::install_session(
            &state.session,
            studio.source.as_ref(),
            &studio.style,
            studio.aspect_ratio,
            &studio.prompts,
        )?
    };

    let slot = state.session.clone();
    let provider = state.provider.clone();
    tokio::spawn(orchestrator::drive_session(slot, token, source, provider));

    let session = state
        .session
        .read()
        .clone()
        .ok_or_else(|| AppError::Unknown("session vanished after install".into()))?;
    Ok(Json(session))
}

pub async fn get_session(State(state): State<AppState>) -> Json<SessionStatus> {
    let status = match state.session.read().clone() {
        Some(session) => SessionStatus::Active(session),
        None => SessionStatus::Idle { phase: Phase::Idle },
    };
    Json(status)
}

/// Click-to-enlarge: resolve the target to a data URL and remember it.
pub async fn select_viewer(
    State(state): State<AppState>,
    Json(target): Json<ViewerTarget>,
) -> Result<Json<ViewerView>, AppError> {
    let data_url = match target {
        ViewerTarget::Source => {
            let studio = state.studio.read();
            let source = studio
                .source
                .as_ref()
                .ok_or_else(|| AppError::MissingField("no source image uploaded".into()))?;
            format!("data:{};base64,{}", source.mime_type, source.base64)
        }
        ViewerTarget::Generated { index } => {
            let session = state.session.read();
            let payload = session
                .as_ref()
                .and_then(|s| s.produced_images.get(index))
                .ok_or_else(|| {
                    AppError::InvalidInput(format!("no generated image at index {index}"))
                })?;
            format!("data:image/png;base64,{payload}")
        }
    };

    state.studio.write().viewer = Some(data_url.clone());
    Ok(Json(ViewerView {
        selected: Some(data_url),
    }))
}

pub async fn get_viewer(State(state): State<AppState>) -> Json<ViewerView> {
    Json(ViewerView {
        selected: state.studio.read().viewer.clone(),
    })
}

/// Closing the overlay clears the selection.
pub async fn clear_viewer(State(state): State<AppState>) -> StatusCode {
    state.studio.write().viewer = None;
    StatusCode::NO_CONTENT
}
