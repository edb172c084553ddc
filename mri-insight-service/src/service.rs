use axum::{
    Router,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{HeaderValue, Request, StatusCode},
    middleware::{Next, from_fn},
    response::Json,
    routing::{get, post, put},
};
use chrono::{TimeDelta, Utc};
use scan_flow::{
    AnalysisService, BatchSummary, FileBlob, HttpAnalysisService, InMemoryWorkspaceStorage,
    Preferences, ScanError, Workspace, WorkspaceStorage, chat,
};
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Instrument, error, info};
use uuid::Uuid;

use crate::{
    config::ServiceConfig,
    models::{
        ChatMessageRequest, ChatStateResponse, CreateWorkspaceRequest, SelectScanRequest,
        ThemeRequest, WorkspaceResponse,
    },
};

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<Value>)>;
type ApiError = (StatusCode, Json<Value>);

fn bad_request_error(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn not_found_error(message: &str, id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": message,
            "id": id
        })),
    )
}

fn conflict_error(message: &str) -> ApiError {
    (StatusCode::CONFLICT, Json(json!({ "error": message })))
}

fn internal_error(message: &str, details: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": message,
            "details": details
        })),
    )
}

fn scan_error(e: ScanError) -> ApiError {
    match &e {
        ScanError::ScanNotFound(id) => not_found_error("Scan not found", id),
        ScanError::ChatSessionNotFound(id) => not_found_error("Chat session not found", id),
        ScanError::NoSelection => conflict_error("No scan is selected"),
        ScanError::BatchTooLarge { .. } => bad_request_error(&e.to_string()),
        _ => {
            error!("Request failed: {}", e);
            internal_error("Request failed", &e.to_string())
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub workspaces: Arc<dyn WorkspaceStorage>,
    pub analysis: Arc<dyn AnalysisService>,
    pub config: Arc<ServiceConfig>,
}

impl AppState {
    pub fn new(analysis: Arc<dyn AnalysisService>, config: ServiceConfig) -> Self {
        Self {
            workspaces: Arc::new(InMemoryWorkspaceStorage::new()),
            analysis,
            config: Arc::new(config),
        }
    }
}

pub fn create_app(config: ServiceConfig) -> anyhow::Result<Router> {
    let analysis = HttpAnalysisService::new(config.analysis_url.clone(), config.analysis_timeout)?;
    info!("Forwarding scans to analysis service at {}", analysis.endpoint());

    let state = AppState::new(Arc::new(analysis), config);
    if let Some(idle_ttl) = state.config.workspace_idle_ttl {
        info!("Workspaces expire after {:?} without requests", idle_ttl);
        spawn_workspace_sweeper(state.clone(), idle_ttl);
    }

    Ok(build_router(state))
}

/// Remove workspaces (with their scans and chat sessions) that have had no
/// requests for `idle_ttl`. Returns how many were removed.
pub async fn expire_idle_workspaces(state: &AppState, idle_ttl: Duration) -> usize {
    let Ok(idle_ttl) = TimeDelta::from_std(idle_ttl) else {
        return 0;
    };
    let Some(cutoff) = Utc::now().checked_sub_signed(idle_ttl) else {
        return 0;
    };

    match state.workspaces.remove_idle(cutoff).await {
        Ok(expired) => {
            for id in &expired {
                info!("Expired idle workspace {}", id);
            }
            expired.len()
        }
        Err(e) => {
            error!("Failed to expire idle workspaces: {}", e);
            0
        }
    }
}

fn spawn_workspace_sweeper(state: AppState, idle_ttl: Duration) {
    let period = idle_ttl.min(Duration::from_secs(60)).max(Duration::from_secs(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            expire_idle_workspaces(&state, idle_ttl).await;
        }
    });
}

/// Middleware to add correlation ID to all requests
async fn correlation_id_middleware(
    mut request: Request<axum::body::Body>,
    next: Next,
) -> axum::response::Response {
    let correlation_id = Uuid::new_v4().to_string();

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        request.headers_mut().insert("x-correlation-id", value.clone());
        let span = tracing::info_span!("http_request", correlation_id = %correlation_id);
        let mut response = next.run(request).instrument(span).await;
        response.headers_mut().insert("x-correlation-id", value);
        return response;
    }

    next.run(request).await
}

pub fn build_router(app_state: AppState) -> Router {
    let body_limit = app_state.config.max_upload_bytes;

    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/workspaces", post(create_workspace))
        .route(
            "/workspaces/{workspace_id}",
            get(get_workspace).delete(delete_workspace),
        )
        .route(
            "/workspaces/{workspace_id}/scans",
            post(upload_scans).get(list_scans),
        )
        .route(
            "/workspaces/{workspace_id}/selection",
            put(select_scan).delete(deselect_scan),
        )
        .route(
            "/workspaces/{workspace_id}/selection/detail",
            get(selection_detail),
        )
        .route("/workspaces/{workspace_id}/chat", get(chat_state))
        .route("/workspaces/{workspace_id}/chat/open", post(open_chat))
        .route(
            "/workspaces/{workspace_id}/chat/floating",
            post(open_chat_floating),
        )
        .route("/workspaces/{workspace_id}/chat/close", post(close_chat))
        .route(
            "/workspaces/{workspace_id}/chat/messages",
            post(post_chat_message),
        )
        .route("/workspaces/{workspace_id}/report", post(request_report))
        .route("/workspaces/{workspace_id}/theme", put(set_theme))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(from_fn(correlation_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "MRI Insight",
        "version": "0.1.0",
        "description": "Upload MRI scans, review AI analysis results and chat about a scan",
        "endpoints": {
            "POST /workspaces": "Create a workspace for one browser session",
            "GET /workspaces/{workspace_id}": "Scans, selection, chat and analysis state",
            "POST /workspaces/{workspace_id}/scans": "Upload files (multipart, one `file` part per scan)",
            "PUT /workspaces/{workspace_id}/selection": "Select a scan for detail viewing",
            "GET /workspaces/{workspace_id}/selection/detail": "Detail view of the selected scan",
            "POST /workspaces/{workspace_id}/chat/floating": "Open chat, selecting the latest scan if needed",
            "POST /workspaces/{workspace_id}/chat/messages": "Ask a question about the chat's scan",
            "GET /health": "Health check"
        }
    }))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339()
    }))
}

async fn load_workspace(state: &AppState, workspace_id: &str) -> Result<Workspace, ApiError> {
    match state.workspaces.get(workspace_id).await {
        Ok(Some(workspace)) => {
            workspace.touch();
            Ok(workspace)
        }
        Ok(None) => Err(not_found_error("Workspace not found", workspace_id)),
        Err(e) => {
            error!("Failed to load workspace {}: {}", workspace_id, e);
            Err(internal_error("Failed to load workspace", &e.to_string()))
        }
    }
}

async fn describe_workspace(workspace: &Workspace) -> WorkspaceResponse {
    let coordinator = workspace.coordinator.lock().await;

    WorkspaceResponse {
        workspace_id: workspace.id.clone(),
        theme: workspace.preferences().await.theme,
        analyzing: workspace.controller.is_analyzing(),
        scans: workspace.store().snapshot().await,
        selected_scan_id: coordinator.selected_id().map(str::to_string),
        chat_open: coordinator.is_chat_open(),
    }
}

async fn create_workspace(
    State(state): State<AppState>,
    Json(request): Json<CreateWorkspaceRequest>,
) -> ApiResult<WorkspaceResponse> {
    let preferences = Preferences {
        theme: request.theme.unwrap_or(state.config.default_theme),
    };
    let workspace = Workspace::new(
        state.analysis.clone(),
        &state.config.workspace_limits(),
        preferences,
    );
    info!("Created workspace {}", workspace.id);

    state.workspaces.save(workspace.clone()).await.map_err(|e| {
        error!("Failed to create workspace: {}", e);
        internal_error("Failed to create workspace", &e.to_string())
    })?;

    Ok(Json(describe_workspace(&workspace).await))
}

async fn get_workspace(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
) -> ApiResult<WorkspaceResponse> {
    let workspace = load_workspace(&state, &workspace_id).await?;
    Ok(Json(describe_workspace(&workspace).await))
}

async fn delete_workspace(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
) -> ApiResult<Value> {
    load_workspace(&state, &workspace_id).await?;

    state
        .workspaces
        .delete(&workspace_id)
        .await
        .map_err(scan_error)?;
    info!("Deleted workspace {}", workspace_id);

    Ok(Json(json!({ "workspaceId": workspace_id, "status": "deleted" })))
}

async fn read_upload(mut multipart: Multipart) -> Result<Vec<FileBlob>, ApiError> {
    let mut files = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return Err(bad_request_error(&format!("Invalid upload: {}", e))),
        };
        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().unwrap_or("upload").to_string();
        let content_type = field.content_type().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| bad_request_error(&format!("Failed to read {}: {}", filename, e)))?;

        files.push(FileBlob::new(filename, content_type, bytes.to_vec()));
    }

    if files.is_empty() {
        return Err(bad_request_error("At least one `file` part is required"));
    }
    Ok(files)
}

async fn upload_scans(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    multipart: Multipart,
) -> ApiResult<BatchSummary> {
    let workspace = load_workspace(&state, &workspace_id).await?;
    let files = read_upload(multipart).await?;

    info!(
        "Received {} files for workspace {}",
        files.len(),
        workspace_id
    );

    // A dropped request must not cut the batch short.
    let controller = workspace.controller.clone();
    let batch = tokio::spawn(async move { controller.submit_batch(files).await });

    match batch.await {
        Ok(summary) => Ok(Json(summary)),
        Err(e) => {
            error!("Batch for workspace {} did not finish: {}", workspace_id, e);
            Err(internal_error("Batch did not finish", &e.to_string()))
        }
    }
}

async fn list_scans(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
) -> ApiResult<Value> {
    let workspace = load_workspace(&state, &workspace_id).await?;
    let scans = workspace.store().snapshot().await;

    Ok(Json(json!({
        "scans": scans,
        "analyzing": workspace.controller.is_analyzing()
    })))
}

async fn select_scan(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    Json(request): Json<SelectScanRequest>,
) -> ApiResult<Value> {
    let workspace = load_workspace(&state, &workspace_id).await?;

    workspace
        .coordinator
        .lock()
        .await
        .select(&request.scan_id)
        .map_err(scan_error)?;

    Ok(Json(json!({ "selectedScanId": request.scan_id })))
}

async fn deselect_scan(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
) -> ApiResult<Value> {
    let workspace = load_workspace(&state, &workspace_id).await?;
    workspace.coordinator.lock().await.deselect();

    Ok(Json(json!({ "selectedScanId": null })))
}

async fn selection_detail(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
) -> ApiResult<scan_flow::DetailView> {
    let workspace = load_workspace(&state, &workspace_id).await?;
    let view = workspace.coordinator.lock().await.detail_view().await;

    Ok(Json(view))
}

async fn chat_response(
    workspace: &Workspace,
    open: bool,
    target: Option<scan_flow::ChatTarget>,
) -> ApiResult<ChatStateResponse> {
    let session = match &target {
        Some(target) => Some(
            chat::open_for_scan(workspace.chats.as_ref(), &target.scan_id)
                .await
                .map_err(scan_error)?,
        ),
        None => None,
    };

    Ok(Json(ChatStateResponse {
        open,
        target,
        session,
    }))
}

async fn open_chat(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
) -> ApiResult<ChatStateResponse> {
    let workspace = load_workspace(&state, &workspace_id).await?;
    let target = workspace
        .coordinator
        .lock()
        .await
        .open_chat()
        .await
        .map_err(scan_error)?;

    chat_response(&workspace, true, Some(target)).await
}

async fn open_chat_floating(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
) -> ApiResult<ChatStateResponse> {
    let workspace = load_workspace(&state, &workspace_id).await?;
    let target = workspace.coordinator.lock().await.open_chat_floating().await;

    chat_response(&workspace, true, target).await
}

async fn close_chat(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
) -> ApiResult<Value> {
    let workspace = load_workspace(&state, &workspace_id).await?;
    workspace.coordinator.lock().await.close_chat();

    Ok(Json(json!({ "open": false })))
}

async fn chat_state(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
) -> ApiResult<ChatStateResponse> {
    let workspace = load_workspace(&state, &workspace_id).await?;
    let coordinator = workspace.coordinator.lock().await;
    let open = coordinator.is_chat_open();

    let target = coordinator.selected_scan().await.map(|scan| scan_flow::ChatTarget {
        scan_id: scan.id,
        filename: scan.filename,
    });
    let session = match &target {
        Some(target) => workspace
            .chats
            .get_by_scan(&target.scan_id)
            .await
            .map_err(scan_error)?,
        None => None,
    };

    Ok(Json(ChatStateResponse {
        open,
        target,
        session,
    }))
}

async fn post_chat_message(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    Json(request): Json<ChatMessageRequest>,
) -> ApiResult<ChatStateResponse> {
    if request.content.trim().is_empty() {
        return Err(bad_request_error("Message cannot be empty"));
    }

    let workspace = load_workspace(&state, &workspace_id).await?;
    let coordinator = workspace.coordinator.lock().await;
    if !coordinator.is_chat_open() {
        return Err(conflict_error("Chat is not open"));
    }
    let scan = coordinator
        .selected_scan()
        .await
        .ok_or_else(|| conflict_error("Chat has no scan context"))?;

    chat::open_for_scan(workspace.chats.as_ref(), &scan.id)
        .await
        .map_err(scan_error)?;
    let session = chat::post_user_message(workspace.chats.as_ref(), &scan.id, &request.content)
        .await
        .map_err(scan_error)?;
    info!("Chat message recorded for scan {}", scan.id);

    Ok(Json(ChatStateResponse {
        open: true,
        target: Some(scan_flow::ChatTarget {
            scan_id: scan.id,
            filename: scan.filename,
        }),
        session: Some(session),
    }))
}

async fn request_report(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
) -> ApiResult<Value> {
    let workspace = load_workspace(&state, &workspace_id).await?;
    let notice = workspace.coordinator.lock().await.request_report().await;

    match notice {
        Some(notice) => Ok(Json(json!(notice))),
        None => Err(conflict_error("No scan is selected")),
    }
}

async fn set_theme(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    Json(request): Json<ThemeRequest>,
) -> ApiResult<Value> {
    let workspace = load_workspace(&state, &workspace_id).await?;
    workspace.set_theme(request.theme).await;

    Ok(Json(json!({ "theme": request.theme })))
}
