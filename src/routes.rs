// HTTP handlers for the relay

use crate::config::{ModelSource, RelayConfig};
use crate::error::Result;
use crate::models::{ModelCatalog, ModelInfo, OllamaCli, OllamaTags};
use crate::ollama_api::OllamaClient;
use crate::relay::{GenerationRecord, GenerationRelay};
use crate::session::SessionRegistry;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    relay: Arc<GenerationRelay>,
    catalog: Arc<dyn ModelCatalog>,
    default_model: Arc<str>,
    default_system_model: Arc<str>,
}

impl AppState {
    pub fn new(
        relay: GenerationRelay,
        catalog: Arc<dyn ModelCatalog>,
        default_model: &str,
        default_system_model: &str,
    ) -> Self {
        Self {
            relay: Arc::new(relay),
            catalog,
            default_model: default_model.into(),
            default_system_model: default_system_model.into(),
        }
    }

    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let backend = OllamaClient::new(config.backend_url.clone(), config.connect_timeout)?;
        let catalog: Arc<dyn ModelCatalog> = match config.model_source {
            ModelSource::Cli => Arc::new(OllamaCli::new(config.ollama_bin.clone())),
            ModelSource::Api => Arc::new(OllamaTags::new(backend.clone())),
        };
        let relay = GenerationRelay::new(
            Arc::new(SessionRegistry::new()),
            backend,
            config.fragment_buffer,
            config.generation_timeout,
        );

        Ok(Self::new(
            relay,
            catalog,
            &config.default_model,
            &config.default_system_model,
        ))
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        self.relay.registry()
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AskRequest {
    pub prompt: String,
    pub session_id: String,
    pub model: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AskWithSystemRequest {
    pub prompt: String,
    pub session_id: String,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    pub session_id: String,
}

#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct StopResponse {
    pub stopped: bool,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_sessions: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ask", post(ask))
        .route("/ask2", post(ask_with_system))
        .route("/stop", post(stop))
        .route("/models", get(list_models))
        .route("/models/detailed", get(list_models_detailed))
        .route("/health", get(health))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn ask(State(state): State<AppState>, Json(request): Json<AskRequest>) -> Result<Response> {
    let model = request
        .model
        .unwrap_or_else(|| state.default_model.to_string());
    let record = GenerationRecord::new(request.session_id, request.prompt, model);

    stream_generation(&state, record).await
}

async fn ask_with_system(
    State(state): State<AppState>,
    Json(request): Json<AskWithSystemRequest>,
) -> Result<Response> {
    let model = request
        .model
        .unwrap_or_else(|| state.default_system_model.to_string());
    let record = GenerationRecord::new(request.session_id, request.prompt, model)
        .with_system_prompt(request.system_prompt);

    stream_generation(&state, record).await
}

async fn stream_generation(state: &AppState, record: GenerationRecord) -> Result<Response> {
    let body = state.relay.run(record).await?;
    Ok(([(CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
}

// Signals the generation and returns without waiting for it to unwind
async fn stop(State(state): State<AppState>, Json(request): Json<StopRequest>) -> Json<StopResponse> {
    let stopped = state.registry().cancel(&request.session_id);
    tracing::info!(session_id = %request.session_id, stopped, "stop requested");
    Json(StopResponse { stopped })
}

async fn list_models(State(state): State<AppState>) -> Result<Json<Vec<String>>> {
    Ok(Json(state.catalog.list_model_names().await?))
}

async fn list_models_detailed(State(state): State<AppState>) -> Result<Json<Vec<ModelInfo>>> {
    Ok(Json(state.catalog.list_models_detailed().await?))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_sessions: state.registry().len(),
    })
}
