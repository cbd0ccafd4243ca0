use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::Method,
    routing::{get, post},
};
use parking_lot::RwLock;
use serde::Serialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    backend::BackendDescriptor,
    error::ServiceError,
    rewriter::{GenerationConfig, QueryRewriter, RewriteRequest, RewriteResult},
};

#[derive(Clone)]
pub struct AppState {
    pub rewriter: Arc<QueryRewriter>,
    pub stats: Arc<RwLock<RewriteStats>>,
}

/// Rolling request statistics surfaced at /metadata.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RewriteStats {
    pub requests: u64,
    pub last_elapsed_ms: Option<f64>,
    pub avg_elapsed_ms: Option<f64>,
}

impl RewriteStats {
    fn record(&mut self, elapsed_ms: f64) {
        self.requests += 1;
        self.last_elapsed_ms = Some(elapsed_ms);
        let avg = self.avg_elapsed_ms.unwrap_or(0.0);
        self.avg_elapsed_ms = Some(avg + (elapsed_ms - avg) / self.requests as f64);
    }
}

#[derive(Serialize)]
struct MetadataResponse {
    backend: BackendDescriptor,
    generation: GenerationConfig,
    stats: RewriteStats,
}

pub fn build_router(rewriter: Arc<QueryRewriter>) -> Router {
    let state = AppState {
        stats: Arc::new(RwLock::new(RewriteStats::default())),
        rewriter,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/rewrite", post(rewrite))
        .route("/metadata", get(metadata))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

async fn rewrite(
    State(state): State<AppState>,
    Json(request): Json<RewriteRequest>,
) -> Result<Json<RewriteResult>, ServiceError> {
    if request.question.trim().is_empty() {
        return Err(ServiceError::BadRequest("question must not be empty".into()));
    }
    if !(request.desired_max_latency.is_finite() && request.desired_max_latency > 0.0) {
        return Err(ServiceError::BadRequest(
            "desired_max_latency must be a positive number of milliseconds".into(),
        ));
    }

    let result = state
        .rewriter
        .rewrite(&request.question, request.desired_max_latency)
        .await?;

    info!(
        queries = result.queries.len(),
        elapsed_ms = result.elapsed_time,
        "rewrite served"
    );
    state.stats.write().record(result.elapsed_time);

    Ok(Json(result))
}

async fn metadata(State(state): State<AppState>) -> Json<MetadataResponse> {
    Json(MetadataResponse {
        backend: state.rewriter.backend().descriptor(),
        generation: state.rewriter.generation().clone(),
        stats: state.stats.read().clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{ScriptedBackend, ScriptedEvent};

    fn test_state(backend: ScriptedBackend) -> AppState {
        let rewriter = Arc::new(QueryRewriter::new(
            Arc::new(backend),
            GenerationConfig::default(),
        ));
        AppState {
            rewriter,
            stats: Arc::new(RwLock::new(RewriteStats::default())),
        }
    }

    #[tokio::test]
    async fn rewrite_rejects_empty_question() {
        let state = test_state(ScriptedBackend::new(Vec::new()));
        let request = RewriteRequest {
            question: "   ".into(),
            desired_max_latency: 100.0,
        };
        let err = rewrite(State(state), Json(request)).await.unwrap_err();
        assert!(matches!(err, ServiceError::BadRequest(_)));
    }

    #[tokio::test]
    async fn rewrite_rejects_nonpositive_latency() {
        let state = test_state(ScriptedBackend::new(Vec::new()));
        let request = RewriteRequest {
            question: "valid question".into(),
            desired_max_latency: 0.0,
        };
        let err = rewrite(State(state), Json(request)).await.unwrap_err();
        assert!(matches!(err, ServiceError::BadRequest(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn rewrite_round_trip_records_stats() {
        let state = test_state(ScriptedBackend::new(vec![
            ScriptedEvent::delta(1, "Fast query reformulation techniques\n"),
            ScriptedEvent::delta(1, "Query expansion methods\n"),
        ]));
        let request = RewriteRequest {
            question: "What are some ways to do fast query reformulation".into(),
            desired_max_latency: 100.0,
        };

        let Json(result) = rewrite(State(state.clone()), Json(request)).await.unwrap();
        assert_eq!(result.queries.len(), 2);
        assert!(result.queries.iter().all(|q| !q.is_empty()));
        assert!(result.elapsed_time >= 0.0);
        assert!(result.elapsed_time < 150.0);

        let stats = state.stats.read().clone();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.last_elapsed_ms, Some(result.elapsed_time));
    }

    #[tokio::test]
    async fn metadata_reports_backend_and_generation() {
        let state = test_state(ScriptedBackend::new(Vec::new()));
        let Json(meta) = metadata(State(state)).await;
        assert_eq!(meta.backend.kind, "scripted");
        assert_eq!(meta.generation.base_max_tokens, 20);
        assert_eq!(meta.stats.requests, 0);
    }

    #[test]
    fn request_deserializes_with_default_latency() {
        let request: RewriteRequest =
            serde_json::from_str(r#"{"question": "what is rust"}"#).unwrap();
        assert_eq!(request.desired_max_latency, 100.0);
    }
}
