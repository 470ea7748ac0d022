//! Player-facing HTTP API
//!
//! - `POST /player` joins the queue, or reports the match of a known player
//! - `GET /player/{player_id}` reports a player's match without joining
//! - `POST /end-match` releases a match's server and deletes the match
//! - `GET /matches` lists all current matches

use crate::error::{as_matchmaking_error, MatchmakingError};
use crate::matchmaking::MatchmakingEngine;
use crate::types::{EndMatchRequest, JoinRequest, MatchInfo};
use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Error returned by API handlers, rendered as `{"error": "..."}`
#[derive(Debug)]
pub struct ApiError(anyhow::Error);

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        Self(error)
    }
}

/// HTTP status for a matchmaking error kind
pub fn status_for(error: &MatchmakingError) -> StatusCode {
    match error {
        MatchmakingError::BadRequest { .. } | MatchmakingError::UnknownMatch { .. } => {
            StatusCode::BAD_REQUEST
        }
        MatchmakingError::PlayerNotFound { .. } => StatusCode::NOT_FOUND,
        // Provider failures only ever reach a request through end-match,
        // where they surface as DeallocationFailed.
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = as_matchmaking_error(&self.0)
            .map(status_for)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            error!("Request failed: {:#}", self.0);
        } else {
            debug!("Request rejected: {}", self.0);
        }

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Build the API router around `engine`
pub fn router(engine: MatchmakingEngine) -> Router {
    Router::new()
        .route("/player", post(join_handler))
        .route("/player/{player_id}", get(lookup_handler))
        .route("/end-match", post(end_match_handler))
        .route("/matches", get(matches_handler))
        .with_state(engine)
}

async fn join_handler(
    State(engine): State<MatchmakingEngine>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(mut request): Json<JoinRequest>,
) -> Result<Json<MatchInfo>, ApiError> {
    if request.source_address.is_none() {
        request.source_address = Some(peer.to_string());
    }

    Ok(Json(engine.join(request)?))
}

async fn lookup_handler(
    State(engine): State<MatchmakingEngine>,
    Path(player_id): Path<String>,
) -> Result<Json<MatchInfo>, ApiError> {
    Ok(Json(engine.lookup_player(&player_id)?))
}

async fn end_match_handler(
    State(engine): State<MatchmakingEngine>,
    Json(request): Json<EndMatchRequest>,
) -> Result<Json<Vec<MatchInfo>>, ApiError> {
    if request.allocation_id.is_empty() {
        return Err(anyhow::Error::from(MatchmakingError::BadRequest {
            reason: "missing allocation id".to_string(),
        })
        .into());
    }

    Ok(Json(engine.end_match(&request.allocation_id).await?))
}

async fn matches_handler(
    State(engine): State<MatchmakingEngine>,
) -> Result<Json<Vec<MatchInfo>>, ApiError> {
    Ok(Json(engine.all_matches()?))
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 10855,
        }
    }
}

/// Serves the player API until stopped
pub struct ApiServer {
    config: ApiServerConfig,
    engine: MatchmakingEngine,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, engine: MatchmakingEngine) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            engine,
            shutdown_tx,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .context("Invalid API server address")?;

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind API server to {}", addr))?;
        info!("Matchmaking API listening on http://{}", addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let app = router(self.engine.clone());

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("API server shutdown signal received");
        })
        .await?;

        info!("API server stopped");
        Ok(())
    }

    pub fn stop(&self) {
        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("Failed to send shutdown signal to API server: {}", e);
        }
    }
}
