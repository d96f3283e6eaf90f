//! HTTP endpoints of the bot: the Telegram webhook, the manual trigger of
//! the control loop and the health check

use crate::prelude::*;
use crate::schedule::ControlLoop;
use crate::tg::{InboundHandler, WebhookUpdate};
use crate::{Error, Result};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

const SECRET_TOKEN_HEADER: &str = "X-Telegram-Bot-Api-Secret-Token";

#[derive(Deserialize)]
pub(crate) struct Config {
    #[serde(default = "default_listen_addr")]
    pub(crate) listen_addr: SocketAddr,

    /// Enables the `/trigger` endpoint when set
    pub(crate) trigger_token: Option<String>,
}

fn default_listen_addr() -> SocketAddr {
    ([0, 0, 0, 0], 3000).into()
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) inbound: Arc<InboundHandler>,
    pub(crate) control_loop: Arc<ControlLoop>,
    pub(crate) webhook_secret: Option<String>,
    pub(crate) trigger_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InvocationResponse {
    status_code: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    error_id: Option<String>,
}

impl InvocationResponse {
    fn new(status: StatusCode) -> Self {
        Self {
            status_code: status.as_u16(),
            error_id: None,
        }
    }
}

enum ApiError {
    Unauthorized,
    Internal(Error),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Unauthorized => {
                let status = StatusCode::UNAUTHORIZED;
                (status, Json(InvocationResponse::new(status))).into_response()
            }
            Self::Internal(err) => {
                error!(err = tracing_err(&err), "Request handler failed");

                let status = StatusCode::INTERNAL_SERVER_ERROR;
                let body = InvocationResponse {
                    error_id: Some(err.id().to_owned()),
                    ..InvocationResponse::new(status)
                };
                (status, Json(body)).into_response()
            }
        }
    }
}

pub(crate) fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/webhook", post(webhook))
        .route("/health", get(health));

    if state.trigger_token.is_some() {
        router = router.route("/trigger", post(trigger));
    }

    router.with_state(state)
}

pub(crate) async fn serve(cfg: Config, state: AppState) -> Result {
    let listener = tokio::net::TcpListener::bind(cfg.listen_addr).await?;

    info!(listen_addr = %cfg.listen_addr, "Listening for HTTP requests");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(
            err = tracing_err(&err),
            "Failed to listen for the shutdown signal"
        );
        std::future::pending::<()>().await;
    }
    info!("Received the shutdown signal");
}

fn header_value<'h>(headers: &'h HeaderMap, name: impl header::AsHeaderName) -> Option<&'h str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<WebhookUpdate>,
) -> Result<Json<InvocationResponse>, ApiError> {
    if let Some(secret) = &state.webhook_secret {
        if header_value(&headers, SECRET_TOKEN_HEADER) != Some(secret.as_str()) {
            warn!("Rejecting a webhook request with an invalid secret token");
            return Err(ApiError::Unauthorized);
        }
    }

    state.inbound.handle(update).await?;

    Ok(Json(InvocationResponse::new(StatusCode::OK)))
}

async fn trigger(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<InvocationResponse>, ApiError> {
    let Some(token) = &state.trigger_token else {
        return Err(ApiError::Unauthorized);
    };

    let expected = format!("Bearer {token}");

    if header_value(&headers, header::AUTHORIZATION) != Some(expected.as_str()) {
        warn!("Rejecting a trigger request with an invalid bearer token");
        return Err(ApiError::Unauthorized);
    }

    info!("Running the control loop by a manual trigger");

    state.control_loop.run_once().await?.log();

    Ok(Json(InvocationResponse::new(StatusCode::OK)))
}

async fn health() -> &'static str {
    "ok"
}
