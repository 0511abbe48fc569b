//! Loopback HTTP surface over the exchange store.
//!
//! Serves the embedded dashboard, the exchange listing API, and replay.
//! Replay reconstructs the captured request against the local service; note
//! that bodies larger than the 1 MiB capture limit were stored truncated, so
//! replaying such an exchange sends the truncated copy.

use crate::store::{Exchange, ExchangeStore};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use portico_common::constants::REPLAY_TIMEOUT;
use portico_common::{InspectorConfig, Result, TunnelError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

const INDEX_HTML: &str = include_str!("index.html");

#[derive(Clone)]
struct AppState {
    store: Arc<ExchangeStore>,
    local_port: Option<u16>,
    client: reqwest::Client,
}

/// Inspector web server bound to loopback.
pub struct InspectorServer {
    store: Arc<ExchangeStore>,
    config: InspectorConfig,
    local_port: Option<u16>,
}

impl InspectorServer {
    pub fn new(store: Arc<ExchangeStore>, config: InspectorConfig) -> Self {
        Self {
            store,
            config,
            local_port: None,
        }
    }

    /// Target port for replayed requests. Without it replay answers 500.
    #[must_use]
    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            store: self.store.clone(),
            local_port: self.local_port,
            client: reqwest::Client::builder()
                .timeout(REPLAY_TIMEOUT)
                .build()
                .unwrap_or_default(),
        };

        Router::new()
            .route("/", get(index_handler))
            .route("/api/exchanges", get(list_handler))
            .route("/api/exchanges/:id", get(get_handler))
            .route("/api/exchanges/replay/:id", post(replay_handler))
            .route("/api/replay/:id", post(replay_handler))
            .with_state(state)
    }

    /// Bind and serve until the process exits.
    pub async fn serve(self) -> Result<()> {
        let addr = format!("127.0.0.1:{}", self.config.port);
        let router = self.router();
        let listener = TcpListener::bind(&addr).await?;
        info!("inspector listening on http://{addr}");
        axum::serve(listener, router)
            .await
            .map_err(|e| TunnelError::Io(e.into()))?;
        Ok(())
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn list_handler(State(state): State<AppState>) -> Json<Vec<Exchange>> {
    Json(state.store.list())
}

async fn get_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(id) = id.parse::<i64>() else {
        return (StatusCode::BAD_REQUEST, "Invalid ID").into_response();
    };
    match state.store.get(id) {
        Some(exchange) => Json(exchange).into_response(),
        None => (StatusCode::NOT_FOUND, "Not found").into_response(),
    }
}

async fn replay_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(id) = id.parse::<i64>() else {
        return (StatusCode::BAD_REQUEST, "Invalid ID").into_response();
    };
    let Some(exchange) = state.store.get(id) else {
        return (StatusCode::NOT_FOUND, "Exchange not found").into_response();
    };
    let Some(request) = exchange.request else {
        return (StatusCode::NOT_FOUND, "Exchange has no request").into_response();
    };
    let Some(local_port) = state.local_port else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Replay not configured (no local port)",
        )
            .into_response();
    };

    let url = format!("http://localhost:{}{}", local_port, request.url);
    let Ok(method) = reqwest::Method::from_bytes(request.method.as_bytes()) else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Invalid captured method").into_response();
    };

    let mut builder = state.client.request(method, &url);
    for (name, values) in &request.headers {
        for value in values {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }

    // Bodies beyond the capture limit were stored truncated; the replayed
    // request carries the truncated copy.
    let upstream = match builder.body(request.body.clone()).send().await {
        Ok(resp) => resp,
        Err(err) => {
            return (StatusCode::BAD_GATEWAY, format!("Replay failed: {err}")).into_response();
        }
    };

    let status = upstream.status().as_u16();
    let mut headers: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in upstream.headers() {
        headers
            .entry(name.as_str().to_string())
            .or_default()
            .push(value.to_str().unwrap_or_default().to_string());
    }
    let body = match upstream.text().await {
        Ok(body) => body,
        Err(err) => {
            return (StatusCode::BAD_GATEWAY, format!("Replay failed: {err}")).into_response();
        }
    };

    Json(serde_json::json!({
        "status": status,
        "headers": headers,
        "body": body,
    }))
    .into_response()
}
