//! HTTP ingress.
//!
//! The single endpoint that matters to the lifecycle core is `GET /session`:
//! it sends a [`ClientRequest`] into the dispatcher and waits for the
//! response under a deadline. Everything else (landing page, healthcheck,
//! metrics exposition) is presentation.

pub mod pages;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::error::RequestError;
use crate::manager::ClientRequest;
use crate::metrics::{PoolGauges, PrometheusObserver, SessionObserver};
use crate::session::Session;

/// Deadline for the dispatcher to accept a request and respond. Must stay
/// below the HTTP server's write timeout, otherwise the connection is closed
/// before the error page can be sent and the client just retries.
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(8);

/// Client handle used by HTTP handlers to request sessions from the
/// dispatcher.
#[derive(Clone)]
pub struct SessionClient {
    request_tx: mpsc::Sender<ClientRequest>,
    deadline: Duration,
}

impl SessionClient {
    pub fn new(request_tx: mpsc::Sender<ClientRequest>, deadline: Duration) -> Self {
        Self {
            request_tx,
            deadline,
        }
    }

    /// Request a session for `client_ip`. The deadline covers both getting
    /// the request accepted by the dispatcher and receiving its response.
    pub async fn request(&self, client_ip: IpAddr) -> Result<Session, RequestError> {
        let (respond_to, response_rx) = oneshot::channel();
        let request = ClientRequest {
            client_ip,
            respond_to,
        };

        tokio::time::timeout(self.deadline, async {
            self.request_tx
                .send(request)
                .await
                .map_err(|_| RequestError::Closed)?;
            match response_rx.await {
                Ok(result) => result,
                Err(_) => Err(RequestError::Closed),
            }
        })
        .await
        .unwrap_or(Err(RequestError::Timeout))
    }
}

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionClient,
    pub page_ctx: pages::PageContext,
    pub observer: Arc<dyn SessionObserver>,
    /// Pool counters reported by the healthcheck.
    pub pool_gauges: Arc<PoolGauges>,
    /// Present unless instrumentation is disabled.
    pub prometheus: Option<Arc<PrometheusObserver>>,
    pub started_at: Instant,
}

/// JSON body returned from `GET /session` for API clients.
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub username: String,
    pub password: String,
    pub ssh_port: String,
    pub outbound_ip: String,
    pub lifetime_minutes: u64,
}

/// Build the router with every middleware layer applied.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/session", get(session))
        .route("/healthcheck", get(healthcheck))
        .route("/metrics", get(metrics))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            track_requests,
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("deny"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-xss-protection"),
            HeaderValue::from_static("1; mode=block"),
        ))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Record status, resource and duration of every response.
async fn track_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let start = Instant::now();
    let resource = request.uri().path().to_string();

    let response = next.run(request).await;

    state.observer.http_request(
        response.status().as_u16(),
        &resource,
        start.elapsed().as_secs_f64(),
    );
    response
}

async fn index(State(state): State<AppState>) -> Html<String> {
    Html(pages::index(&state.page_ctx))
}

async fn session(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    match state.sessions.request(addr.ip()).await {
        Ok(session) => {
            tracing::info!(session = %session.name, client = %addr, "session delivered");
            if wants_json(&headers) {
                Json(SessionResponse {
                    username: session.username,
                    password: session.password,
                    ssh_port: state.page_ctx.ssh_port.clone(),
                    outbound_ip: state.page_ctx.outbound_ip.clone(),
                    lifetime_minutes: state.page_ctx.lifetime_minutes,
                })
                .into_response()
            } else {
                Html(pages::session(
                    &state.page_ctx,
                    &session.username,
                    &session.password,
                ))
                .into_response()
            }
        }
        Err(RequestError::TooSoon) => {
            tracing::info!(client = %addr, "request throttled");
            (
                StatusCode::TOO_MANY_REQUESTS,
                Html(pages::throttled(&state.page_ctx)),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, client = %addr, "unable to deliver a session");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn healthcheck(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "available_sessions": state.pool_gauges.available(),
        "active_sessions": state.pool_gauges.active(),
    }))
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.prometheus.as_deref().map(PrometheusObserver::encode_text) {
        Some(Ok(text)) => text.into_response(),
        Some(Err(e)) => {
            tracing::error!(error = %e, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"))
}

/// The IP this host uses for outbound traffic, rendered into the SSH
/// connection instructions. Connecting a UDP socket sends no packets; it
/// only selects the route.
pub fn outbound_ip() -> std::io::Result<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    Ok(socket.local_addr()?.ip())
}
