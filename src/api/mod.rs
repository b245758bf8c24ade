//! HTTP and WebSocket surface: paginated queries over the store, the
//! server-push event stream, and the embedded dashboard fallback.

mod ws;

pub use ws::Broadcaster;

use std::sync::Arc;

use axum::extract::ws::WebSocket;
use axum::extract::{Path, Query, Request, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::store::{
    Alert, Container, ContainerState, Event, HealthStatus, Healthcheck, Role, Store, StoreError,
};

const INDEX_HTML: &str = include_str!("../../web/index.html");

pub struct Server {
    store: Arc<Store>,
    broadcaster: Arc<Broadcaster>,
    allowed_origins: Vec<String>,
    token: CancellationToken,
}

impl Server {
    pub fn new(
        store: Arc<Store>,
        broadcaster: Arc<Broadcaster>,
        allowed_origins: Vec<String>,
        token: CancellationToken,
    ) -> Self {
        Self {
            store,
            broadcaster,
            allowed_origins,
            token,
        }
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/api/containers", get(list_containers))
            .route("/api/containers/:name/events", get(list_container_events))
            .route("/api/events", get(list_events))
            .route("/api/alerts", get(list_alerts))
            .route("/api/events/stream", get(event_stream))
            .fallback(get(spa_fallback))
            .layer(middleware::from_fn(log_requests))
            .with_state(self)
    }

    /// Serialize the update record once and hand it to the broadcaster.
    pub async fn broadcast(&self, update: EventUpdate) {
        let payload = match serde_json::to_string(&update) {
            Ok(payload) => payload,
            Err(err) => {
                log::error!("update serialize failed: {}", err);
                return;
            }
        };
        self.broadcaster.broadcast(payload).await;
    }

    async fn handle_socket(&self, socket: WebSocket) {
        let (sink, mut inbound) = socket.split();
        let id = self.broadcaster.add(sink).await;
        log::info!("ws connect: subscriber {}", id);

        // Server-push only: inbound frames drain and are ignored; a read
        // error means the peer is gone.
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                frame = inbound.next() => match frame {
                    Some(Ok(_)) => continue,
                    _ => break,
                },
            }
        }

        self.broadcaster.remove(id).await;
        log::info!("ws disconnect: subscriber {}", id);
    }

    fn origin_allowed(&self, headers: &HeaderMap) -> bool {
        let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
            // Non-browser clients send no origin.
            return true;
        };
        let origin_host = origin
            .strip_prefix("https://")
            .or_else(|| origin.strip_prefix("http://"))
            .unwrap_or(origin);
        if self.allowed_origins.is_empty() {
            return headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(|host| origin_host == host)
                .unwrap_or(false);
        }
        self.allowed_origins
            .iter()
            .any(|pattern| pattern == "*" || pattern == origin || pattern == origin_host)
    }
}

#[derive(Debug, Deserialize, Default)]
struct PageQuery {
    #[serde(default)]
    before_id: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

async fn list_containers(State(server): State<Arc<Server>>) -> Json<Vec<ContainerResponse>> {
    let items = server.store.list_containers();
    Json(items.iter().map(ContainerResponse::from).collect())
}

async fn list_container_events(
    State(server): State<Arc<Server>>,
    Path(name): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<EventListResponse>, ApiError> {
    let items = server.store.list_events(
        &name,
        page.before_id.unwrap_or(0),
        page.limit.unwrap_or(0),
    )?;
    let total = server.store.count_events_by_container(&name)?;
    Ok(Json(EventListResponse {
        items: items.iter().map(EventResponse::from).collect(),
        total,
    }))
}

async fn list_events(
    State(server): State<Arc<Server>>,
    Query(page): Query<PageQuery>,
) -> Result<Json<EventListResponse>, ApiError> {
    let items = server
        .store
        .list_all_events(page.before_id.unwrap_or(0), page.limit.unwrap_or(0))?;
    let total = server.store.count_all_events()?;
    Ok(Json(EventListResponse {
        items: items.iter().map(EventResponse::from).collect(),
        total,
    }))
}

async fn list_alerts(
    State(server): State<Arc<Server>>,
    Query(page): Query<PageQuery>,
) -> Result<Json<AlertListResponse>, ApiError> {
    let items = server
        .store
        .list_all_alerts(page.before_id.unwrap_or(0), page.limit.unwrap_or(0))?;
    let total = server.store.count_all_alerts()?;
    Ok(Json(AlertListResponse {
        items: items.iter().map(AlertResponse::from).collect(),
        total,
    }))
}

async fn event_stream(
    State(server): State<Arc<Server>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !server.origin_allowed(&headers) {
        return ApiError(StatusCode::FORBIDDEN, "origin not allowed".to_string()).into_response();
    }
    ws.on_upgrade(move |socket| async move { server.handle_socket(socket).await })
}

/// Any non-API path serves the embedded single-page UI.
async fn spa_fallback(uri: Uri) -> Response {
    if uri.path().starts_with("/api/") {
        return ApiError(StatusCode::NOT_FOUND, "not found".to_string()).into_response();
    }
    Html(INDEX_HTML).into_response()
}

async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = std::time::Instant::now();
    let response = next.run(req).await;
    log::info!(
        "http {} {} {} {:?}",
        method,
        path,
        response.status().as_u16(),
        start.elapsed()
    );
    response
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ContainerResponse {
    pub id: i64,
    pub name: String,
    pub container_id: String,
    pub image: String,
    pub image_tag: String,
    pub image_id: String,
    pub created_at: Option<String>,
    pub registered_at: Option<String>,
    pub started_at: Option<String>,
    pub status: ContainerState,
    pub role: Role,
    pub caps: Vec<String>,
    pub read_only: bool,
    pub no_new_privileges: bool,
    pub user: String,
    pub present: bool,
    pub health_status: HealthStatus,
    pub health_failing_streak: i64,
    pub unhealthy_since: Option<String>,
    pub restart_loop: bool,
    pub restart_streak: i64,
    pub restart_loop_since: Option<String>,
    pub healthcheck: Option<Healthcheck>,
}

impl From<&Container> for ContainerResponse {
    fn from(c: &Container) -> Self {
        Self {
            id: c.id,
            name: c.name.clone(),
            container_id: c.container_id.clone(),
            image: c.image.clone(),
            image_tag: c.image_tag.clone(),
            image_id: c.image_id.clone(),
            created_at: format_api_time(c.created_at),
            registered_at: format_api_time(c.registered_at),
            started_at: format_api_time(c.started_at),
            status: c.status,
            role: c.role,
            caps: c.caps.clone(),
            read_only: c.read_only,
            no_new_privileges: c.no_new_privileges,
            user: c.user.clone(),
            present: c.present,
            health_status: c.health_status,
            health_failing_streak: c.health_failing_streak,
            unhealthy_since: format_api_time(c.unhealthy_since),
            restart_loop: c.restart_loop,
            restart_streak: c.restart_streak,
            restart_loop_since: format_api_time(c.restart_loop_since),
            healthcheck: c.healthcheck.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventResponse {
    pub id: i64,
    pub container_pk: i64,
    pub container: String,
    pub container_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub severity: crate::store::Severity,
    pub message: String,
    pub timestamp: String,
    pub old_image: Option<String>,
    pub new_image: Option<String>,
    pub old_image_id: Option<String>,
    pub new_image_id: Option<String>,
    pub reason: String,
    pub details: Option<String>,
    pub exit_code: Option<i64>,
}

impl From<&Event> for EventResponse {
    fn from(e: &Event) -> Self {
        Self {
            id: e.id,
            container_pk: e.container_pk,
            container: e.container.clone(),
            container_id: e.container_id.clone(),
            event_type: e.event_type.clone(),
            severity: e.severity,
            message: e.message.clone(),
            timestamp: format_api_ts(e.timestamp),
            old_image: e.old_image.clone(),
            new_image: e.new_image.clone(),
            old_image_id: e.old_image_id.clone(),
            new_image_id: e.new_image_id.clone(),
            reason: e.reason.clone(),
            details: e.details.clone(),
            exit_code: e.exit_code,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertResponse {
    pub id: i64,
    pub container_pk: i64,
    pub container: String,
    pub container_id: String,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub severity: crate::store::Severity,
    pub message: String,
    pub timestamp: String,
    pub old_image: Option<String>,
    pub new_image: Option<String>,
    pub old_image_id: Option<String>,
    pub new_image_id: Option<String>,
    pub reason: String,
    pub details: Option<String>,
    pub exit_code: Option<i64>,
}

impl From<&Alert> for AlertResponse {
    fn from(a: &Alert) -> Self {
        Self {
            id: a.id,
            container_pk: a.container_pk,
            container: a.container.clone(),
            container_id: a.container_id.clone(),
            alert_type: a.alert_type.clone(),
            severity: a.severity,
            message: a.message.clone(),
            timestamp: format_api_ts(a.timestamp),
            old_image: a.old_image.clone(),
            new_image: a.new_image.clone(),
            old_image_id: a.old_image_id.clone(),
            new_image_id: a.new_image_id.clone(),
            reason: a.reason.clone(),
            details: a.details.clone(),
            exit_code: a.exit_code,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EventListResponse {
    pub items: Vec<EventResponse>,
    pub total: i64,
}

#[derive(Debug, Serialize)]
pub struct AlertListResponse {
    pub items: Vec<AlertResponse>,
    pub total: i64,
}

/// One differential update pushed to subscribers: the full container
/// snapshot plus at most one of `event` / `alert`, and badge totals when
/// the counts were available.
#[derive(Debug, Serialize)]
pub struct EventUpdate {
    pub container: ContainerResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<EventResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<AlertResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_event_total: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_total: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_total: Option<i64>,
}

fn format_api_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn format_api_time(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(format_api_ts)
}
