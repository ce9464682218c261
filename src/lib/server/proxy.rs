use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::Utc;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::{ApiError, AppState};
use crate::admission::AdmitError;
use crate::capture::{Capture, CaptureMeta, CaptureTask};
use crate::db::StoreError;
use crate::proxy::{dial, relay};
use crate::types::Instance;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

fn unknown() -> ApiError {
    ApiError::NotFound("no such instance".into())
}

// GET /proxy/:id
async fn team(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ws: Option<WebSocketUpgrade>,
    client: Option<ConnectInfo<SocketAddr>>,
) -> Result<Response, ApiError> {
    connect(state, id, false, ws, client.map(|c| c.0)).await
}

// GET /proxy/noinst/:id
async fn noinst(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ws: Option<WebSocketUpgrade>,
    client: Option<ConnectInfo<SocketAddr>>,
) -> Result<Response, ApiError> {
    connect(state, id, true, ws, client.map(|c| c.0)).await
}

async fn connect(
    state: Arc<AppState>,
    id: String,
    test: bool,
    ws: Option<WebSocketUpgrade>,
    client: Option<SocketAddr>,
) -> Result<Response, ApiError> {
    if !state.proxy.enable {
        return Err(ApiError::BadRequest("proxy is disabled".into()));
    }
    let Some(ws) = ws else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };
    let id: Uuid = id.parse().map_err(|_| unknown())?;

    let valid = state
        .admission
        .validate(id, || async {
            Ok::<_, StoreError>(
                state
                    .store
                    .instance(id)
                    .await?
                    .map_or(false, |i| i.is_active() && i.is_proxy),
            )
        })
        .await?;
    if !valid {
        return Err(unknown());
    }

    // released on every return below, or when the relay ends
    let slot = state.admission.slot(id).map_err(|e| match e {
        AdmitError::Unknown => unknown(),
        AdmitError::Full(_) => ApiError::TooManyRequests(e.to_string()),
    })?;

    let instance = state
        .store
        .instance(id)
        .await?
        .filter(|i| i.is_active() && i.is_proxy && i.participation_id.is_none() == test)
        .ok_or_else(unknown)?;
    let target = instance.target().ok_or_else(unknown)?;

    let stream = match dial(target, DIAL_TIMEOUT).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                instance = %id,
                address = %target.ip(),
                port = target.port(),
                kind = ?e.kind(),
                "failed to reach instance: {}", e
            );
            return Err(ApiError::Teapot("instance unreachable".into()));
        }
    };

    let timeout = state.proxy.timeout();

    Ok(ws.on_upgrade(move |socket| async move {
        let _slot = slot;
        let capture = if test {
            None
        } else {
            open_capture(&state, &instance, client, target).await
        };
        let (capture, capture_task) = capture.unzip();

        let client = client.map_or_else(|| "unknown".to_string(), |c| c.to_string());
        let (sink, stream_rx) = socket.split();
        info!(instance = %id, %client, "proxy connected");

        let stats = relay(stream_rx, sink, stream, capture, timeout).await;
        info!(
            instance = %id,
            %client,
            tx = stats.tx,
            rx = stats.rx,
            reason = %stats.reason,
            "proxy closed"
        );

        if let Some(task) = capture_task {
            task.finish().await;
        }
    }))
}

async fn open_capture(
    state: &AppState,
    instance: &Instance,
    client: Option<SocketAddr>,
    target: SocketAddr,
) -> Option<(Capture, CaptureTask)> {
    let challenge = match state.store.challenge(instance.challenge_id).await {
        Ok(Some(challenge)) if challenge.enable_traffic_capture => challenge,
        Ok(_) => return None,
        Err(e) => {
            warn!(instance = %instance.id, "capture lookup failed: {:?}", e);
            return None;
        }
    };

    let meta = CaptureMeta {
        challenge: challenge.id,
        team: instance.team_id,
        participation: instance.participation_id,
        instance: instance.id,
        container: instance.container_id.clone(),
        flag: instance.flag.clone(),
        client: client.map_or_else(|| "unknown".to_string(), |c| c.to_string()),
        target: target.to_string(),
        started_at: Utc::now(),
    };

    match Capture::open(&state.proxy.capture_dir, &meta).await {
        Ok(capture) => Some(capture),
        Err(e) => {
            warn!(instance = %instance.id, "failed to open capture: {:?}", e);
            None
        }
    }
}

// /proxy/
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/:id", get(team))
        .route("/noinst/:id", get(noinst))
        .with_state(state)
}
