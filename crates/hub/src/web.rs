use anyhow::{Context, Result};
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use crate::state::SharedState;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .with_state(state)
}

async fn api_status(State(state): State<SharedState>) -> impl IntoResponse {
    let st = state.read().await;
    Json(st.to_status())
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: SharedState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("status api listening on http://{addr}/api/status");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SystemState;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use irrigation_planner::ChannelId;
    use std::sync::Arc;
    use tokio::sync::RwLock;
    use tower::ServiceExt;

    fn shared() -> SharedState {
        Arc::new(RwLock::new(SystemState::new(&[(ChannelId(1), 27)])))
    }

    async fn get_json(state: SharedState, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn status_reports_lock_and_channels() {
        let state = shared();
        {
            let mut st = state.write().await;
            st.config_locked = true;
            st.record_channel(
                ChannelId(1),
                true,
                "Hedge",
                irrigation_planner::EventKind::Start,
            );
        }

        let (status, json) = get_json(state, "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["config_locked"], true);
        assert_eq!(json["mqtt_connected"], false);
        assert!(json["next_event"].is_null());
        assert_eq!(json["channels"]["1"]["on"], true);
        assert_eq!(json["channels"]["1"]["gpio_pin"], 27);
        assert_eq!(json["activity"][0]["kind"], "channel");
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let (status, _) = get_json(shared(), "/").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
