//! Coordinator HTTP API
//!
//! `GET /api/tanks` serves the fleet snapshot. `POST /api/refresh` drains
//! the inbound queues first and accepts an optional `{"client": "<id>"}`
//! body to filter the result.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::{Mutex, Notify};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::fleet::Coordinator;
use crate::identity::DeviceId;

pub type SharedCoordinator = Arc<Mutex<Coordinator>>;

#[derive(Debug, Default, Deserialize)]
pub struct RefreshRequest {
    #[serde(default)]
    pub client: Option<DeviceId>,
}

pub fn routes(
    coordinator: SharedCoordinator,
    wake: Option<Arc<Notify>>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let api = warp::path("api");

    let tanks = api
        .and(warp::path("tanks"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_coordinator(Arc::clone(&coordinator)))
        .and_then(handle_tanks);

    let refresh = api
        .and(warp::path("refresh"))
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_coordinator(coordinator))
        .and(warp::any().map(move || wake.clone()))
        .and_then(handle_refresh);

    tanks.or(refresh)
}

/// Serve the API until `shutdown` resolves.
pub async fn serve<F>(coordinator: SharedCoordinator, wake: Option<Arc<Notify>>, addr: SocketAddr, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let (bound, server) = warp::serve(routes(coordinator, wake)).bind_with_graceful_shutdown(addr, shutdown);
    log::info!("Coordinator API listening on http://{}", bound);
    server.await;
}

fn with_coordinator(
    coordinator: SharedCoordinator,
) -> impl Filter<Extract = (SharedCoordinator,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&coordinator))
}

async fn handle_tanks(coordinator: SharedCoordinator) -> Result<impl Reply, Rejection> {
    let snapshot = coordinator.lock().await.snapshot();
    Ok(warp::reply::json(&snapshot))
}

async fn handle_refresh(
    body: Bytes,
    coordinator: SharedCoordinator,
    wake: Option<Arc<Notify>>,
) -> Result<warp::reply::Response, Rejection> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        RefreshRequest::default()
    } else {
        match serde_json::from_slice::<RefreshRequest>(&body) {
            Ok(request) => request,
            Err(e) => {
                let error = serde_json::json!({ "error": format!("invalid refresh body: {}", e) });
                return Ok(warp::reply::with_status(warp::reply::json(&error), StatusCode::BAD_REQUEST).into_response());
            }
        }
    };

    let snapshot = coordinator.lock().await.refresh(request.client.as_ref()).await;
    if let Some(wake) = wake {
        wake.notify_one();
    }
    Ok(warp::reply::json(&snapshot).into_response())
}
