use axum::{http::StatusCode, routing::get, Router};
use color_eyre::Report;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::admission::AdmissionController;
use crate::config;
use crate::db::Store;
use crate::instance::{InstanceManager, Settings};
use crate::runtime::Runtime;
use crate::submission::SubmissionPipeline;
use crate::types::Submission;

mod admin;
mod auth;
mod error;
mod instances;
mod proxy;
mod submissions;

pub use auth::Requester;
pub use error::ApiError;
pub use instances::InstanceDescriptor;

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub instances: Arc<InstanceManager>,
    pub admission: Arc<AdmissionController>,
    pub submissions: SubmissionPipeline,
    pub proxy: config::Proxy,
    pub server: config::Server,
}

impl AppState {
    /// Wires the managers together, the receiver feeds the checkers
    pub fn new(
        config: &config::Root,
        store: Arc<dyn Store>,
        runtime: Arc<dyn Runtime>,
    ) -> (Arc<Self>, flume::Receiver<Submission>) {
        let instances = InstanceManager::new(store.clone(), runtime, Settings::from_conf(config));
        let (submissions, queue) =
            SubmissionPipeline::new(store.clone(), config.submissions.queue_capacity);

        let state = Self {
            store,
            instances: Arc::new(instances),
            admission: Arc::new(AdmissionController::new(config.proxy.max_connections)),
            submissions,
            proxy: config.proxy.clone(),
            server: config.server.clone(),
        };
        (Arc::new(state), queue)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ping", get(|| async { (StatusCode::OK, "pong") }))
        .nest("/instances", instances::router(Arc::clone(&state)))
        .nest("/proxy", proxy::router(Arc::clone(&state)))
        .nest("/submissions", submissions::router(Arc::clone(&state)))
        .nest("/admin", admin::router(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_methods(Any).allow_origin(Any))
}

pub async fn run(addr: SocketAddr, state: Arc<AppState>) -> Result<(), Report> {
    let app = router(state);

    info!("Webserver started on {addr}");
    axum::Server::bind(&addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;

    Ok(())
}
