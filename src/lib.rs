pub mod adapters;
pub mod cli;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod mpesa;
pub mod ports;
pub mod queue;
pub mod services;
pub mod startup;
pub mod utils;
pub mod validation;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::config::AllowedIps;
use crate::ports::TransactionStore;
use crate::queue::TaskQueue;
use crate::services::PaymentService;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TransactionStore>,
    pub payments: PaymentService,
    pub queue: Arc<dyn TaskQueue>,
    pub internal_secret: Arc<str>,
    pub allowed_ips: AllowedIps,
    pub max_request_size: usize,
}

pub fn create_app(state: AppState) -> Router {
    let internal = Router::new()
        .route("/initiate", post(handlers::payments::initiate))
        .route("/transactions/:id", get(handlers::payments::get_transaction))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::internal_auth,
        ));

    let callback = Router::new()
        .route("/callback", post(handlers::callback::callback))
        .layer(DefaultBodyLimit::max(state.max_request_size))
        .layer(middleware::IpFilterLayer::new(state.allowed_ips.clone()));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(internal)
        .merge(callback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
