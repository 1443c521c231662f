//! API route handlers

pub mod broadcast;
pub mod health;
pub mod poll;

use axum::Router;
use axum::routing::{get, post};

use crate::core::shutdown::ShutdownService;
use crate::domain::bus::MessageBus;

/// Shared state for the message-bus routes
#[derive(Clone)]
pub struct BusApiState {
    pub bus: MessageBus,
    pub shutdown: ShutdownService,
}

/// Assemble the public router
pub fn routes(bus: MessageBus, shutdown: ShutdownService) -> Router {
    let state = BusApiState { bus, shutdown };

    Router::new()
        .route("/health", get(health::health))
        .route("/message-bus/broadcast", post(broadcast::broadcast))
        .route("/message-bus/{client_id}", post(poll::poll))
        .route("/message-bus/{client_id}/{*rest}", post(poll::poll_with_rest))
        .with_state(state)
}
