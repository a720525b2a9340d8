//! Shared application state injected into all Axum handlers.

use std::sync::Arc;

use crate::domain::EventBus;
use crate::service::StatusListService;

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Status list service for all business logic.
    pub service: Arc<StatusListService>,
    /// Event bus for WebSocket subscriptions.
    pub event_bus: EventBus,
}

impl AppState {
    /// Builds the state around `service`, sharing its event bus.
    #[must_use]
    pub fn new(service: Arc<StatusListService>) -> Self {
        let event_bus = service.event_bus().clone();
        Self { service, event_bus }
    }
}
