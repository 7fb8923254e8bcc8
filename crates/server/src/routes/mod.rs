use axum::{Router, routing::get};
use services::services::hub::Hub;

pub mod health;
pub mod ws;

pub fn router(hub: Hub) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/ws", get(ws::ws_handler))
        .with_state(hub)
}
