mod message;
mod notification;
mod realtime;
mod thread;
mod user;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .merge(thread::routes())
        .merge(message::routes())
        .merge(user::routes())
        .merge(notification::routes())
        .merge(realtime::routes());

    Router::new()
        .nest("/v1", api)
        .merge(notification::public_routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
