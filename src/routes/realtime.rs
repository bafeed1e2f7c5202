use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::Response;
use axum::routing::get;

use crate::AppState;
use crate::realtime::gateway;

pub fn routes() -> Router<AppState> {
    Router::new().route("/realtime", get(upgrade))
}

/// 双方向イベントチャネルへのアップグレード。
/// 認証はアップグレード後の最初のフレームで行う（ゲートウェイ側）。
async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| gateway::run(state, socket))
}
