use crate::{server::SharedState, session::VisionSession};
use axum::{
    extract::{ws::WebSocket, State, WebSocketUpgrade},
    response::IntoResponse,
};
use futures::StreamExt;
use tracing::instrument;

#[instrument(skip(ws, state))]
pub async fn vision_websocket(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (sink, stream) = socket.split();
    let mut session = VisionSession::new(state.pipeline, state.auth, state.metrics);

    if let Err(e) = session.run(sink, stream).await {
        tracing::debug!(error = %e, "Vision session ended with an error");
    }
}
