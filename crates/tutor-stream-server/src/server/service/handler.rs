//! HTTP and WebSocket routes.
//!
//! - `GET /` - health ping.
//! - `GET /ws/llm` - upgrades to a WebSocket bound to one [`Session`].
//!
//! Every inbound text frame is one JSON [`ClientMessage`]; every outbound
//! [`ServerMessage`] is sent as one JSON text frame. Binary frames are
//! ignored. The session ends when the client closes the socket.
//!
//! [`Session`]: crate::server::session::Session
//! [`ClientMessage`]: tutor_stream_core::protocol::ClientMessage

use super::ChatService;
use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use futures::{SinkExt, StreamExt, future};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Ping {
    code: i32,
    message: &'static str,
    status: u16,
}

pub fn router(service: ChatService) -> Router {
    Router::new()
        .route("/", get(ping))
        .route("/ws/llm", get(ws_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(service)
}

async fn ping() -> Json<Ping> {
    Json(Ping {
        code: 0,
        message: "ok",
        status: 200,
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(service): State<ChatService>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, service))
}

#[tracing::instrument(skip_all)]
async fn serve_socket(socket: WebSocket, service: ChatService) {
    tracing::debug!("WebSocket connected");
    let (mut sink, stream) = socket.split();
    let (session, mut outbound) = service.open_session();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if let Err(e) = sink.send(Message::Text(message.to_json().into())).await {
                tracing::debug!("WebSocket send failed: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let inbound = stream
        .take_while(|frame| future::ready(matches!(frame, Ok(m) if !matches!(m, Message::Close(_)))))
        .filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(text.as_str().to_owned()),
                _ => None,
            })
        });

    session.run(inbound).await;

    if let Err(e) = writer.await {
        tracing::warn!("WebSocket writer failed: {e}");
    }
    tracing::debug!("WebSocket disconnected");
}
