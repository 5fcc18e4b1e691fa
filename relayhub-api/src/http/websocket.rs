//! WebSocket accept path
//!
//! Adapts axum's `WebSocket` to the transport-neutral frames the connection
//! actor works on, then hands the connection to the hub.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{future, SinkExt, StreamExt};
use tracing::info;

use relayhub_cluster::{ConnectionActor, Frame, HubState};

use crate::http::{AppError, AppResult, AppState};

/// Upgrade to a WebSocket and attach it to the hub
///
/// Refused with 503 unless the hub is running.
pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> AppResult<impl IntoResponse> {
    let hub_state = state.hub.state();
    if hub_state != HubState::Running {
        return Err(AppError::service_unavailable(format!("Hub is {hub_state}")));
    }

    Ok(ws
        .max_message_size(state.limits.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state)))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sink, stream) = socket.split();

    let frames = stream.map(|message| message.map(frame_from_message));
    let sink = sink.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(message_from_frame(frame))));

    let handle = ConnectionActor::new(state.hub.clone(), state.limits.clone(), sink, frames).spawn();
    let session_id = handle.session_id().clone();
    info!(session_id = %session_id, "WebSocket connection established");

    handle.join().await;
    info!(session_id = %session_id, "WebSocket connection finished");
}

fn frame_from_message(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text.as_str().to_owned()),
        Message::Binary(data) => Frame::Binary(data),
        Message::Ping(data) => Frame::Ping(data),
        Message::Pong(data) => Frame::Pong(data),
        Message::Close(_) => Frame::Close,
    }
}

fn message_from_frame(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data),
        Frame::Ping(data) => Message::Ping(data),
        Frame::Pong(data) => Message::Pong(data),
        Frame::Close => Message::Close(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Bytes;

    #[test]
    fn test_message_frame_mapping() {
        assert_eq!(
            frame_from_message(Message::Text("hi".into())),
            Frame::Text("hi".to_string())
        );
        assert_eq!(frame_from_message(Message::Close(None)), Frame::Close);
        assert_eq!(
            frame_from_message(Message::Pong(Bytes::from_static(b"p"))),
            Frame::Pong(Bytes::from_static(b"p"))
        );

        assert!(matches!(
            message_from_frame(Frame::Text("out".to_string())),
            Message::Text(text) if text.as_str() == "out"
        ));
        assert!(matches!(message_from_frame(Frame::Close), Message::Close(None)));
        assert!(matches!(message_from_frame(Frame::Ping(Bytes::new())), Message::Ping(_)));
    }
}
