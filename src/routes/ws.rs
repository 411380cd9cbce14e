use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::AppState;
use crate::helpers::epoch_millis;
use crate::logs::{
    ClientMessage, ConnectionId, EventSender, SUBSCRIBER_QUEUE, ServerEvent, StreamKey,
};

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

pub async fn handle_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_connection(socket, state))
}

/// One task writes queued events to the socket; this task reads client
/// messages. Everything the connection subscribed to is released on exit.
async fn serve_connection(socket: WebSocket, state: AppState) {
    let conn = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(SUBSCRIBER_QUEUE);
    info!("websocket {} connected", conn);

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(t) => t,
                Err(e) => {
                    warn!("failed to encode event: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });
    let pusher = tokio::spawn(push_status(state.clone(), tx.clone()));

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => handle_client_message(&state, conn, &tx, text.as_str()),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("websocket {} read error: {}", conn, e);
                break;
            }
        }
    }

    state.coordinator.logs.disconnect(conn);
    pusher.abort();
    writer.abort();
    info!("websocket {} disconnected", conn);
}

pub(crate) fn handle_client_message(
    state: &AppState,
    conn: ConnectionId,
    tx: &EventSender,
    text: &str,
) {
    let logs = &state.coordinator.logs;
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::StartLogStream { job_name, pod_name }) => {
            let key = StreamKey::new(job_name.clone(), pod_name.clone());
            if let Err(e) = logs.subscribe(conn, tx.clone(), key) {
                let _ = tx.try_send(ServerEvent::LogStreamError {
                    job_name,
                    pod_name,
                    error: e.to_string(),
                });
            }
        }
        Ok(ClientMessage::StopLogStream { job_name, pod_name }) => {
            logs.unsubscribe(conn, &StreamKey::new(job_name, pod_name));
        }
        Ok(ClientMessage::StopAllLogStreams) => {
            logs.unsubscribe_all(conn);
        }
        Ok(ClientMessage::Ping) => {
            let _ = tx.try_send(ServerEvent::Pong {
                timestamp: epoch_millis(),
            });
        }
        Err(e) => warn!("ignoring message from websocket {}: {}", conn, e),
    }
}

/// Pushes the cached pod and service views every `status_push_secs`,
/// starting immediately, until the connection goes away.
async fn push_status(state: AppState, tx: EventSender) {
    let period = Duration::from_secs(state.coordinator.config().status_push_secs.max(1));
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let app = &state.coordinator.app;
        let (pods, services) = tokio::join!(app.get_pods(false), app.get_services(false));
        let event = ServerEvent::StatusUpdate {
            pods: pods.map(|c| c.data.pods).unwrap_or_default(),
            services: services.map(|c| c.data.services).unwrap_or_default(),
            timestamp: epoch_millis(),
        };
        if tx.send(event).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::coordinator::testing::coordinator;
    use tempfile::TempDir;

    async fn state(dir: &TempDir) -> AppState {
        let (coordinator, _runner) = coordinator(dir, Config::default()).await;
        AppState { coordinator }
    }

    #[tokio::test]
    async fn ping_and_stream_messages() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir).await;
        let (tx, mut rx) = mpsc::channel(SUBSCRIBER_QUEUE);

        handle_client_message(&state, 9, &tx, r#"{"type": "ping"}"#);
        assert!(matches!(rx.try_recv(), Ok(ServerEvent::Pong { .. })));

        handle_client_message(
            &state,
            9,
            &tx,
            r#"{"type": "start_log_stream", "jobName": "train", "podName": "train-0"}"#,
        );
        assert!(matches!(
            rx.try_recv(),
            Ok(ServerEvent::LogStreamStarted { .. })
        ));
        let key = StreamKey::new("train", "train-0");
        assert_eq!(state.coordinator.logs.subscriber_count(&key), 1);

        handle_client_message(&state, 9, &tx, r#"{"type": "stop_all_log_streams"}"#);
        assert!(matches!(
            rx.try_recv(),
            Ok(ServerEvent::LogStreamStopped { .. })
        ));
        assert_eq!(state.coordinator.logs.subscriber_count(&key), 0);
    }

    #[tokio::test]
    async fn bad_stream_names_are_reported_to_the_client() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir).await;
        let (tx, mut rx) = mpsc::channel(SUBSCRIBER_QUEUE);

        handle_client_message(
            &state,
            1,
            &tx,
            r#"{"type": "start_log_stream", "jobName": "..", "podName": "x"}"#,
        );
        assert!(matches!(
            rx.try_recv(),
            Ok(ServerEvent::LogStreamError { .. })
        ));

        handle_client_message(&state, 1, &tx, "not json");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn status_is_pushed_until_the_connection_drops() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir).await;
        let (tx, mut rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let pusher = tokio::spawn(push_status(state, tx));

        match rx.recv().await {
            Some(ServerEvent::StatusUpdate { pods, services, .. }) => {
                assert_eq!(pods.len(), 1);
                assert!(services.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            rx.recv().await,
            Some(ServerEvent::StatusUpdate { .. })
        ));

        drop(rx);
        pusher.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn push_period_comes_from_the_coordinator_config() {
        let dir = TempDir::new().unwrap();
        let (coordinator, _runner) = coordinator(
            &dir,
            Config {
                status_push_secs: 5,
                ..Config::default()
            },
        )
        .await;
        let (tx, mut rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let pusher = tokio::spawn(push_status(AppState { coordinator }, tx));

        assert!(matches!(rx.recv().await, Some(ServerEvent::StatusUpdate { .. })));
        let since = tokio::time::Instant::now();
        assert!(matches!(rx.recv().await, Some(ServerEvent::StatusUpdate { .. })));
        let waited = since.elapsed();
        assert!(waited > Duration::from_secs(4) && waited < Duration::from_secs(6));

        drop(rx);
        pusher.await.unwrap();
    }
}
