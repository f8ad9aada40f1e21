// WebSocket subscribe front end.
// GET /sub?key=..&heartbeat=..&token=..&mid=.. upgrades and streams pushes as
// text frames. The heartbeat sentinel "h" is echoed back.
use super::{Refusal, Subscription, subscribe};
use crate::node::CometNode;
use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::Instant;

const HEARTBEAT: &str = "h";

#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
    pub key: String,
    #[serde(default)]
    pub heartbeat: u64,
    pub token: Option<String>,
    /// Newest message id the client already holds.
    #[serde(default)]
    pub mid: i64,
}

pub fn router(node: CometNode) -> Router {
    Router::new()
        .route("/sub", axum::routing::get(upgrade))
        .with_state(node)
}

pub async fn serve(listener: tokio::net::TcpListener, node: CometNode) -> std::io::Result<()> {
    axum::serve(listener, router(node).into_make_service()).await
}

async fn upgrade(
    State(node): State<CometNode>,
    Query(query): Query<SubscribeQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    metrics::counter!("comet_ws_accept_total").increment(1);
    match subscribe(
        &node,
        &query.key,
        query.heartbeat,
        query.token.as_deref(),
        query.mid,
    )
    .await
    {
        Ok(subscription) => ws.on_upgrade(move |socket| run_session(socket, subscription)),
        Err(refusal) => refusal_status(&refusal).into_response(),
    }
}

fn refusal_status(refusal: &Refusal) -> StatusCode {
    match refusal {
        Refusal::Param => StatusCode::BAD_REQUEST,
        Refusal::Auth(_) => StatusCode::UNAUTHORIZED,
        Refusal::Channel(_) => StatusCode::SERVICE_UNAVAILABLE,
        Refusal::WrongNode => StatusCode::MISDIRECTED_REQUEST,
    }
}

fn is_heartbeat(message: &WsMessage) -> bool {
    match message {
        WsMessage::Text(text) => text == HEARTBEAT,
        WsMessage::Binary(bytes) => bytes.as_slice() == HEARTBEAT.as_bytes(),
        _ => false,
    }
}

async fn run_session(socket: WebSocket, mut subscription: Subscription) {
    let (mut sender, mut receiver) = socket.split();
    let idle = subscription.idle_timeout();
    let mut read_deadline = Instant::now() + idle;
    loop {
        tokio::select! {
            payload = subscription.receiver.next() => {
                let Some(payload) = payload else {
                    tracing::debug!(key = %subscription.key, "websocket closed by channel");
                    break;
                };
                let text = String::from_utf8_lossy(&payload).into_owned();
                if let Err(err) = sender.send(WsMessage::Text(text)).await {
                    tracing::debug!(key = %subscription.key, error = %err, "websocket write failed");
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(message)) if is_heartbeat(&message) => {
                        read_deadline = Instant::now() + idle;
                        if sender.send(WsMessage::Text(HEARTBEAT.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {
                        read_deadline = Instant::now() + idle;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        tracing::debug!(key = %subscription.key, "unexpected websocket frame");
                        break;
                    }
                    Some(Err(err)) => {
                        tracing::debug!(key = %subscription.key, error = %err, "websocket read failed");
                        break;
                    }
                }
            }
            _ = tokio::time::sleep_until(read_deadline) => {
                tracing::debug!(key = %subscription.key, "heartbeat timeout");
                break;
            }
        }
    }
    drop(subscription);
    let _ = sender.send(WsMessage::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusals_map_to_http_statuses() {
        assert_eq!(refusal_status(&Refusal::Param), StatusCode::BAD_REQUEST);
        assert_eq!(refusal_status(&Refusal::Auth(None)), StatusCode::UNAUTHORIZED);
        assert_eq!(
            refusal_status(&Refusal::WrongNode),
            StatusCode::MISDIRECTED_REQUEST
        );
    }

    #[test]
    fn heartbeat_sentinel_in_text_or_binary() {
        assert!(is_heartbeat(&WsMessage::Text("h".into())));
        assert!(is_heartbeat(&WsMessage::Binary(b"h".to_vec())));
        assert!(!is_heartbeat(&WsMessage::Text("hello".into())));
    }
}
