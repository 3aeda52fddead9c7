use std::sync::Arc;

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::Method,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use missive_shared::constants::PROTOCOL_VERSION;
use missive_shared::envelope::Envelope;
use missive_shared::prekey::Card;
use missive_shared::protocol::{
    CardRequest, Deleted, InboxEntry, LiveAuth, SendRequest, SendResponse, SubscribeRequest,
    Subscribed, Unsubscribed, Updated,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::mailroom::Mailroom;

#[derive(Clone)]
pub struct AppState {
    pub mailroom: Arc<Mailroom>,
}

pub fn build_router(state: AppState, cors_any: bool) -> Router {
    let router = Router::new()
        .route("/health", get(health_check))
        .route("/hello", post(hello))
        .route("/card", post(card))
        .route("/send", post(send))
        .route("/messages", post(messages))
        .route("/opk", post(opk))
        .route("/acknowledge", post(acknowledge))
        .route("/deleteme", post(delete_me))
        .route("/push/subscribe", post(push_subscribe))
        .route("/push/unsubscribe", post(push_unsubscribe))
        .route("/ws", get(live_socket));

    let router = if cors_any {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers(Any),
        )
    } else {
        router
    };

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Unwrap a JSON body, answering malformed input with a 400 `{code, message}`.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ServerError> {
    payload
        .map(|Json(value)| value)
        .map_err(|e| ServerError::BadRequest(e.body_text()))
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: PROTOCOL_VERSION,
    })
}

async fn hello(
    State(state): State<AppState>,
    payload: Result<Json<Card>, JsonRejection>,
) -> Result<Json<Envelope>, ServerError> {
    let card = body(payload)?;
    Ok(Json(state.mailroom.hello(&card).await?))
}

async fn card(
    State(state): State<AppState>,
    payload: Result<Json<CardRequest>, JsonRejection>,
) -> Result<Json<Card>, ServerError> {
    let request = body(payload)?;
    Ok(Json(state.mailroom.card(&request).await?))
}

async fn send(
    State(state): State<AppState>,
    payload: Result<Json<SendRequest>, JsonRejection>,
) -> Result<Json<SendResponse>, ServerError> {
    let request = body(payload)?;
    Ok(Json(state.mailroom.send(&request).await?))
}

async fn messages(
    State(state): State<AppState>,
    payload: Result<Json<Envelope>, JsonRejection>,
) -> Result<Json<Vec<InboxEntry>>, ServerError> {
    let envelope = body(payload)?;
    Ok(Json(state.mailroom.messages(&envelope).await?))
}

async fn opk(
    State(state): State<AppState>,
    payload: Result<Json<Envelope>, JsonRejection>,
) -> Result<Json<Updated>, ServerError> {
    let envelope = body(payload)?;
    Ok(Json(state.mailroom.opk(&envelope).await?))
}

async fn acknowledge(
    State(state): State<AppState>,
    payload: Result<Json<Envelope>, JsonRejection>,
) -> Result<Json<Deleted>, ServerError> {
    let envelope = body(payload)?;
    Ok(Json(state.mailroom.acknowledge(&envelope).await?))
}

async fn delete_me(
    State(state): State<AppState>,
    payload: Result<Json<Envelope>, JsonRejection>,
) -> Result<Json<Deleted>, ServerError> {
    let envelope = body(payload)?;
    Ok(Json(state.mailroom.delete_me(&envelope).await?))
}

async fn push_subscribe(
    State(state): State<AppState>,
    payload: Result<Json<SubscribeRequest>, JsonRejection>,
) -> Result<Json<Subscribed>, ServerError> {
    let request = body(payload)?;
    Ok(Json(state.mailroom.subscribe(&request).await?))
}

async fn push_unsubscribe(
    State(state): State<AppState>,
    payload: Result<Json<SubscribeRequest>, JsonRejection>,
) -> Result<Json<Unsubscribed>, ServerError> {
    let request = body(payload)?;
    Ok(Json(state.mailroom.unsubscribe(&request).await?))
}

async fn live_socket(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_live(state, socket))
}

/// First frame must be a [`LiveAuth`]; afterwards the socket only carries
/// new-mail signals from server to client.
async fn handle_live(state: AppState, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    let auth = match stream.next().await {
        Some(Ok(Message::Text(text))) => serde_json::from_str::<LiveAuth>(&text).ok(),
        _ => None,
    };
    let Some(auth) = auth else {
        debug!("Live connection sent no valid auth frame");
        let _ = sink.close().await;
        return;
    };

    let (connection, mut signals) = match state.mailroom.authenticate_live(&auth).await {
        Ok(registered) => registered,
        Err(e) => {
            warn!(user = %auth.id.short(), error = %e, "Live authentication failed");
            let _ = sink.close().await;
            return;
        }
    };

    let mut send_task = tokio::spawn(async move {
        while let Some(signal) = signals.recv().await {
            if sink.send(Message::Text(signal)).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.mailroom.live().disconnect(&auth.id, &connection).await;
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr, cors_any: bool) -> std::io::Result<()> {
    let app = build_router(state, cors_any);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use missive_store::MemoryStore;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn router() -> Router {
        let mailroom = Mailroom::new(
            Arc::new(MemoryStore::new()),
            "messages",
            1800,
            Arc::new(crate::push::TracingPush),
        );
        build_router(
            AppState {
                mailroom: Arc::new(mailroom),
            },
            true,
        )
    }

    async fn post(router: Router, uri: &str, body: String) -> (StatusCode, Value) {
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let response = router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_bad_token_is_401_with_error_body() {
        let request = json!({"token": "forged.token.value", "msg": {"id": "ab".repeat(32)}});
        let (status, body) = post(router(), "/card", request.to_string()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], 401);
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn test_malformed_body_is_400() {
        let (status, body) = post(router(), "/send", "{not json".to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 400);
    }

    #[tokio::test]
    async fn test_hello_returns_sealed_tokens() {
        let identity = missive_shared::Identity::generate();
        let card = Card {
            user: identity.user_id(),
            opk: identity.create_prekey().one_time_key(),
        };
        let (status, body) = post(router(), "/hello", serde_json::to_string(&card).unwrap()).await;
        assert_eq!(status, StatusCode::OK);

        let envelope: Envelope = serde_json::from_value(body).unwrap();
        let opened = identity
            .open_envelope::<missive_shared::protocol::HelloResponse>(&envelope)
            .unwrap();
        assert_eq!(opened.plaintext.decoded.sub, identity.user_id().to_hex());
    }
}
