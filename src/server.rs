// Bridge Server
//
// Loopback HTTP server that lets hosts outside the browser reach the broker
// and the command router.
//
// Routes:
// - GET /port?name=..       WebSocket upgraded onto a broker port
// - POST /message           one-shot command, JSON reply or null
// - GET /connections        broker connection registry
//
// Every request must carry `?token=<access token>`.

use crate::background::Background;
use crate::broker::Port;
use crate::commands::{Message, MessageSender};
use crate::host::BrowserHost;
use axum::{
    body::Body,
    extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    http::{Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

pub struct BridgeServer<H: BrowserHost> {
    listener: TcpListener,
    access_token: String,
    background: Arc<Background<H>>,
}

impl<H: BrowserHost> BridgeServer<H> {
    /// Bind to `127.0.0.1:port`; port 0 lets the OS choose
    pub async fn bind(background: Arc<Background<H>>, port: u16) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port))).await?;

        Ok(Self {
            listener,
            access_token: generate_token(),
            background,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/port", get(open_port::<H>))
            .route("/message", post(post_message::<H>))
            .route("/connections", get(list_connections::<H>))
            .layer(middleware::from_fn_with_state(
                Arc::new(self.access_token.clone()),
                validate_token,
            ))
            .layer(cors)
            .with_state(self.background.clone())
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let app = self.router();
        log::info!("Bridge server listening on http://{}", self.listener.local_addr()?);
        axum::serve(self.listener, app).await?;
        Ok(())
    }
}

/// 32 lowercase alphanumerics
fn generate_token() -> String {
    (0..32)
        .map(|_| {
            let idx = rand::random::<usize>() % 36;
            if idx < 10 {
                (b'0' + idx as u8) as char
            } else {
                (b'a' + (idx - 10) as u8) as char
            }
        })
        .collect()
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

async fn validate_token(
    State(access_token): State<Arc<String>>,
    Query(query): Query<TokenQuery>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }

    if query.token.as_deref() != Some(access_token.as_str()) {
        log::warn!("Invalid access token in request to {}", request.uri().path());
        return (StatusCode::FORBIDDEN, "Invalid access token").into_response();
    }

    next.run(request).await
}

#[derive(Deserialize)]
struct PortQuery {
    name: Option<String>,
}

async fn open_port<H: BrowserHost>(
    State(background): State<Arc<Background<H>>>,
    Query(query): Query<PortQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let name = query.name.unwrap_or_else(|| "bridge".to_string());
    let port = background.broker().connect(name);
    ws.on_upgrade(move |socket| pump(socket, port))
}

enum PumpEvent {
    FromPort(Option<Value>),
    FromSocket(Option<Result<WsMessage, axum::Error>>),
}

/// Copy messages between a bridge WebSocket and a broker port until either
/// side goes away
async fn pump(socket: WebSocket, mut port: Port) {
    let (mut sink, mut stream) = socket.split();

    loop {
        let event = tokio::select! {
            message = port.recv() => PumpEvent::FromPort(message),
            frame = stream.next() => PumpEvent::FromSocket(frame),
        };

        match event {
            PumpEvent::FromPort(Some(message)) => {
                if sink.send(WsMessage::Text(message.to_string())).await.is_err() {
                    break;
                }
            }
            PumpEvent::FromPort(None) => {
                log::debug!("Port {} disconnected, closing bridge socket", port.name());
                let _ = sink.send(WsMessage::Close(None)).await;
                break;
            }
            PumpEvent::FromSocket(Some(Ok(WsMessage::Text(text)))) => {
                match serde_json::from_str::<Value>(&text) {
                    Ok(message) => {
                        if !port.post_message(message) {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Dropping non-JSON bridge frame: {}", e),
                }
            }
            PumpEvent::FromSocket(Some(Ok(WsMessage::Close(_)))) | PumpEvent::FromSocket(None) => break,
            PumpEvent::FromSocket(Some(Ok(_))) => {}
            PumpEvent::FromSocket(Some(Err(e))) => {
                log::warn!("Bridge socket error: {}", e);
                break;
            }
        }
    }

    port.disconnect();
}

#[derive(Deserialize)]
struct MessageRequest {
    message: Message,
    #[serde(default)]
    sender: MessageSender,
}

async fn post_message<H: BrowserHost>(
    State(background): State<Arc<Background<H>>>,
    Json(request): Json<MessageRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let reply = background
        .handle_message(request.message, &request.sender)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("{:#}", e)))?;

    Ok(Json(reply.unwrap_or(Value::Null)))
}

async fn list_connections<H: BrowserHost>(
    State(background): State<Arc<Background<H>>>,
) -> impl IntoResponse {
    Json(background.broker().connections())
}
