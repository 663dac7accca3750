// Connection Broker
//
// Bridges content-script ports to extension backends:
// - The first message on a port is the handshake selecting a backend
// - A bundle runs in a sandboxed worker, a websocket connects to a remote host
// - Success replies `{}`, failure replies `{ error }` and disconnects
// - Afterwards messages are relayed verbatim in both directions
// - Either side going away tears down the other
//
// Every connection runs on its own task and shares nothing with the others.

pub mod backend;
pub mod port;
pub mod socket;
pub mod worker;

pub use backend::{Backend, Platform, SpawnError};
pub use port::Port;

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    AwaitingHandshake,
    Relaying,
    Closed,
}

/// Diagnostic view of a live connection
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub port: String,
    pub state: ConnectionState,
    pub platform: Option<Platform>,
}

struct BrokerInner {
    client: reqwest::Client,
    connections: Mutex<HashMap<Uuid, ConnectionInfo>>,
}

#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

enum RelayEvent {
    FromPort(Option<Value>),
    FromBackend(Option<Value>),
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    /// Use `client` for bundle fetches
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                client,
                connections: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Take ownership of an inbound port and run its connection on a new task.
    /// The task ends with the connection.
    pub fn accept(&self, port: Port) -> JoinHandle<()> {
        let id = Uuid::new_v4();
        self.set_info(ConnectionInfo {
            id,
            port: port.name().to_string(),
            state: ConnectionState::AwaitingHandshake,
            platform: None,
        });

        log::debug!("Accepted connection {} on port {}", id, port.name());

        let broker = self.clone();
        tokio::spawn(async move {
            broker.run_connection(id, port).await;
            broker.finish(id);
        })
    }

    /// Open an in-process connection and return the content-script end
    pub fn connect(&self, name: impl Into<String>) -> Port {
        let (client, server) = Port::pair(name);
        self.accept(server);
        client
    }

    /// Live connections, for diagnostics
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.lock_connections().values().cloned().collect()
    }

    async fn run_connection(&self, id: Uuid, port: Port) {
        let Some((handshake, port)) = port.on_first_message().recv().await else {
            log::debug!("Connection {} closed before its handshake", id);
            return;
        };

        let spawned = match Platform::from_handshake(&handshake) {
            Ok(platform) => {
                log::info!("Connection {} spawning {} {}", id, platform.kind(), platform.url());
                self.update_info(id, |info| info.platform = Some(platform.clone()));

                // Dropping the spawn future cancels the fetch, socket open or
                // bundle evaluation
                tokio::select! {
                    spawned = Backend::spawn(&platform, &self.inner.client) => spawned,
                    _ = port.closed() => {
                        log::debug!("Connection {} port disconnected during spawn", id);
                        return;
                    }
                }
            }
            Err(e) => Err(e),
        };

        let backend = match spawned {
            Ok(backend) => backend,
            Err(e) => {
                log::warn!("Connection {} failed to spawn: {}", id, e);
                port.post_message(json!({ "error": e.to_string() }));
                port.disconnect();
                return;
            }
        };

        // The content script may have given up while we were spawning
        if port.is_disconnected() {
            log::debug!("Connection {} lost its port during spawn", id);
            backend.close().await;
            return;
        }

        self.update_info(id, |info| info.state = ConnectionState::Relaying);
        port.post_message(json!({}));

        relay(id, port, backend).await;
    }

    fn finish(&self, id: Uuid) {
        self.lock_connections().remove(&id);
        log::debug!("Connection {} closed", id);
    }

    fn set_info(&self, info: ConnectionInfo) {
        self.lock_connections().insert(info.id, info);
    }

    fn update_info(&self, id: Uuid, f: impl FnOnce(&mut ConnectionInfo)) {
        if let Some(info) = self.lock_connections().get_mut(&id) {
            f(info);
        }
    }

    fn lock_connections(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ConnectionInfo>> {
        match self.inner.connections.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Forward messages both ways until one side goes away, then close the other
async fn relay(id: Uuid, mut port: Port, mut backend: Backend) {
    loop {
        let event = tokio::select! {
            message = port.recv() => RelayEvent::FromPort(message),
            message = backend.recv() => RelayEvent::FromBackend(message),
        };

        match event {
            RelayEvent::FromPort(Some(message)) => {
                if let Err(e) = backend.send(message).await {
                    log::warn!("Connection {} backend rejected a message: {}", id, e);
                    backend.close().await;
                    port.disconnect();
                    return;
                }
            }
            RelayEvent::FromPort(None) => {
                log::debug!("Connection {} port disconnected, closing backend", id);
                backend.close().await;
                return;
            }
            RelayEvent::FromBackend(Some(message)) => {
                // A vanished port shows up as FromPort(None) next round
                port.post_message(message);
            }
            RelayEvent::FromBackend(None) => {
                log::debug!("Connection {} backend closed, disconnecting port", id);
                port.disconnect();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ECHO_BUNDLE: &str = r#"
        self.onmessage = function (event) {
            postMessage({ echo: event.data });
        };
        postMessage({ ready: true });
    "#;

    async fn serve_bundle(code: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.js"))
            .respond_with(ResponseTemplate::new(200).set_body_string(code))
            .mount(&server)
            .await;
        server
    }

    async fn recv(port: &mut Port) -> Option<Value> {
        tokio::time::timeout(Duration::from_secs(5), port.recv())
            .await
            .expect("timed out waiting for port message")
    }

    async fn wait_until_idle(broker: &Broker) {
        for _ in 0..100 {
            if broker.connections().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("connections still open: {:?}", broker.connections());
    }

    #[tokio::test]
    async fn test_bundle_handshake_acknowledges_before_payload() {
        let server = serve_bundle(ECHO_BUNDLE).await;
        let broker = Broker::new();
        let mut port = broker.connect("bundle");

        port.post_message(json!({
            "platform": { "type": "bundle", "url": format!("{}/index.js", server.uri()) }
        }));

        assert_eq!(recv(&mut port).await, Some(json!({})));
        assert_eq!(recv(&mut port).await, Some(json!({ "ready": true })));

        let connections = broker.connections();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].state, ConnectionState::Relaying);
    }

    #[tokio::test]
    async fn test_bundle_relay_preserves_order() {
        let server = serve_bundle(ECHO_BUNDLE).await;
        let broker = Broker::new();
        let mut port = broker.connect("bundle");

        port.post_message(json!({
            "platform": { "type": "bundle", "url": format!("{}/index.js", server.uri()) }
        }));
        assert_eq!(recv(&mut port).await, Some(json!({})));
        assert_eq!(recv(&mut port).await, Some(json!({ "ready": true })));

        for n in 0..20 {
            port.post_message(json!({ "seq": n }));
        }
        for n in 0..20 {
            assert_eq!(recv(&mut port).await, Some(json!({ "echo": { "seq": n } })));
        }
    }

    #[tokio::test]
    async fn test_port_disconnect_terminates_worker() {
        let server = serve_bundle(ECHO_BUNDLE).await;
        let broker = Broker::new();
        let mut port = broker.connect("bundle");

        port.post_message(json!({
            "platform": { "type": "bundle", "url": format!("{}/index.js", server.uri()) }
        }));
        assert_eq!(recv(&mut port).await, Some(json!({})));

        port.disconnect();
        wait_until_idle(&broker).await;
    }

    #[tokio::test]
    async fn test_disconnect_during_bundle_load_cancels_connection() {
        let server = serve_bundle("for (;;) {}").await;
        let broker = Broker::new();
        let mut port = broker.connect("stuck");

        port.post_message(json!({
            "platform": { "type": "bundle", "url": format!("{}/index.js", server.uri()) }
        }));

        // Wait until the bundle has been fetched and is evaluating
        for _ in 0..100 {
            if !server.received_requests().await.unwrap_or_default().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.connections()[0].state, ConnectionState::AwaitingHandshake);

        port.disconnect();
        wait_until_idle(&broker).await;
    }

    #[tokio::test]
    async fn test_disconnect_during_fetch_never_relays() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.js"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(ECHO_BUNDLE)
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        let broker = Broker::new();
        let port = broker.connect("slow");
        port.post_message(json!({
            "platform": { "type": "bundle", "url": format!("{}/index.js", server.uri()) }
        }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        port.disconnect();

        wait_until_idle(&broker).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(broker.connections().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_platform_replies_error_and_disconnects() {
        let broker = Broker::new();
        let mut port = broker.connect("bad");

        port.post_message(json!({ "platform": { "type": "native", "url": "x" } }));

        let reply = recv(&mut port).await.unwrap();
        let error = reply["error"].as_str().unwrap();
        assert!(error.contains("Cannot connect to extension of type native"));
        assert_eq!(recv(&mut port).await, None);

        wait_until_idle(&broker).await;
    }

    #[tokio::test]
    async fn test_missing_bundle_is_a_spawn_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let broker = Broker::new();
        let mut port = broker.connect("missing");
        port.post_message(json!({
            "platform": { "type": "bundle", "url": format!("{}/index.js", server.uri()) }
        }));

        let reply = recv(&mut port).await.unwrap();
        assert!(reply["error"].as_str().unwrap().contains("Failed to fetch bundle"));
        assert_eq!(recv(&mut port).await, None);
    }

    #[tokio::test]
    async fn test_handshake_is_consumed_once() {
        let server = serve_bundle(ECHO_BUNDLE).await;
        let broker = Broker::new();
        let mut port = broker.connect("bundle");

        let handshake = json!({
            "platform": { "type": "bundle", "url": format!("{}/index.js", server.uri()) }
        });
        port.post_message(handshake.clone());
        // Looks like a handshake but arrives after it, so it is payload
        port.post_message(handshake.clone());

        assert_eq!(recv(&mut port).await, Some(json!({})));
        assert_eq!(recv(&mut port).await, Some(json!({ "ready": true })));
        assert_eq!(recv(&mut port).await, Some(json!({ "echo": handshake })));
    }

    /// Echo server. The receiver resolves with the number of Close frames
    /// the client sent once the connection ends.
    async fn start_socket_server(
        close_after: Option<usize>,
    ) -> (String, tokio::sync::oneshot::Receiver<usize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (closes_tx, closes_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut seen = 0;
            let mut closes = 0;
            while let Some(Ok(message)) = ws.next().await {
                match message {
                    WsMessage::Text(text) => {
                        let value: Value = serde_json::from_str(&text).unwrap();
                        let reply = json!({ "echo": value }).to_string();
                        ws.send(WsMessage::Text(reply)).await.unwrap();
                        seen += 1;
                        if Some(seen) == close_after {
                            let _ = ws.close(None).await;
                            break;
                        }
                    }
                    WsMessage::Close(_) => closes += 1,
                    _ => {}
                }
            }
            let _ = closes_tx.send(closes);
        });

        (format!("ws://{}", addr), closes_rx)
    }

    #[tokio::test]
    async fn test_websocket_relay_round_trip() {
        let (url, _closes) = start_socket_server(None).await;
        let broker = Broker::new();
        let mut port = broker.connect("socket");

        port.post_message(json!({ "platform": { "type": "websocket", "url": url } }));
        assert_eq!(recv(&mut port).await, Some(json!({})));

        port.post_message(json!({ "method": "initialize", "id": 1 }));
        port.post_message(json!({ "method": "shutdown", "id": 2 }));

        assert_eq!(
            recv(&mut port).await,
            Some(json!({ "echo": { "method": "initialize", "id": 1 } }))
        );
        assert_eq!(
            recv(&mut port).await,
            Some(json!({ "echo": { "method": "shutdown", "id": 2 } }))
        );
    }

    #[tokio::test]
    async fn test_socket_close_disconnects_port() {
        let (url, _closes) = start_socket_server(Some(1)).await;
        let broker = Broker::new();
        let mut port = broker.connect("socket");

        port.post_message(json!({ "platform": { "type": "websocket", "url": url } }));
        assert_eq!(recv(&mut port).await, Some(json!({})));

        port.post_message(json!("last"));
        assert_eq!(recv(&mut port).await, Some(json!({ "echo": "last" })));
        assert_eq!(recv(&mut port).await, None);

        wait_until_idle(&broker).await;
    }

    #[tokio::test]
    async fn test_port_disconnect_closes_socket_once() {
        let (url, closes) = start_socket_server(None).await;
        let broker = Broker::new();
        let mut port = broker.connect("socket");

        port.post_message(json!({ "platform": { "type": "websocket", "url": url } }));
        assert_eq!(recv(&mut port).await, Some(json!({})));

        port.disconnect();
        wait_until_idle(&broker).await;

        let closes = tokio::time::timeout(Duration::from_secs(5), closes)
            .await
            .expect("socket server never saw the connection end")
            .unwrap();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn test_socket_refused_is_a_spawn_failure() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let broker = Broker::new();
        let mut port = broker.connect("socket");
        port.post_message(json!({
            "platform": { "type": "websocket", "url": format!("ws://{}", addr) }
        }));

        let reply = recv(&mut port).await.unwrap();
        assert!(reply["error"].as_str().unwrap().contains("WebSocket error before open"));
        assert_eq!(recv(&mut port).await, None);
    }

    #[tokio::test]
    async fn test_connections_are_independent() {
        let server = serve_bundle(ECHO_BUNDLE).await;
        let broker = Broker::new();

        let mut good = broker.connect("good");
        let mut bad = broker.connect("bad");

        bad.post_message(json!({ "platform": { "type": "nope" } }));
        good.post_message(json!({
            "platform": { "type": "bundle", "url": format!("{}/index.js", server.uri()) }
        }));

        assert!(recv(&mut bad).await.unwrap().get("error").is_some());
        assert_eq!(recv(&mut good).await, Some(json!({})));
        assert_eq!(recv(&mut good).await, Some(json!({ "ready": true })));

        good.post_message(json!("still here"));
        assert_eq!(recv(&mut good).await, Some(json!({ "echo": "still here" })));
    }
}
