// Connection Backends
//
// The handshake selects one of two backends. Relay code only talks to the
// `Backend` enum: send, recv, close.

use super::socket::Socket;
use super::worker::Worker;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Why a connection could not be established. The display text is what the
/// content script receives as `{ error }`.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Invalid handshake message: {0}")]
    InvalidHandshake(String),

    #[error("Cannot connect to extension of type {0}. Must be either bundle or websocket.")]
    UnsupportedPlatform(String),

    #[error("Failed to fetch bundle {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Failed to start worker: {0}")]
    Worker(String),

    #[error("WebSocket error before open: {0}")]
    Socket(String),
}

/// Where the extension behind a connection runs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Platform {
    /// Script fetched from `url` and run in a worker
    Bundle { url: String },
    /// Remote extension host at `url`
    Websocket { url: String },
}

impl Platform {
    /// Read the platform descriptor out of a handshake message
    pub fn from_handshake(message: &Value) -> Result<Self, SpawnError> {
        let platform = message
            .get("platform")
            .filter(|p| p.is_object())
            .ok_or_else(|| SpawnError::InvalidHandshake("missing platform".to_string()))?;

        let kind = platform.get("type").and_then(Value::as_str).unwrap_or_default();
        let url = platform.get("url").and_then(Value::as_str);

        match (kind, url) {
            ("bundle", Some(url)) => Ok(Platform::Bundle { url: url.to_string() }),
            ("websocket", Some(url)) => Ok(Platform::Websocket { url: url.to_string() }),
            ("bundle" | "websocket", None) => Err(SpawnError::InvalidHandshake(format!(
                "{} platform is missing a url",
                kind
            ))),
            (other, _) => Err(SpawnError::UnsupportedPlatform(other.to_string())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Platform::Bundle { .. } => "bundle",
            Platform::Websocket { .. } => "websocket",
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Platform::Bundle { url } | Platform::Websocket { url } => url,
        }
    }
}

pub enum Backend {
    Bundle(Worker),
    Socket(Socket),
}

impl Backend {
    pub async fn spawn(platform: &Platform, client: &reqwest::Client) -> Result<Self, SpawnError> {
        match platform {
            Platform::Bundle { url } => {
                let code = fetch_bundle(client, url).await?;
                let worker = Worker::spawn(&bundle_name(url), code).await?;
                Ok(Backend::Bundle(worker))
            }
            Platform::Websocket { url } => Ok(Backend::Socket(Socket::connect(url).await?)),
        }
    }

    /// Forward a port message. An error means the backend is gone.
    pub async fn send(&mut self, message: Value) -> anyhow::Result<()> {
        match self {
            Backend::Bundle(worker) => {
                if !worker.post_message(message) {
                    anyhow::bail!("worker has stopped");
                }
                Ok(())
            }
            Backend::Socket(socket) => socket.send(message).await,
        }
    }

    /// Next backend message, `None` once the backend closed
    pub async fn recv(&mut self) -> Option<Value> {
        match self {
            Backend::Bundle(worker) => worker.recv().await,
            Backend::Socket(socket) => socket.recv().await,
        }
    }

    /// Consumes the backend, so it is closed at most once
    pub async fn close(self) {
        match self {
            Backend::Bundle(mut worker) => worker.terminate(),
            Backend::Socket(socket) => socket.close().await,
        }
    }
}

async fn fetch_bundle(client: &reqwest::Client, url: &str) -> Result<String, SpawnError> {
    let fetch_error = |reason: String| SpawnError::Fetch {
        url: url.to_string(),
        reason,
    };

    let response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| fetch_error(e.to_string()))?;

    let bytes = response.bytes().await.map_err(|e| fetch_error(e.to_string()))?;

    log::debug!("Fetched bundle {} ({} bytes)", url, bytes.len());

    String::from_utf8(bytes.to_vec()).map_err(|e| fetch_error(format!("bundle is not UTF-8: {}", e)))
}

fn bundle_name(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "bundle".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_platforms() {
        let bundle = json!({ "platform": { "type": "bundle", "url": "http://localhost:1234/index.js" } });
        assert_eq!(
            Platform::from_handshake(&bundle).unwrap(),
            Platform::Bundle { url: "http://localhost:1234/index.js".into() }
        );

        let socket = json!({ "platform": { "type": "websocket", "url": "ws://localhost:1234" } });
        assert_eq!(Platform::from_handshake(&socket).unwrap().kind(), "websocket");
    }

    #[test]
    fn test_unknown_platform_type() {
        let message = json!({ "platform": { "type": "native", "url": "x" } });
        let error = Platform::from_handshake(&message).unwrap_err();
        assert!(matches!(error, SpawnError::UnsupportedPlatform(ref t) if t == "native"));
        assert!(error.to_string().starts_with("Cannot connect to extension of type native"));
    }

    #[test]
    fn test_missing_platform_or_url() {
        assert!(matches!(
            Platform::from_handshake(&json!({})),
            Err(SpawnError::InvalidHandshake(_))
        ));
        assert!(matches!(
            Platform::from_handshake(&json!({ "platform": { "type": "bundle" } })),
            Err(SpawnError::InvalidHandshake(_))
        ));
    }
}
