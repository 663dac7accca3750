// Message Port
//
// A bidirectional JSON message channel between a content script and the
// background broker. Dropping either end disconnects it; the other end sees
// `recv()` return `None`.

use serde_json::Value;
use tokio::sync::mpsc;

pub struct Port {
    name: String,
    tx: mpsc::UnboundedSender<Value>,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Port {
    /// Create two connected ends
    pub fn pair(name: impl Into<String>) -> (Port, Port) {
        let name = name.into();
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();

        (
            Port {
                name: name.clone(),
                tx: a_tx,
                rx: a_rx,
            },
            Port {
                name,
                tx: b_tx,
                rx: b_rx,
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send to the other end. Posting to a disconnected port is a no-op and
    /// returns `false`.
    pub fn post_message(&self, message: Value) -> bool {
        if self.tx.send(message).is_err() {
            log::debug!("Dropping message for disconnected port {}", self.name);
            return false;
        }
        true
    }

    /// Next message from the other end, `None` once it disconnected
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    pub fn is_disconnected(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the other end disconnected
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    /// Single-use subscription to the first message on this port
    pub fn on_first_message(self) -> OnFirstMessage {
        OnFirstMessage { port: self }
    }

    pub fn disconnect(self) {
        log::debug!("Disconnecting port {}", self.name);
    }
}

/// Consumed by its only `recv`, so the first message is delivered exactly
/// once and every later message stays on the port.
pub struct OnFirstMessage {
    port: Port,
}

impl OnFirstMessage {
    /// The first message together with the port, or `None` if the other end
    /// disconnected without sending anything
    pub async fn recv(mut self) -> Option<(Value, Port)> {
        let message = self.port.recv().await?;
        Some((message, self.port))
    }
}
