// Module declarations
pub mod background;
pub mod broker;
pub mod commands;
pub mod config;
pub mod host;
pub mod permissions;
pub mod server;
pub mod storage;
pub mod tabs;

pub use background::{Background, ServerContext};
pub use broker::{Broker, Port, SpawnError};
pub use commands::{Message, MessageSender};
pub use config::{BackgroundConfig, ManagedPolicy, UNINSTALL_URL};
pub use host::{BrowserHost, HostEvent};
pub use server::BridgeServer;
pub use storage::{Storage, StorageArea, StorageItems};

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A started background service
pub struct Service<H: BrowserHost> {
  pub background: Arc<Background<H>>,
  pub event_loop: JoinHandle<()>,
  pub bridge_addr: SocketAddr,
  pub bridge_token: String,
}

/// Open storage, run the startup sequence, then start the event loop and the
/// bridge server
pub async fn run<H: BrowserHost>(
  config: BackgroundConfig,
  host: Arc<H>,
  events: mpsc::UnboundedReceiver<HostEvent>,
) -> anyhow::Result<Service<H>> {
  log::info!("Opening storage at {:?}", config.database_path);
  let storage = Storage::open(&config.database_path).await?;

  let bridge_port = config.bridge_port;
  let background = Background::new(config, host, storage);

  let report = background.start().await?;
  if report.failed > 0 {
    log::warn!("{} storage migrations failed", report.failed);
  }

  let event_loop = background.spawn_event_loop(events);

  let bridge = BridgeServer::bind(background.clone(), bridge_port).await?;
  let bridge_addr = bridge.local_addr()?;
  let bridge_token = bridge.access_token().to_string();

  tokio::spawn(async move {
    if let Err(e) = bridge.serve().await {
      log::error!("Bridge server stopped: {:#}", e);
    }
  });

  Ok(Service {
    background,
    event_loop,
    bridge_addr,
    bridge_token,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::host::testing::FakeHost;

  #[tokio::test]
  async fn test_run_starts_service() {
    let dir = tempfile::tempdir().unwrap();
    let config = BackgroundConfig {
      database_path: dir.path().join("state").join("background.db"),
      ..Default::default()
    };
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let service = run(config, Arc::new(FakeHost::default()), events_rx)
      .await
      .unwrap();

    assert!(service.bridge_addr.ip().is_loopback());
    assert_eq!(service.bridge_token.len(), 32);

    let sync = service.background.storage().get(StorageArea::Sync).await.unwrap();
    assert!(sync.repo_locations.is_empty());
    assert!(sync.open_file_on_sourcegraph);

    drop(events_tx);
    service.event_loop.await.unwrap();
  }
}
