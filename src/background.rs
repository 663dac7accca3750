// Background Service
//
// Wires storage, permissions, tab injection and the broker together and
// reacts to browser events. All host callbacks and storage changes are
// handled one at a time by a single event loop task.

use crate::broker::Broker;
use crate::config::{BackgroundConfig, ManagedPolicy};
use crate::host::{BrowserHost, HostEvent};
use crate::permissions::managed::BrowserActionState;
use crate::permissions::PermissionLedger;
use crate::storage::migrations::{run_migrations, sync_migrations, MigrationReport};
use crate::storage::{merge_unique, Storage, StorageArea, StorageChangeEvent, StorageItems};
use crate::tabs;
use anyhow::Result;
use serde_json::{json, Map, Value};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Server URLs the rest of the extension currently talks to
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerContext {
    pub sourcegraph_url: String,
    pub server_urls: Vec<String>,
}

pub struct Background<H: BrowserHost> {
    pub(crate) host: Arc<H>,
    pub(crate) storage: Storage,
    pub(crate) config: BackgroundConfig,
    ledger: PermissionLedger,
    browser_action: Arc<BrowserActionState>,
    broker: Broker,
    context: RwLock<ServerContext>,
}

impl<H: BrowserHost> Background<H> {
    pub fn new(config: BackgroundConfig, host: Arc<H>, storage: Storage) -> Arc<Self> {
        let ledger = PermissionLedger::new(
            host.clone(),
            storage.clone(),
            config.static_content_script_origins(),
        );
        let browser_action = Arc::new(BrowserActionState::new(config.default_popup.clone()));

        Arc::new(Self {
            host,
            storage,
            config,
            ledger,
            browser_action,
            broker: Broker::new(),
            context: RwLock::new(ServerContext::default()),
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn ledger(&self) -> &PermissionLedger {
        &self.ledger
    }

    pub fn browser_action(&self) -> &BrowserActionState {
        &self.browser_action
    }

    pub fn server_context(&self) -> ServerContext {
        match self.context.read() {
            Ok(context) => context.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Startup sequence: policy, migrations, omnibox, managed permissions,
    /// permitted origins
    pub async fn start(&self) -> Result<MigrationReport> {
        if let Some(path) = &self.config.managed_policy_path {
            match ManagedPolicy::load(path).and_then(ManagedPolicy::into_items) {
                Ok(items) => self.storage.apply_managed_policy(items).await?,
                Err(e) => log::warn!("Ignoring managed policy: {:#}", e),
            }
        }

        let report = run_migrations(&self.storage, StorageArea::Sync, &sync_migrations()).await;

        let sync = self.storage.get(StorageArea::Sync).await?;
        self.update_context(|context| {
            context.sourcegraph_url = sync.sourcegraph_url.clone();
            context.server_urls = sync.server_urls.clone();
        });
        self.configure_omnibox(&sync.sourcegraph_url).await?;

        let managed_urls = self.managed_enterprise_urls().await?;
        if managed_urls.is_empty() {
            self.browser_action.set_default(self.host.as_ref()).await?;
        } else {
            self.browser_action
                .reconcile(self.host.as_ref(), &managed_urls)
                .await?;
        }

        self.ledger.initialize().await?;

        log::info!("Background service started");

        Ok(report)
    }

    /// Run the event loop until the host event channel closes
    pub fn spawn_event_loop(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<HostEvent>) -> JoinHandle<()> {
        let background = self.clone();
        let mut changes = self.storage.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else {
                            log::info!("Host event channel closed, stopping event loop");
                            return;
                        };
                        if let Err(e) = background.handle_event(event).await {
                            log::error!("Failed to handle host event: {:#}", e);
                        }
                    }
                    change = changes.recv() => match change {
                        Ok(change) => {
                            if let Err(e) = background.handle_storage_change(&change).await {
                                log::error!("Failed to handle storage change: {:#}", e);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            log::warn!("Event loop missed {} storage changes", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        })
    }

    pub async fn handle_event(&self, event: HostEvent) -> Result<()> {
        match event {
            HostEvent::Installed => self.on_installed().await,
            HostEvent::PermissionsAdded(permissions) => self.ledger.handle_added(&permissions).await,
            HostEvent::PermissionsRemoved(permissions) => {
                self.ledger.handle_removed(&permissions).await
            }
            HostEvent::TabUpdated { tab_id, status, url } => {
                let permitted = self.ledger.permitted_origins();
                tabs::handle_tab_updated(
                    self.host.as_ref(),
                    &self.config.inject_bundle,
                    &permitted,
                    tab_id,
                    status,
                    url.as_deref(),
                )
                .await?;
                Ok(())
            }
            HostEvent::BrowserActionClicked => {
                let Some(origins) = self.browser_action.take_pending_request() else {
                    return Ok(());
                };
                let host = self.host.clone();
                let browser_action = self.browser_action.clone();
                // The permission prompt may stay open indefinitely
                tokio::spawn(async move {
                    if let Err(e) = browser_action.request_pending(host.as_ref(), origins).await {
                        log::error!("Failed to request managed permissions: {:#}", e);
                    }
                });
                Ok(())
            }
        }
    }

    /// Fill the sync area with defaults, stored values and managed overrides
    pub async fn on_installed(&self) -> Result<()> {
        self.browser_action.set_default(self.host.as_ref()).await?;

        let mut items = StorageItems::default_map();
        items.extend(self.storage.get_raw(StorageArea::Sync).await?);
        items.extend(self.storage.get_raw(StorageArea::Managed).await?);
        self.storage.set(StorageArea::Sync, items).await?;

        let managed_urls = self.managed_enterprise_urls().await?;
        if managed_urls.is_empty() {
            self.browser_action.set_default(self.host.as_ref()).await
        } else {
            self.browser_action
                .reconcile(self.host.as_ref(), &managed_urls)
                .await
        }
    }

    pub async fn handle_storage_change(&self, event: &StorageChangeEvent) -> Result<()> {
        match event.area {
            StorageArea::Managed => {
                if let Some(urls) = event.new_value("serverUrls").and_then(string_list) {
                    let sync = self.storage.get(StorageArea::Sync).await?;
                    let mut server_urls = sync.server_urls;
                    merge_unique(&mut server_urls, urls);

                    self.update_context(|context| context.server_urls = server_urls.clone());

                    if let Some(first) = server_urls.first().cloned() {
                        let mut items = Map::new();
                        items.insert("serverUrls".to_string(), json!(server_urls));
                        items.insert("sourcegraphURL".to_string(), json!(first));
                        self.storage.set(StorageArea::Sync, items).await?;
                    }
                }

                if let Some(urls) = event.new_value("enterpriseUrls").and_then(string_list) {
                    let urls: Vec<String> = urls.iter().map(|u| trim_url(u)).collect();
                    self.browser_action.reconcile(self.host.as_ref(), &urls).await?;
                }
            }
            StorageArea::Sync => {
                if let Some(url) = event.new_value("sourcegraphURL").and_then(Value::as_str) {
                    self.update_context(|context| context.sourcegraph_url = url.to_string());
                    self.configure_omnibox(url).await?;
                }
                if let Some(urls) = event.new_value("serverUrls").and_then(string_list) {
                    self.update_context(|context| context.server_urls = urls);
                }
            }
            StorageArea::Local => {}
        }
        Ok(())
    }

    async fn managed_enterprise_urls(&self) -> Result<Vec<String>> {
        let managed = self.storage.get_raw(StorageArea::Managed).await?;
        Ok(managed
            .get("enterpriseUrls")
            .and_then(string_list)
            .unwrap_or_default()
            .iter()
            .map(|u| trim_url(u))
            .collect())
    }

    async fn configure_omnibox(&self, server_url: &str) -> Result<()> {
        self.host
            .set_default_suggestion(&format!("Search code on {}", server_url))
            .await
    }

    fn update_context(&self, f: impl FnOnce(&mut ServerContext)) {
        match self.context.write() {
            Ok(mut context) => f(&mut context),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    let list = value.as_array()?;
    Some(
        list.iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
    )
}

fn trim_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}
