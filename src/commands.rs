// Command Router
//
// Handles one-shot `{ type, payload }` messages from content scripts and the
// options page. Some commands reply, some are fire-and-forget. Unknown
// message types are ignored.

use crate::background::Background;
use crate::host::{BrowserHost, InsertCssDetails, TabId};
use crate::permissions::origin_pattern;
use crate::storage::{merge_unique, StorageArea};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// A one-shot runtime message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Message {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// Where a message came from
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageSender {
    pub tab_id: Option<TabId>,
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdentityPayload {
    identity: String,
}

#[derive(Debug, Deserialize)]
struct InsertCssPayload {
    file: String,
    #[serde(default)]
    origin: Option<String>,
}

/// Origins a stylesheet may be applied to. Deny entries win over allow entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CssScope {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl CssScope {
    pub fn permits(&self, url: &str) -> bool {
        if self.deny.iter().any(|origin| same_origin(origin, url)) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|origin| same_origin(origin, url))
    }
}

fn same_origin(origin: &str, url: &str) -> bool {
    match (url::Url::parse(origin), url::Url::parse(url)) {
        (Ok(a), Ok(b)) => a.origin() == b.origin(),
        _ => url.starts_with(origin.trim_end_matches('/')),
    }
}

fn payload_str(message: &Message) -> Result<String> {
    message
        .payload
        .as_str()
        .map(str::to_string)
        .with_context(|| format!("{} expects a string payload", message.kind))
}

impl<H: BrowserHost> Background<H> {
    /// Dispatch a message. `Ok(None)` means the command sends no reply.
    pub async fn handle_message(
        self: &Arc<Self>,
        message: Message,
        sender: &MessageSender,
    ) -> Result<Option<Value>> {
        log::debug!("Message {} from {:?}", message.kind, sender.url);

        match message.kind.as_str() {
            "setIdentity" => {
                let payload: IdentityPayload = serde_json::from_value(message.payload)
                    .context("setIdentity expects { identity }")?;
                self.storage
                    .set_item(StorageArea::Local, "identity", json!(payload.identity))
                    .await?;
                Ok(None)
            }
            "getIdentity" => {
                let identity = self.storage.get_item(StorageArea::Local, "identity").await?;
                Ok(Some(identity))
            }
            "setEnterpriseUrl" => {
                let url = payload_str(&message)?;
                self.storage
                    .update(StorageArea::Sync, |items| {
                        let mut enterprise_urls = items.enterprise_urls.clone();
                        merge_unique(&mut enterprise_urls, [url]);
                        single_item("enterpriseUrls", json!(enterprise_urls))
                    })
                    .await?;
                Ok(Some(Value::Null))
            }
            "setSourcegraphUrl" => {
                let url = payload_str(&message)?;
                let background = self.clone();
                // The grant prompt may stay open indefinitely
                tokio::spawn(async move {
                    if let Err(e) = background.request_sourcegraph_url(url).await {
                        log::error!("Failed to set Sourcegraph URL: {:#}", e);
                    }
                });
                Ok(None)
            }
            "removeEnterpriseUrl" => {
                let url = payload_str(&message)?;
                self.host.remove(&origin_pattern(&url)).await?;
                self.storage
                    .update(StorageArea::Sync, |items| {
                        let enterprise_urls: Vec<&String> =
                            items.enterprise_urls.iter().filter(|u| **u != url).collect();
                        single_item("enterpriseUrls", json!(enterprise_urls))
                    })
                    .await?;
                Ok(Some(Value::Null))
            }
            "insertCSS" => {
                let payload: InsertCssPayload = serde_json::from_value(message.payload)
                    .context("insertCSS expects { file, origin }")?;
                self.insert_css(payload, sender).await?;
                Ok(None)
            }
            "setBadgeText" => {
                let text = payload_str(&message)?;
                self.host.set_badge_text(&text).await?;
                Ok(None)
            }
            other => {
                log::debug!("Ignoring unknown message type {}", other);
                Ok(None)
            }
        }
    }

    async fn request_sourcegraph_url(&self, url: String) -> Result<()> {
        let granted = self.host.request(vec![origin_pattern(&url)]).await?;
        if !granted {
            log::info!("Permission for {} was not granted", url);
            return Ok(());
        }
        self.storage
            .set_item(StorageArea::Sync, "sourcegraphURL", json!(url))
            .await
    }

    async fn insert_css(&self, payload: InsertCssPayload, sender: &MessageSender) -> Result<()> {
        let sync = self.storage.get(StorageArea::Sync).await?;
        let scope = CssScope {
            allow: payload.origin.clone().into_iter().collect(),
            deny: sync.server_urls,
        };

        if let Some(url) = &sender.url {
            if !scope.permits(url) {
                log::debug!("Not inserting {} into {}", payload.file, url);
                return Ok(());
            }
        }

        self.host
            .insert_css(
                sender.tab_id,
                InsertCssDetails {
                    file: payload.file,
                    origin: payload.origin,
                    allow: scope.allow,
                    deny: scope.deny,
                },
            )
            .await
    }
}

fn single_item(key: &str, value: Value) -> Map<String, Value> {
    let mut items = Map::new();
    items.insert(key.to_string(), value);
    items
}
