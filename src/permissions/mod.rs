// Permission Ledger
//
// Tracks the origins the extension may act on at runtime:
// - Mirrors permission grants/revocations into the persisted enterprise URL list
// - Owns the in-memory set of permitted origins not covered by the manifest
// - Reconciles administrator-declared URLs with the live grant set (managed.rs)

pub mod managed;

use crate::host::{Permissions, PermissionsApi};
use crate::storage::{merge_unique, Storage, StorageArea};
use anyhow::Result;
use serde_json::{json, Map};
use std::sync::{Arc, RwLock};

/// Match pattern granting every URL
pub const ALL_URLS: &str = "<all_urls>";

/// Drop a trailing `/*` from a match pattern
pub fn strip_wildcard(origin: &str) -> &str {
    origin.strip_suffix("/*").unwrap_or(origin)
}

/// Match pattern covering every path under `url`
pub fn origin_pattern(url: &str) -> String {
    if url == ALL_URLS || url.ends_with("/*") {
        return url.to_string();
    }
    format!("{}/*", url.trim_end_matches('/'))
}

pub struct PermissionLedger {
    api: Arc<dyn PermissionsApi>,
    storage: Storage,
    /// Match patterns the manifest content scripts already cover
    static_origins: Vec<String>,
    permitted: RwLock<Vec<String>>,
}

impl PermissionLedger {
    pub fn new(api: Arc<dyn PermissionsApi>, storage: Storage, static_origins: Vec<String>) -> Self {
        Self {
            api,
            storage,
            static_origins,
            permitted: RwLock::new(Vec::new()),
        }
    }

    /// Build the permitted origin set from the current grants
    pub async fn initialize(&self) -> Result<()> {
        let granted = self.api.get_all().await?;
        let origins: Vec<String> = granted
            .origins
            .into_iter()
            .filter(|o| !self.is_static(o))
            .collect();

        log::info!("Permitted origins at startup: {:?}", origins);

        *self.write_permitted() = origins;
        Ok(())
    }

    /// Snapshot of the permitted origin set
    pub fn permitted_origins(&self) -> Vec<String> {
        match self.permitted.read() {
            Ok(origins) => origins.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn static_origins(&self) -> &[String] {
        &self.static_origins
    }

    pub async fn handle_added(&self, permissions: &Permissions) -> Result<()> {
        if permissions.origins.is_empty() {
            return Ok(());
        }

        {
            let mut permitted = self.write_permitted();
            for origin in &permissions.origins {
                if !self.is_static(origin) && !permitted.contains(origin) {
                    permitted.push(origin.clone());
                }
            }
        }

        let urls: Vec<String> = permissions
            .origins
            .iter()
            .map(|o| strip_wildcard(o).to_string())
            .collect();

        log::debug!("Permissions added: {:?}", urls);

        self.storage
            .update(StorageArea::Sync, |items| {
                let mut enterprise_urls = items.enterprise_urls.clone();
                merge_unique(&mut enterprise_urls, urls);
                enterprise_urls_item(enterprise_urls)
            })
            .await
    }

    pub async fn handle_removed(&self, permissions: &Permissions) -> Result<()> {
        if permissions.origins.is_empty() {
            return Ok(());
        }

        self.write_permitted()
            .retain(|o| !permissions.origins.contains(o));

        let urls: Vec<String> = permissions
            .origins
            .iter()
            .map(|o| strip_wildcard(o).to_string())
            .collect();

        log::debug!("Permissions removed: {:?}", urls);

        self.storage
            .update(StorageArea::Sync, |items| {
                let enterprise_urls: Vec<String> = items
                    .enterprise_urls
                    .iter()
                    .filter(|u| !urls.contains(u))
                    .cloned()
                    .collect();
                enterprise_urls_item(enterprise_urls)
            })
            .await
    }

    fn is_static(&self, origin: &str) -> bool {
        self.static_origins.iter().any(|o| o == origin)
    }

    fn write_permitted(&self) -> std::sync::RwLockWriteGuard<'_, Vec<String>> {
        match self.permitted.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn enterprise_urls_item(urls: Vec<String>) -> Map<String, serde_json::Value> {
    let mut items = Map::new();
    items.insert("enterpriseUrls".to_string(), json!(urls));
    items
}
