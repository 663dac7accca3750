// Storage Item Types
//
// Defines the settings persisted by the extension, their JSON key names and
// the defaults every read falls back to.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const DEFAULT_SOURCEGRAPH_URL: &str = "https://sourcegraph.com";

/// Storage scope backing a set of items
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StorageArea {
    /// User settings synced across devices
    Sync,
    /// Device-only settings (identity token)
    Local,
    /// Read-only administrator policy
    Managed,
}

impl StorageArea {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageArea::Sync => "sync",
            StorageArea::Local => "local",
            StorageArea::Managed => "managed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "sync" => Some(StorageArea::Sync),
            "local" => Some(StorageArea::Local),
            "managed" => Some(StorageArea::Managed),
            _ => None,
        }
    }
}

/// Repository name -> local checkout path
pub type RepoLocations = BTreeMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhabricatorMapping {
    pub callsign: String,
    pub path: String,
}

/// The feature flags available.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct FeatureFlags {
    pub new_tooltips: bool,
    pub new_inject: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            new_tooltips: true,
            new_inject: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfigurationDetails {
    pub content_script_urls: Vec<String>,
    pub parent_sourcegraph: ParentSourcegraph,
}

impl Default for ClientConfigurationDetails {
    fn default() -> Self {
        Self {
            content_script_urls: Vec::new(),
            parent_sourcegraph: ParentSourcegraph::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ParentSourcegraph {
    pub url: String,
}

impl Default for ParentSourcegraph {
    fn default() -> Self {
        Self {
            url: DEFAULT_SOURCEGRAPH_URL.to_string(),
        }
    }
}

/// Every persisted setting. Missing keys deserialize to their default, so a
/// read never yields a partially populated set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageItems {
    #[serde(rename = "sourcegraphURL")]
    pub sourcegraph_url: String,
    #[serde(rename = "gitHubEnterpriseURL")]
    pub github_enterprise_url: String,
    /// Deprecated, folded into `enterpriseUrls` by the sync migrations
    #[serde(rename = "phabricatorURL")]
    pub phabricator_url: String,
    pub inline_symbol_search_enabled: bool,
    pub render_mermaid_graphs_enabled: bool,
    pub repository_file_tree_enabled: bool,
    pub execute_search_enabled: bool,
    pub sourcegraph_repo_search_toggled: bool,
    pub open_editor_enabled: bool,
    pub identity: String,
    pub server_urls: Vec<String>,
    pub enterprise_urls: Vec<String>,
    pub server_user_id: String,
    pub has_seen_server_modal: bool,
    pub repo_locations: RepoLocations,
    pub phabricator_mappings: Vec<PhabricatorMapping>,
    pub open_file_on_sourcegraph: bool,
    pub sourcegraph_anonymous_uid: String,
    pub disable_extension: bool,
    /// Enable the use of Sourcegraph extensions.
    pub use_extensions: bool,
    pub feature_flags: FeatureFlags,
    pub client_configuration: ClientConfigurationDetails,
    /// Overrides settings from Sourcegraph.
    pub client_settings: String,
    pub has_enable_domain_context_menu: bool,
}

impl Default for StorageItems {
    fn default() -> Self {
        Self {
            sourcegraph_url: DEFAULT_SOURCEGRAPH_URL.to_string(),
            github_enterprise_url: String::new(),
            phabricator_url: String::new(),
            inline_symbol_search_enabled: true,
            render_mermaid_graphs_enabled: false,
            repository_file_tree_enabled: true,
            execute_search_enabled: false,
            sourcegraph_repo_search_toggled: true,
            open_editor_enabled: false,
            identity: String::new(),
            server_urls: vec![DEFAULT_SOURCEGRAPH_URL.to_string()],
            enterprise_urls: Vec::new(),
            server_user_id: String::new(),
            has_seen_server_modal: false,
            repo_locations: RepoLocations::new(),
            phabricator_mappings: Vec::new(),
            open_file_on_sourcegraph: true,
            sourcegraph_anonymous_uid: String::new(),
            disable_extension: false,
            use_extensions: false,
            feature_flags: FeatureFlags::default(),
            client_configuration: ClientConfigurationDetails::default(),
            client_settings: String::new(),
            has_enable_domain_context_menu: false,
        }
    }
}

impl StorageItems {
    /// Fill absent keys of a stored key set with defaults. A stored value
    /// that does not fit its field is skipped and the default kept.
    pub fn from_stored(stored: Map<String, Value>) -> anyhow::Result<Self> {
        let mut items = Self::default_map();

        for (key, value) in stored {
            let mut single = Map::new();
            single.insert(key.clone(), value.clone());
            match serde_json::from_value::<Self>(Value::Object(single)) {
                Ok(_) => {
                    items.insert(key, value);
                }
                Err(e) => log::warn!("Ignoring unusable stored item {}: {}", key, e),
            }
        }

        Ok(serde_json::from_value(Value::Object(items))?)
    }

    /// The full default set as a JSON key map
    pub fn default_map() -> Map<String, Value> {
        match serde_json::to_value(Self::default()) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Append `urls` to `list`, skipping entries already present
pub fn merge_unique(list: &mut Vec<String>, urls: impl IntoIterator<Item = String>) {
    for url in urls {
        if !list.contains(&url) {
            list.push(url);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_absent_keys_fall_back_to_defaults() {
        let mut stored = Map::new();
        stored.insert("sourcegraphURL".into(), json!("https://sg.example.com"));
        stored.insert("featureFlags".into(), json!({ "newInject": true }));

        let items = StorageItems::from_stored(stored).unwrap();

        assert_eq!(items.sourcegraph_url, "https://sg.example.com");
        assert_eq!(items.server_urls, vec![DEFAULT_SOURCEGRAPH_URL.to_string()]);
        assert!(items.feature_flags.new_inject);
        assert!(items.feature_flags.new_tooltips);
        assert!(items.open_file_on_sourcegraph);
        assert_eq!(items.identity, "");
    }

    #[test]
    fn test_unusable_stored_value_falls_back_to_default() {
        let mut stored = Map::new();
        stored.insert("featureFlags".into(), json!("broken"));
        stored.insert("serverUrls".into(), json!(42));
        stored.insert("identity".into(), json!("kept"));

        let items = StorageItems::from_stored(stored).unwrap();

        assert_eq!(items.feature_flags, FeatureFlags::default());
        assert_eq!(items.server_urls, vec![DEFAULT_SOURCEGRAPH_URL.to_string()]);
        assert_eq!(items.identity, "kept");
    }

    #[test]
    fn test_default_map_uses_stable_key_names() {
        let map = StorageItems::default_map();
        for key in [
            "sourcegraphURL",
            "serverUrls",
            "enterpriseUrls",
            "phabricatorURL",
            "repoLocations",
            "openFileOnSourcegraph",
            "featureFlags",
            "identity",
            "inlineSymbolSearchEnabled",
        ] {
            assert!(map.contains_key(key), "missing {}", key);
        }
    }

    #[test]
    fn test_merge_unique_keeps_order() {
        let mut list = vec!["https://a.com".to_string()];
        merge_unique(
            &mut list,
            vec!["https://b.com".to_string(), "https://a.com".to_string()],
        );
        assert_eq!(list, vec!["https://a.com", "https://b.com"]);
    }
}
