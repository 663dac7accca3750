// Background Configuration
//
// Startup settings for the background service and the administrator policy
// file that feeds the managed storage area.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

pub const INJECT_BUNDLE: &str = "js/inject.bundle.js";
pub const DEFAULT_POPUP: &str = "options.html?popup=true";
pub const UNINSTALL_URL: &str = "https://about.sourcegraph.com/uninstall/";

/// A content script declared in the extension manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContentScript {
    #[serde(default)]
    pub matches: Vec<String>,
    #[serde(default)]
    pub js: Vec<String>,
    #[serde(default)]
    pub css: Vec<String>,
}

/// Background service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    pub database_path: PathBuf,
    /// Administrator policy JSON, mirrored into the managed area at startup
    pub managed_policy_path: Option<PathBuf>,
    pub content_scripts: Vec<ContentScript>,
    pub inject_bundle: String,
    pub default_popup: String,
    /// Loopback port of the bridge server, 0 picks a random one
    pub bridge_port: u16,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            database_path: default_data_dir().join("background.db"),
            managed_policy_path: None,
            content_scripts: Vec::new(),
            inject_bundle: INJECT_BUNDLE.to_string(),
            default_popup: DEFAULT_POPUP.to_string(),
            bridge_port: 0,
        }
    }
}

impl BackgroundConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        let config = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config {:?}", path))?;
        Ok(config)
    }

    /// Origins the manifest already injects the content script into.
    /// Only scripts that declare JavaScript count.
    pub fn static_content_script_origins(&self) -> Vec<String> {
        let mut origins = Vec::new();
        for script in &self.content_scripts {
            if script.js.is_empty() || script.matches.is_empty() {
                continue;
            }
            origins.extend(script.matches.iter().cloned());
        }
        origins
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default())
        .join("sourcegraph-background")
}

/// Administrator-provided settings, highest priority when present
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enterprise_urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_urls: Option<Vec<String>>,
    /// Any other storage key the administrator pins
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl ManagedPolicy {
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read managed policy {:?}", path))?;
        let policy = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse managed policy {:?}", path))?;
        Ok(policy)
    }

    /// The policy as managed storage items
    pub fn into_items(self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => anyhow::bail!("Managed policy is not an object: {}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_static_origins_skip_css_only_scripts() {
        let config = BackgroundConfig {
            content_scripts: vec![
                ContentScript {
                    matches: vec!["https://github.com/*".into()],
                    js: vec!["js/inject.bundle.js".into()],
                    css: vec![],
                },
                ContentScript {
                    matches: vec!["https://gitlab.com/*".into()],
                    js: vec![],
                    css: vec!["css/style.css".into()],
                },
            ],
            ..Default::default()
        };

        assert_eq!(config.static_content_script_origins(), vec!["https://github.com/*"]);
    }

    #[test]
    fn test_managed_policy_keeps_extra_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"enterpriseUrls": ["https://ghe.example.com"], "disableExtension": true}}"#
        )
        .unwrap();

        let policy = ManagedPolicy::load(file.path()).unwrap();
        assert_eq!(
            policy.enterprise_urls,
            Some(vec!["https://ghe.example.com".to_string()])
        );
        assert_eq!(policy.server_urls, None);

        let items = policy.into_items().unwrap();
        assert!(items.contains_key("enterpriseUrls"));
        assert!(items.contains_key("disableExtension"));
        assert!(!items.contains_key("serverUrls"));
    }
}
