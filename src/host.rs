// Host Runtime Interface
//
// The browser APIs the background service consumes, expressed as async
// traits so the orchestration code can be driven by a real browser shim, the
// local bridge server, or a test double.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub type TabId = i64;

/// A set of host permissions, as reported by the permission API
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Permissions {
    #[serde(default)]
    pub origins: Vec<String>,
}

impl Permissions {
    pub fn origins(origins: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            origins: origins.into_iter().map(Into::into).collect(),
        }
    }
}

/// When an injected script runs relative to page load
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunAt {
    DocumentStart,
    DocumentEnd,
    DocumentIdle,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InjectDetails {
    pub file: String,
    pub run_at: RunAt,
    pub origin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InsertCssDetails {
    pub file: String,
    pub origin: Option<String>,
    /// Origins the stylesheet may apply to
    pub allow: Vec<String>,
    /// Origins the stylesheet must never apply to; wins over `allow`
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum TabStatus {
    Loading,
    Complete,
}

/// Callbacks the browser delivers to the background page
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    Installed,
    PermissionsAdded(Permissions),
    PermissionsRemoved(Permissions),
    TabUpdated {
        tab_id: TabId,
        status: Option<TabStatus>,
        url: Option<String>,
    },
    BrowserActionClicked,
}

#[async_trait]
pub trait PermissionsApi: Send + Sync {
    /// Every origin currently granted
    async fn get_all(&self) -> anyhow::Result<Permissions>;
    /// Prompt for `origins`; `false` means the user declined
    async fn request(&self, origins: Vec<String>) -> anyhow::Result<bool>;
    async fn remove(&self, origin: &str) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait TabsApi: Send + Sync {
    async fn execute_script(&self, tab_id: TabId, details: InjectDetails) -> anyhow::Result<()>;
    async fn insert_css(&self, tab_id: Option<TabId>, details: InsertCssDetails) -> anyhow::Result<()>;
}

#[async_trait]
pub trait BrowserActionApi: Send + Sync {
    async fn set_badge_text(&self, text: &str) -> anyhow::Result<()>;
    async fn set_popup(&self, popup: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait OmniboxApi: Send + Sync {
    async fn set_default_suggestion(&self, description: &str) -> anyhow::Result<()>;
}

/// Everything the background service needs from the browser
pub trait BrowserHost: PermissionsApi + TabsApi + BrowserActionApi + OmniboxApi + 'static {}

impl<T> BrowserHost for T where T: PermissionsApi + TabsApi + BrowserActionApi + OmniboxApi + 'static {}

#[cfg(test)]
pub mod testing {
    //! Recording host used by the unit tests.

    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum HostCall {
        Request(Vec<String>),
        Remove(String),
        ExecuteScript(TabId, InjectDetails),
        InsertCss(Option<TabId>, InsertCssDetails),
        BadgeText(String),
        Popup(String),
        Suggestion(String),
    }

    #[derive(Default)]
    pub struct FakeHost {
        pub granted: Mutex<Vec<String>>,
        /// Answer to every permission prompt
        pub grant_requests: Mutex<bool>,
        /// Leave permission prompts open forever
        pub hold_requests: Mutex<bool>,
        pub calls: Mutex<Vec<HostCall>>,
    }

    impl FakeHost {
        pub fn with_granted(origins: &[&str]) -> Self {
            let host = Self::default();
            *host.granted.lock().unwrap() = origins.iter().map(|o| o.to_string()).collect();
            host
        }

        pub fn set_grant_requests(&self, grant: bool) {
            *self.grant_requests.lock().unwrap() = grant;
        }

        pub fn set_hold_requests(&self, hold: bool) {
            *self.hold_requests.lock().unwrap() = hold;
        }

        pub fn calls(&self) -> Vec<HostCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn clear_calls(&self) {
            self.calls.lock().unwrap().clear();
        }

        pub fn last_badge(&self) -> Option<String> {
            self.calls().into_iter().rev().find_map(|c| match c {
                HostCall::BadgeText(text) => Some(text),
                _ => None,
            })
        }

        pub fn last_popup(&self) -> Option<String> {
            self.calls().into_iter().rev().find_map(|c| match c {
                HostCall::Popup(popup) => Some(popup),
                _ => None,
            })
        }

        fn record(&self, call: HostCall) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl PermissionsApi for FakeHost {
        async fn get_all(&self) -> anyhow::Result<Permissions> {
            Ok(Permissions {
                origins: self.granted.lock().unwrap().clone(),
            })
        }

        async fn request(&self, origins: Vec<String>) -> anyhow::Result<bool> {
            self.record(HostCall::Request(origins.clone()));
            let hold = *self.hold_requests.lock().unwrap();
            if hold {
                std::future::pending::<()>().await;
            }
            let grant = *self.grant_requests.lock().unwrap();
            if grant {
                let mut granted = self.granted.lock().unwrap();
                for origin in origins {
                    if !granted.contains(&origin) {
                        granted.push(origin);
                    }
                }
            }
            Ok(grant)
        }

        async fn remove(&self, origin: &str) -> anyhow::Result<bool> {
            self.record(HostCall::Remove(origin.to_string()));
            let mut granted = self.granted.lock().unwrap();
            let before = granted.len();
            granted.retain(|o| o != origin);
            Ok(granted.len() != before)
        }
    }

    #[async_trait]
    impl TabsApi for FakeHost {
        async fn execute_script(&self, tab_id: TabId, details: InjectDetails) -> anyhow::Result<()> {
            self.record(HostCall::ExecuteScript(tab_id, details));
            Ok(())
        }

        async fn insert_css(&self, tab_id: Option<TabId>, details: InsertCssDetails) -> anyhow::Result<()> {
            self.record(HostCall::InsertCss(tab_id, details));
            Ok(())
        }
    }

    #[async_trait]
    impl BrowserActionApi for FakeHost {
        async fn set_badge_text(&self, text: &str) -> anyhow::Result<()> {
            self.record(HostCall::BadgeText(text.to_string()));
            Ok(())
        }

        async fn set_popup(&self, popup: &str) -> anyhow::Result<()> {
            self.record(HostCall::Popup(popup.to_string()));
            Ok(())
        }
    }

    #[async_trait]
    impl OmniboxApi for FakeHost {
        async fn set_default_suggestion(&self, description: &str) -> anyhow::Result<()> {
            self.record(HostCall::Suggestion(description.to_string()));
            Ok(())
        }
    }
}
