// Managed Permission Reconciliation
//
// Administrator-declared URLs need a runtime grant before the extension can
// act on them. Missing grants surface as a toolbar badge; clicking the
// toolbar button prompts for all of them at once.

use super::origin_pattern;
use crate::host::{BrowserActionApi, PermissionsApi};
use anyhow::Result;
use std::sync::Mutex;

pub const ATTENTION_BADGE: &str = "1";

pub struct BrowserActionState {
    default_popup: String,
    /// Origins the next toolbar click requests. Replaced, never stacked.
    pending_request: Mutex<Option<Vec<String>>>,
}

impl BrowserActionState {
    pub fn new(default_popup: impl Into<String>) -> Self {
        Self {
            default_popup: default_popup.into(),
            pending_request: Mutex::new(None),
        }
    }

    /// Clear the badge and restore the options popup
    pub async fn set_default<H>(&self, host: &H) -> Result<()>
    where
        H: BrowserActionApi + ?Sized,
    {
        host.set_badge_text("").await?;
        host.set_popup(&self.default_popup).await?;
        Ok(())
    }

    pub fn has_pending_request(&self) -> bool {
        self.pending().is_some()
    }

    /// Check every managed URL for a grant and surface the ones missing
    pub async fn reconcile<H>(&self, host: &H, managed_urls: &[String]) -> Result<()>
    where
        H: PermissionsApi + BrowserActionApi + ?Sized,
    {
        self.set_default(host).await?;
        if managed_urls.is_empty() {
            *self.pending_lock() = None;
            return Ok(());
        }

        let granted = host.get_all().await?;
        let missing: Vec<String> = managed_urls
            .iter()
            .map(|url| origin_pattern(url))
            .filter(|pattern| !granted.origins.contains(pattern))
            .collect();

        if missing.is_empty() {
            *self.pending_lock() = None;
            return self.set_default(host).await;
        }

        log::info!("Managed URLs lack permission: {:?}", missing);

        host.set_popup("").await?;
        host.set_badge_text(ATTENTION_BADGE).await?;
        *self.pending_lock() = Some(missing);

        Ok(())
    }

    /// Toolbar button clicked. Prompts for the pending origins, if any.
    pub async fn handle_click<H>(&self, host: &H) -> Result<()>
    where
        H: PermissionsApi + BrowserActionApi + ?Sized,
    {
        match self.take_pending_request() {
            Some(origins) => self.request_pending(host, origins).await,
            None => Ok(()),
        }
    }

    /// Consume the click handler. A second click before the prompt resolves
    /// finds nothing pending.
    pub fn take_pending_request(&self) -> Option<Vec<String>> {
        self.pending_lock().take()
    }

    /// Prompt for `origins` taken from the pending request
    pub async fn request_pending<H>(&self, host: &H, origins: Vec<String>) -> Result<()>
    where
        H: PermissionsApi + BrowserActionApi + ?Sized,
    {
        if host.request(origins.clone()).await? {
            log::info!("Managed permissions granted: {:?}", origins);
            return self.set_default(host).await;
        }

        log::info!("Managed permission request declined");

        // The badge is still showing, so keep the click armed
        let mut pending = self.pending_lock();
        if pending.is_none() {
            *pending = Some(origins);
        }
        Ok(())
    }

    fn pending(&self) -> Option<Vec<String>> {
        self.pending_lock().clone()
    }

    fn pending_lock(&self) -> std::sync::MutexGuard<'_, Option<Vec<String>>> {
        match self.pending_request.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
