// Tab Injection
//
// Injects the content script into finished page loads on permitted origins
// the manifest does not already cover.

use crate::host::{InjectDetails, RunAt, TabId, TabStatus, TabsApi};
use crate::permissions::{strip_wildcard, ALL_URLS};
use anyhow::Result;

/// Whether a permitted origin pattern applies to `url`
pub fn origin_matches(origin: &str, url: Option<&str>) -> bool {
    if origin == ALL_URLS {
        return true;
    }
    match url {
        Some(url) => url.starts_with(strip_wildcard(origin)),
        None => false,
    }
}

/// Handle a tab update. Returns how many injections were issued.
pub async fn handle_tab_updated<T>(
    tabs: &T,
    inject_bundle: &str,
    permitted_origins: &[String],
    tab_id: TabId,
    status: Option<TabStatus>,
    url: Option<&str>,
) -> Result<usize>
where
    T: TabsApi + ?Sized,
{
    if status != Some(TabStatus::Complete) {
        return Ok(0);
    }

    let mut injected = 0;
    for origin in permitted_origins {
        if !origin_matches(origin, url) {
            continue;
        }

        log::debug!("Injecting {} into tab {} for {}", inject_bundle, tab_id, origin);

        tabs.execute_script(
            tab_id,
            InjectDetails {
                file: inject_bundle.to_string(),
                run_at: RunAt::DocumentEnd,
                origin: origin.clone(),
            },
        )
        .await?;
        injected += 1;
    }

    Ok(injected)
}
