// Storage Migrations
//
// Ordered, idempotent rewrites of the sync scope run once at startup.
// Each step sees the stored state left by the previous step. A failing step
// is logged and skipped; later steps still run.

use super::{Mutation, Storage, StorageArea};
use anyhow::Result;
use serde_json::{json, Map, Value};

/// A single migration step: inspect the stored keys, describe the rewrite
pub struct MigrationStep {
    pub name: &'static str,
    pub apply: fn(&Map<String, Value>, &mut Mutation) -> Result<()>,
}

/// Outcome of a migration run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationReport {
    pub applied: usize,
    pub failed: usize,
}

/// The sync scope migrations, in order
pub fn sync_migrations() -> Vec<MigrationStep> {
    vec![
        MigrationStep {
            name: "merge_phabricator_url",
            apply: merge_phabricator_url,
        },
        MigrationStep {
            name: "init_repo_locations",
            apply: init_repo_locations,
        },
        MigrationStep {
            name: "default_open_file_on_sourcegraph",
            apply: default_open_file_on_sourcegraph,
        },
        MigrationStep {
            name: "backfill_new_tooltips_flag",
            apply: backfill_new_tooltips_flag,
        },
        MigrationStep {
            name: "default_inline_symbol_search",
            apply: default_inline_symbol_search,
        },
    ]
}

/// Run `steps` against `area`, re-reading stored state between steps
pub async fn run_migrations(
    storage: &Storage,
    area: StorageArea,
    steps: &[MigrationStep],
) -> MigrationReport {
    let mut report = MigrationReport::default();

    for step in steps {
        let result = storage
            .update_raw(area, |items| {
                let mut mutation = Mutation::default();
                (step.apply)(items, &mut mutation)?;
                Ok(mutation)
            })
            .await;

        match result {
            Ok(()) => {
                log::debug!("Migration step {} done", step.name);
                report.applied += 1;
            }
            Err(e) => {
                log::warn!("Migration step {} failed, continuing: {}", step.name, e);
                report.failed += 1;
            }
        }
    }

    log::info!(
        "Storage migrations finished: {} applied, {} failed",
        report.applied,
        report.failed
    );

    report
}

fn merge_phabricator_url(items: &Map<String, Value>, m: &mut Mutation) -> Result<()> {
    let Some(phabricator_url) = items.get("phabricatorURL") else {
        return Ok(());
    };
    let phabricator_url = phabricator_url.as_str().unwrap_or_default().to_string();

    m.remove("phabricatorURL");
    if phabricator_url.is_empty() {
        return Ok(());
    }

    match items.get("enterpriseUrls").and_then(Value::as_array) {
        Some(urls) => {
            if !urls.iter().any(|u| u.as_str() == Some(phabricator_url.as_str())) {
                let mut urls = urls.clone();
                urls.push(Value::String(phabricator_url));
                m.set("enterpriseUrls", Value::Array(urls));
            }
        }
        None => m.set("enterpriseUrls", json!([phabricator_url])),
    }

    Ok(())
}

fn init_repo_locations(items: &Map<String, Value>, m: &mut Mutation) -> Result<()> {
    if !items.contains_key("repoLocations") {
        m.set("repoLocations", json!({}));
    }
    Ok(())
}

fn default_open_file_on_sourcegraph(items: &Map<String, Value>, m: &mut Mutation) -> Result<()> {
    if !items.contains_key("openFileOnSourcegraph") {
        m.set("openFileOnSourcegraph", json!(true));
    }
    Ok(())
}

fn backfill_new_tooltips_flag(items: &Map<String, Value>, m: &mut Mutation) -> Result<()> {
    let mut flags = match items.get("featureFlags") {
        Some(Value::Object(flags)) => flags.clone(),
        Some(other) => anyhow::bail!("featureFlags is not an object: {}", other),
        None => Map::new(),
    };

    if !flags.contains_key("newTooltips") {
        flags.insert("newTooltips".to_string(), json!(true));
        m.set("featureFlags", Value::Object(flags));
    }
    Ok(())
}

fn default_inline_symbol_search(items: &Map<String, Value>, m: &mut Mutation) -> Result<()> {
    if !items.contains_key("inlineSymbolSearchEnabled") {
        m.set("inlineSymbolSearchEnabled", json!(true));
    }
    Ok(())
}
