use std::fs;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::model::ReportRunSnapshot;
use crate::store::{DB_FILE_NAME, count_rows, latest_run, open_store};
use crate::util::latest_run_manifest;

pub fn run(args: StatusArgs) -> Result<()> {
    let manifest_dir = args.cache_root.join("manifests");
    let db_path = args.cache_root.join(DB_FILE_NAME);

    info!(cache_root = %args.cache_root.display(), "status requested");

    match latest_run_manifest(&manifest_dir)? {
        Some(path) => {
            let raw = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
            let state: ReportRunSnapshot = serde_json::from_slice(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            let counts = state.counts.unwrap_or_default();

            info!(
                path = %path.display(),
                run_id = %state.run_id.unwrap_or_default(),
                status = %state.status.unwrap_or_default(),
                started_at = %state.started_at.unwrap_or_default(),
                updated_at = %state.updated_at.unwrap_or_default(),
                failed_step = %state.failed_step.unwrap_or_default(),
                failure_reason = %state.failure_reason.unwrap_or_default(),
                page_title = %state.page_title.unwrap_or_default(),
                dry_run = state.dry_run.unwrap_or_default(),
                edit_submitted = state.edit_submitted.unwrap_or_default(),
                new_revision_id = state.new_revision_id.unwrap_or_default(),
                body_sha256 = %state.body_sha256.unwrap_or_default(),
                candidates = counts.candidates.unwrap_or_default(),
                references_total = counts.references_total.unwrap_or_default(),
                rows_total = counts.rows_total.unwrap_or_default(),
                "loaded latest run manifest"
            );
        }
        None => warn!(path = %manifest_dir.display(), "no run manifests found"),
    }

    if db_path.exists() {
        let connection = open_store(&db_path)?;
        let runs = count_rows(&connection, "SELECT COUNT(*) FROM runs").unwrap_or(0);
        let references =
            count_rows(&connection, "SELECT COUNT(*) FROM entity_references").unwrap_or(0);

        match latest_run(&connection)? {
            Some(latest) => info!(
                path = %db_path.display(),
                runs,
                references,
                latest_run_id = %latest.run_id,
                latest_started_at = %latest.started_at,
                latest_candidates = latest.candidates,
                latest_references = latest.references_total,
                latest_rows = latest.rows_total,
                "debug dump status"
            ),
            None => info!(path = %db_path.display(), runs, references, "debug dump is empty"),
        }
    } else {
        warn!(path = %db_path.display(), "debug dump missing");
    }

    Ok(())
}
