use std::io::{self, Write};

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::cli::RenderArgs;
use crate::model::EntityIdPattern;
use crate::store::{DB_FILE_NAME, find_run, latest_run, load_report_rows, open_store};
use crate::util::write_text;
use crate::wikitext::render_report;

pub fn run(args: RenderArgs) -> Result<()> {
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join(DB_FILE_NAME));
    if !db_path.exists() {
        bail!("debug dump not found: {}", db_path.display());
    }

    let connection = open_store(&db_path)?;
    let run = match &args.run_id {
        Some(run_id) => find_run(&connection, run_id)?
            .with_context(|| format!("run {run_id} not found in {}", db_path.display()))?,
        None => latest_run(&connection)?
            .with_context(|| format!("no runs stored in {}", db_path.display()))?,
    };

    let pattern = EntityIdPattern::new()?;
    let rows = load_report_rows(&connection, &run.run_id, &pattern)?;
    let rendered = render_report(&rows, run.started_at);

    if rendered.body_sha256 != run.body_sha256 {
        info!(
            stored = %run.body_sha256,
            rendered = %rendered.body_sha256,
            "re-rendered body differs from the stored digest"
        );
    }

    match &args.output_path {
        Some(path) => {
            write_text(path, &rendered.text)?;
            info!(path = %path.display(), run_id = %run.run_id, rows = rows.len(), "wrote rendered report");
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout
                .write_all(rendered.text.as_bytes())
                .context("failed to write report to stdout")?;
            stdout
                .write_all(b"\n")
                .context("failed to write report to stdout")?;
        }
    }

    Ok(())
}
