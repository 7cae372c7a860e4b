use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::cli::ReportArgs;
use crate::http::{build_client, user_agent};
use crate::mediawiki::MediaWikiClient;
use crate::model::{
    EntityIdPattern, ReportCounts, ReportPaths, ReportRunManifest, ReportRunSnapshot,
};
use crate::pipeline::{PipelineOptions, StepTracker, collect_report};
use crate::store::{DB_FILE_NAME, StoredRun, open_store, save_run};
use crate::util::{
    ensure_directory, now_utc_string, run_manifests_newest_first, utc_compact_string,
    write_json_pretty, write_text,
};
use crate::wcqs::WcqsClient;
use crate::wikitext::render_report;

struct BotCredentials {
    username: String,
    password: String,
}

#[derive(Default)]
struct RunState {
    counts: ReportCounts,
    body_sha256: Option<String>,
    edit_submitted: bool,
    new_revision_id: Option<u64>,
}

pub fn run(args: ReportArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = format!("run-{}", utc_compact_string(started_ts));

    let cache_root = args.cache_root.clone();
    let manifest_dir = cache_root.join("manifests");
    ensure_directory(&manifest_dir)?;

    let manifest_path = args.manifest_path.clone().unwrap_or_else(|| {
        manifest_dir.join(format!(
            "report_run_{}.json",
            utc_compact_string(started_ts)
        ))
    });
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| cache_root.join(DB_FILE_NAME));
    let output_path = match (&args.output_path, args.dry_run) {
        (Some(path), _) => Some(path.clone()),
        (None, true) => Some(cache_root.join("report.wiki")),
        (None, false) => None,
    };

    info!(cache_root = %cache_root.display(), run_id = %run_id, dry_run = args.dry_run, "starting report run");

    // Read before this run's manifest lands in the same directory.
    let previous_digest = if args.skip_unchanged {
        previous_published_digest(&manifest_dir)?
    } else {
        None
    };

    let mut steps = StepTracker::default();
    let mut state = RunState::default();
    let result = execute(
        &args,
        &run_id,
        started_ts,
        &db_path,
        output_path.as_deref(),
        previous_digest.as_deref(),
        &mut steps,
        &mut state,
    );

    let (status, failed_step, failure_reason) = match &result {
        Ok(()) => ("completed", None, None),
        Err(err) => (
            "failed",
            steps.current().map(ToOwned::to_owned),
            Some(format!("{err:#}")),
        ),
    };

    let manifest = ReportRunManifest {
        manifest_version: 1,
        run_id: run_id.clone(),
        status: status.to_string(),
        started_at,
        updated_at: now_utc_string(),
        completed_steps: steps.completed().to_vec(),
        failed_step,
        failure_reason,
        command: render_report_command(&args),
        page_title: args.page_title.clone(),
        dry_run: args.dry_run,
        edit_submitted: state.edit_submitted,
        new_revision_id: state.new_revision_id,
        body_sha256: state.body_sha256,
        counts: state.counts,
        paths: ReportPaths {
            cache_root: cache_root.display().to_string(),
            db_path: db_path.display().to_string(),
            manifest_path: manifest_path.display().to_string(),
            output_path: output_path.map(|path| path.display().to_string()),
        },
    };

    match write_json_pretty(&manifest_path, &manifest) {
        Ok(()) => info!(path = %manifest_path.display(), status, "wrote report run manifest"),
        Err(err) if result.is_err() => {
            warn!(error = %err, "failed to write manifest for failed run");
        }
        Err(err) => return Err(err),
    }

    result
}

#[allow(clippy::too_many_arguments)]
fn execute(
    args: &ReportArgs,
    run_id: &str,
    started_ts: DateTime<Utc>,
    db_path: &Path,
    output_path: Option<&Path>,
    previous_digest: Option<&str>,
    steps: &mut StepTracker,
    state: &mut RunState,
) -> Result<()> {
    steps.begin("read-credentials");
    let token = read_wcqs_token(&args.token_path)?;
    let credentials = if args.dry_run {
        None
    } else {
        Some(bot_credentials(args)?)
    };

    let pattern = EntityIdPattern::new()?;
    let agent = user_agent(args.contact.as_deref());
    let http = build_client(&agent, Duration::from_secs(args.timeout_secs))
        .context("failed to build HTTP client")?;
    let wcqs = WcqsClient::new(http.clone(), &args.wcqs_endpoint, &token, pattern.clone());
    let wikidata = MediaWikiClient::new(http, &args.wikidata_api, pattern.clone());

    let options = PipelineOptions {
        deleted_since: args.deleted_since,
        chunk_size: args.chunk_size,
        reference_chunk_size: args.reference_chunk_size,
        chunk_pause: Duration::from_millis(args.chunk_pause_ms),
    };
    let outcome = collect_report(&wikidata, &wcqs, &wikidata, &options, &pattern, steps)?;
    state.counts = outcome.counts.clone();

    steps.begin("render-report");
    let rendered = render_report(&outcome.rows, Utc::now());
    state.body_sha256 = Some(rendered.body_sha256.clone());

    // Debug dump lands before the edit so a failed submission can be inspected.
    steps.begin("store-dump");
    let mut connection = open_store(db_path)?;
    save_run(
        &mut connection,
        &StoredRun {
            run_id: run_id.to_string(),
            started_at: started_ts,
            candidates: outcome.counts.candidates,
            body_sha256: rendered.body_sha256.clone(),
        },
        &outcome.references,
        &outcome.rows,
    )?;
    info!(path = %db_path.display(), rows = outcome.rows.len(), "wrote debug dump");

    if let Some(path) = output_path {
        write_text(path, &rendered.text)?;
        info!(path = %path.display(), "wrote rendered report");
    }

    let Some(credentials) = credentials else {
        info!("dry run; skipping page edit");
        steps.finish();
        return Ok(());
    };

    if previous_digest == Some(rendered.body_sha256.as_str()) {
        info!(body_sha256 = %rendered.body_sha256, "report body unchanged since last run; skipping page edit");
        steps.finish();
        return Ok(());
    }

    steps.begin("submit-edit");
    wikidata
        .login(&credentials.username, &credentials.password)
        .context("failed to log in to wikidata")?;
    let csrf_token = wikidata
        .csrf_token()
        .context("failed to fetch csrf token")?;
    let edit = wikidata
        .replace_page(&args.page_title, &rendered.text, &args.summary, &csrf_token)
        .with_context(|| format!("failed to save {}", args.page_title))?;

    state.edit_submitted = true;
    state.new_revision_id = edit.new_revision_id;
    if edit.no_change {
        info!(title = %args.page_title, "report page already up to date");
    } else {
        info!(
            title = %args.page_title,
            revision = edit.new_revision_id.unwrap_or_default(),
            "report successfully written"
        );
    }

    steps.finish();
    Ok(())
}

fn read_wcqs_token(path: &Path) -> Result<String> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            bail!(
                "token file with WCQS credentials not found: {}",
                path.display()
            )
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };

    let token = raw.trim().to_string();
    if token.is_empty() {
        bail!("token file is empty: {}", path.display());
    }
    Ok(token)
}

fn bot_credentials(args: &ReportArgs) -> Result<BotCredentials> {
    match (&args.bot_username, &args.bot_password) {
        (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
            Ok(BotCredentials {
                username: username.clone(),
                password: password.clone(),
            })
        }
        _ => bail!(
            "bot credentials missing; set SDC_REPORT_BOT_USERNAME and SDC_REPORT_BOT_PASSWORD or pass --dry-run"
        ),
    }
}

/// Body digest currently on the wiki according to the newest completed, non-dry-run manifest.
fn previous_published_digest(manifest_dir: &Path) -> Result<Option<String>> {
    for path in run_manifests_newest_first(manifest_dir)? {
        let raw = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let snapshot: ReportRunSnapshot = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        if let Some(digest) = published_digest(&snapshot) {
            return Ok(Some(digest));
        }
    }

    Ok(None)
}

fn published_digest(snapshot: &ReportRunSnapshot) -> Option<String> {
    let completed = snapshot.status.as_deref() == Some("completed");
    let published = snapshot.dry_run == Some(false);
    if completed && published {
        snapshot.body_sha256.clone()
    } else {
        None
    }
}

fn render_report_command(args: &ReportArgs) -> String {
    let mut command = vec![
        "sdc-deleted-report".to_string(),
        "report".to_string(),
        "--cache-root".to_string(),
        args.cache_root.display().to_string(),
        "--chunk-size".to_string(),
        args.chunk_size.to_string(),
    ];

    let optional_paths: [(&str, &Option<PathBuf>); 3] = [
        ("--db-path", &args.db_path),
        ("--manifest-path", &args.manifest_path),
        ("--output-path", &args.output_path),
    ];
    for (flag, path) in optional_paths {
        if let Some(path) = path {
            command.push(flag.to_string());
            command.push(path.display().to_string());
        }
    }
    if let Some(since) = args.deleted_since {
        command.push("--deleted-since".to_string());
        command.push(since.to_rfc3339());
    }
    if args.dry_run {
        command.push("--dry-run".to_string());
    }
    if args.skip_unchanged {
        command.push("--skip-unchanged".to_string());
    }

    command.join(" ")
}
