use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};

use crate::mediawiki::WIKIDATA_API;
use crate::wcqs::WCQS_ENDPOINT;
use crate::wikitext::REPORT_PAGE_TITLE;

#[derive(Parser, Debug)]
#[command(
    name = "sdc-deleted-report",
    version,
    about = "Report deleted Wikidata entities still used in Structured Data on Commons"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Query, verify and publish the report page.
    Report(ReportArgs),
    /// Re-render a stored run from the debug dump.
    Render(RenderArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ReportArgs {
    #[arg(long, default_value = ".cache/sdc-deleted-report")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub manifest_path: Option<PathBuf>,

    /// File holding the `wcqsOauth` cookie value.
    #[arg(long, default_value = "./token")]
    pub token_path: PathBuf,

    #[arg(long, env = "SDC_REPORT_BOT_USERNAME")]
    pub bot_username: Option<String>,

    #[arg(long, env = "SDC_REPORT_BOT_PASSWORD", hide_env_values = true)]
    pub bot_password: Option<String>,

    #[arg(long, default_value = WCQS_ENDPOINT)]
    pub wcqs_endpoint: String,

    #[arg(long, default_value = WIKIDATA_API)]
    pub wikidata_api: String,

    #[arg(long, default_value = REPORT_PAGE_TITLE)]
    pub page_title: String,

    #[arg(long, default_value = "upd")]
    pub summary: String,

    #[arg(long, default_value_t = 10_000)]
    pub chunk_size: usize,

    #[arg(long, default_value_t = 1_000)]
    pub reference_chunk_size: usize,

    #[arg(long, default_value_t = 2_000)]
    pub chunk_pause_ms: u64,

    /// Only consider deletions logged at or after this RFC 3339 time.
    #[arg(long)]
    pub deleted_since: Option<DateTime<Utc>>,

    #[arg(long, default_value_t = 300)]
    pub timeout_secs: u64,

    /// Contact appended to the User-Agent, e.g. `User:Example`.
    #[arg(long)]
    pub contact: Option<String>,

    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    #[arg(long)]
    pub output_path: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub skip_unchanged: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RenderArgs {
    #[arg(long, default_value = ".cache/sdc-deleted-report")]
    pub cache_root: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,

    #[arg(long)]
    pub run_id: Option<String>,

    #[arg(long)]
    pub output_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/sdc-deleted-report")]
    pub cache_root: PathBuf,
}
