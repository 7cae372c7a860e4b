use std::fmt;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const HIDDEN_USER: &str = "(hidden)";

/// Wikidata item identifier, ordered by its numeric part so that `Q9 < Q10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(u64);

impl EntityId {
    #[cfg(test)]
    pub fn from_number(number: u64) -> Self {
        Self(number)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Q{}", self.0)
    }
}

/// Compiled matcher for item titles; build once per stage and reuse.
#[derive(Debug, Clone)]
pub struct EntityIdPattern {
    pattern: Regex,
}

impl EntityIdPattern {
    pub fn new() -> Result<Self> {
        let pattern =
            Regex::new(r"^Q([1-9][0-9]{0,18})$").context("failed to compile entity id regex")?;
        Ok(Self { pattern })
    }

    pub fn parse(&self, raw: &str) -> Option<EntityId> {
        let captures = self.pattern.captures(raw.trim())?;
        captures
            .get(1)
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .map(EntityId)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionRecord {
    pub entity: EntityId,
    pub deleted_by: String,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubjectKind {
    MediaInfo,
    Statement,
    Reference,
    Other,
}

impl SubjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MediaInfo => "media_info",
            Self::Statement => "statement",
            Self::Reference => "reference",
            Self::Other => "other",
        }
    }

    /// Statement and reference nodes tie an entity to an actual SDC claim.
    /// Unrecognized subjects never qualify an entity.
    pub fn is_claim_node(self) -> bool {
        matches!(self, Self::Statement | Self::Reference)
    }
}

/// One SDC triple whose object is a Wikidata entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityReference {
    pub entity: EntityId,
    pub subject: String,
    pub subject_kind: SubjectKind,
    pub predicate: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntityStatus {
    Live,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    pub entity: EntityId,
    pub deleted_by: String,
    pub deleted_at: DateTime<Utc>,
    pub uses: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReportCounts {
    pub candidates: usize,
    pub references_total: usize,
    pub orphaned_references: usize,
    pub referenced_entities: usize,
    pub live_entities: usize,
    pub deleted_entities: usize,
    pub rows_total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportPaths {
    pub cache_root: String,
    pub db_path: String,
    pub manifest_path: String,
    pub output_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub completed_steps: Vec<String>,
    pub failed_step: Option<String>,
    pub failure_reason: Option<String>,
    pub command: String,
    pub page_title: String,
    pub dry_run: bool,
    pub edit_submitted: bool,
    pub new_revision_id: Option<u64>,
    pub body_sha256: Option<String>,
    pub counts: ReportCounts,
    pub paths: ReportPaths,
}

/// Loose view of a run manifest for `status` and `--skip-unchanged`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportRunSnapshot {
    pub run_id: Option<String>,
    pub status: Option<String>,
    pub started_at: Option<String>,
    pub updated_at: Option<String>,
    pub failed_step: Option<String>,
    pub failure_reason: Option<String>,
    pub page_title: Option<String>,
    pub dry_run: Option<bool>,
    pub edit_submitted: Option<bool>,
    pub new_revision_id: Option<u64>,
    pub body_sha256: Option<String>,
    pub counts: Option<ReportCountsSnapshot>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportCountsSnapshot {
    pub candidates: Option<usize>,
    pub references_total: Option<usize>,
    pub rows_total: Option<usize>,
}
