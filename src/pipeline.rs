use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::http::ClientError;
use crate::model::{
    DeletionRecord, EntityId, EntityIdPattern, EntityReference, EntityStatus, HIDDEN_USER,
    ReportCounts, ReportRow, SubjectKind,
};

/// `wbgetentities` accepts at most 50 ids per request for non-bot sessions.
pub const VERIFY_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionLogEntry {
    pub title: String,
    pub user: Option<String>,
    pub timestamp: DateTime<Utc>,
}

pub trait DeletionLog {
    fn deletion_entries(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DeletionLogEntry>, ClientError>;
}

pub trait UsageSource {
    /// SDC triples whose object is one of `entities`.
    fn references_to(&self, entities: &[EntityId]) -> Result<Vec<EntityReference>, ClientError>;

    /// Subset of `reference_hashes` no statement derives from anymore.
    fn orphaned_references(
        &self,
        reference_hashes: &[String],
    ) -> Result<Vec<String>, ClientError>;
}

pub trait ExistenceOracle {
    fn statuses(
        &self,
        entities: &[EntityId],
    ) -> Result<Vec<(EntityId, EntityStatus)>, ClientError>;
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub deleted_since: Option<DateTime<Utc>>,
    pub chunk_size: usize,
    pub reference_chunk_size: usize,
    pub chunk_pause: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            deleted_since: None,
            chunk_size: 10_000,
            reference_chunk_size: 1_000,
            chunk_pause: Duration::from_secs(2),
        }
    }
}

/// Records which step is running so a failed run can name it.
#[derive(Debug, Default)]
pub struct StepTracker {
    current: Option<&'static str>,
    completed: Vec<String>,
}

impl StepTracker {
    pub fn begin(&mut self, step: &'static str) {
        if let Some(previous) = self.current.replace(step) {
            self.completed.push(previous.to_string());
        }
    }

    pub fn finish(&mut self) {
        if let Some(previous) = self.current.take() {
            self.completed.push(previous.to_string());
        }
    }

    pub fn current(&self) -> Option<&'static str> {
        self.current
    }

    pub fn completed(&self) -> &[String] {
        &self.completed
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub references: Vec<EntityReference>,
    pub rows: Vec<ReportRow>,
    pub counts: ReportCounts,
}

pub fn collect_report(
    log: &impl DeletionLog,
    usage: &impl UsageSource,
    oracle: &impl ExistenceOracle,
    options: &PipelineOptions,
    pattern: &EntityIdPattern,
    steps: &mut StepTracker,
) -> Result<PipelineOutcome> {
    steps.begin("collect-candidates");
    let deletions = deletion_candidates(log, options.deleted_since, pattern)?;
    let candidates: Vec<EntityId> = deletions.keys().copied().collect();
    info!(candidates = candidates.len(), "found deleted items");

    steps.begin("query-references");
    let references = query_references(usage, &candidates, options)?;
    let references_total = references.len();

    steps.begin("validate-references");
    let (references, orphaned_references) = drop_orphaned_references(usage, references, options)?;

    steps.begin("verify-entities");
    let referenced: Vec<EntityId> = references
        .iter()
        .map(|reference| reference.entity)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let statuses = verify_entities(oracle, &referenced)?;

    steps.begin("assemble-report");
    let rows = assemble_rows(&references, &deletions, &statuses)?;

    let deleted_entities = statuses
        .values()
        .filter(|status| **status == EntityStatus::Deleted)
        .count();
    let counts = ReportCounts {
        candidates: candidates.len(),
        references_total,
        orphaned_references,
        referenced_entities: referenced.len(),
        live_entities: referenced.len() - deleted_entities,
        deleted_entities,
        rows_total: rows.len(),
    };
    info!(rows = rows.len(), "found cases to list on report page");

    Ok(PipelineOutcome {
        references,
        rows,
        counts,
    })
}

/// Latest deletion per item; titles that are not items are ignored.
pub fn deletion_candidates(
    log: &impl DeletionLog,
    since: Option<DateTime<Utc>>,
    pattern: &EntityIdPattern,
) -> Result<BTreeMap<EntityId, DeletionRecord>> {
    let entries = log
        .deletion_entries(since)
        .context("failed to read the wikidata deletion log")?;
    Ok(latest_deletions(entries, pattern))
}

fn latest_deletions(
    entries: Vec<DeletionLogEntry>,
    pattern: &EntityIdPattern,
) -> BTreeMap<EntityId, DeletionRecord> {
    let mut latest = BTreeMap::<EntityId, DeletionRecord>::new();

    for entry in entries {
        let Some(entity) = pattern.parse(&entry.title) else {
            continue;
        };

        let record = DeletionRecord {
            entity,
            deleted_by: entry.user.unwrap_or_else(|| HIDDEN_USER.to_string()),
            deleted_at: entry.timestamp,
        };
        let newer = latest
            .get(&entity)
            .is_none_or(|existing| existing.deleted_at < record.deleted_at);
        if newer {
            latest.insert(entity, record);
        }
    }

    latest
}

pub fn query_references(
    source: &impl UsageSource,
    candidates: &[EntityId],
    options: &PipelineOptions,
) -> Result<Vec<EntityReference>> {
    let mut references = BTreeSet::new();
    let chunk_size = options.chunk_size.max(1);
    let total = candidates.len();

    for (index, chunk) in candidates.chunks(chunk_size).enumerate() {
        let offset = index * chunk_size;
        if index > 0 && !options.chunk_pause.is_zero() {
            thread::sleep(options.chunk_pause);
        }

        info!(
            offset,
            total,
            percent = %format!("{:.2}", offset as f64 / total as f64 * 100.0),
            "querying sdc usage"
        );
        let found = source.references_to(chunk).with_context(|| {
            format!(
                "usage query failed for candidates {offset}..{}",
                offset + chunk.len()
            )
        })?;
        info!(results = found.len(), "usage query returned");
        references.extend(found);
    }

    Ok(references.into_iter().collect())
}

/// Drop references whose subject is a reference node no statement uses.
pub fn drop_orphaned_references(
    source: &impl UsageSource,
    references: Vec<EntityReference>,
    options: &PipelineOptions,
) -> Result<(Vec<EntityReference>, usize)> {
    let hashes: Vec<String> = references
        .iter()
        .filter(|reference| reference.subject_kind == SubjectKind::Reference)
        .map(|reference| reference.subject.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    if hashes.is_empty() {
        return Ok((references, 0));
    }

    let mut orphaned = HashSet::new();
    for (index, chunk) in hashes.chunks(options.reference_chunk_size.max(1)).enumerate() {
        if index > 0 && !options.chunk_pause.is_zero() {
            thread::sleep(options.chunk_pause);
        }
        let found = source
            .orphaned_references(chunk)
            .context("reference node validation query failed")?;
        orphaned.extend(found);
    }
    info!(
        checked = hashes.len(),
        orphaned = orphaned.len(),
        "validated reference nodes"
    );

    let before = references.len();
    let kept: Vec<EntityReference> = references
        .into_iter()
        .filter(|reference| {
            reference.subject_kind != SubjectKind::Reference
                || !orphaned.contains(&reference.subject)
        })
        .collect();
    let dropped = before - kept.len();

    Ok((kept, dropped))
}

/// Every requested entity must come back with a status; gaps are errors.
pub fn verify_entities(
    oracle: &impl ExistenceOracle,
    entities: &[EntityId],
) -> Result<BTreeMap<EntityId, EntityStatus>> {
    let mut statuses = BTreeMap::new();

    for batch in entities.chunks(VERIFY_BATCH_SIZE) {
        let answered = oracle.statuses(batch).with_context(|| {
            format!("existence check failed for batch starting at {}", batch[0])
        })?;
        let requested: HashSet<EntityId> = batch.iter().copied().collect();

        for (entity, status) in answered {
            if requested.contains(&entity) {
                statuses.insert(entity, status);
            } else {
                warn!(entity = %entity, "existence check answered an unrequested entity");
            }
        }
    }

    if let Some(missing) = entities.iter().find(|entity| !statuses.contains_key(entity)) {
        bail!("existence check returned no status for {missing}");
    }

    Ok(statuses)
}

/// Rows for deleted entities with at least one statement or reference use.
pub fn assemble_rows(
    references: &[EntityReference],
    deletions: &BTreeMap<EntityId, DeletionRecord>,
    statuses: &BTreeMap<EntityId, EntityStatus>,
) -> Result<Vec<ReportRow>> {
    let mut uses = HashMap::<EntityId, usize>::new();
    let mut qualifying = BTreeSet::<EntityId>::new();

    for reference in references {
        *uses.entry(reference.entity).or_default() += 1;
        if reference.subject_kind.is_claim_node() {
            qualifying.insert(reference.entity);
        }
    }

    let mut rows = Vec::with_capacity(qualifying.len());
    for entity in qualifying {
        match statuses.get(&entity) {
            Some(EntityStatus::Deleted) => {}
            Some(EntityStatus::Live) => continue,
            None => bail!("no existence status for referenced entity {entity}"),
        }

        let record = deletions
            .get(&entity)
            .with_context(|| format!("no deletion record for {entity}"))?;
        rows.push(ReportRow {
            entity,
            deleted_by: record.deleted_by.clone(),
            deleted_at: record.deleted_at,
            uses: uses.get(&entity).copied().unwrap_or_default(),
        });
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use chrono::TimeZone;

    use super::*;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, day, 12, 0, 0).unwrap()
    }

    fn q(number: u64) -> EntityId {
        EntityId::from_number(number)
    }

    fn reference(entity: u64, subject: &str, kind: SubjectKind) -> EntityReference {
        EntityReference {
            entity: q(entity),
            subject: subject.to_string(),
            subject_kind: kind,
            predicate: "P180".to_string(),
        }
    }

    struct FakeLog(Vec<DeletionLogEntry>);

    impl DeletionLog for FakeLog {
        fn deletion_entries(
            &self,
            _since: Option<DateTime<Utc>>,
        ) -> Result<Vec<DeletionLogEntry>, ClientError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct FakeUsage {
        references: Vec<EntityReference>,
        orphaned: Vec<String>,
        calls: RefCell<Vec<usize>>,
    }

    impl UsageSource for FakeUsage {
        fn references_to(
            &self,
            entities: &[EntityId],
        ) -> Result<Vec<EntityReference>, ClientError> {
            self.calls.borrow_mut().push(entities.len());
            Ok(self
                .references
                .iter()
                .filter(|reference| entities.contains(&reference.entity))
                .cloned()
                .collect())
        }

        fn orphaned_references(
            &self,
            reference_hashes: &[String],
        ) -> Result<Vec<String>, ClientError> {
            Ok(self
                .orphaned
                .iter()
                .filter(|hash| reference_hashes.contains(hash))
                .cloned()
                .collect())
        }
    }

    struct FakeOracle {
        deleted: Vec<EntityId>,
        fail: bool,
        skip: Option<EntityId>,
    }

    impl FakeOracle {
        fn deleted(deleted: Vec<EntityId>) -> Self {
            Self {
                deleted,
                fail: false,
                skip: None,
            }
        }
    }

    impl ExistenceOracle for FakeOracle {
        fn statuses(
            &self,
            entities: &[EntityId],
        ) -> Result<Vec<(EntityId, EntityStatus)>, ClientError> {
            if self.fail {
                return Err(ClientError::Api {
                    status: 503,
                    message: "upstream unavailable".to_string(),
                });
            }
            Ok(entities
                .iter()
                .filter(|entity| Some(**entity) != self.skip)
                .map(|entity| {
                    let status = if self.deleted.contains(entity) {
                        EntityStatus::Deleted
                    } else {
                        EntityStatus::Live
                    };
                    (*entity, status)
                })
                .collect())
        }
    }

    fn entry(title: &str, user: Option<&str>, day: u32) -> DeletionLogEntry {
        DeletionLogEntry {
            title: title.to_string(),
            user: user.map(ToOwned::to_owned),
            timestamp: ts(day),
        }
    }

    fn options() -> PipelineOptions {
        PipelineOptions {
            chunk_pause: Duration::ZERO,
            ..PipelineOptions::default()
        }
    }

    fn run(
        log: &FakeLog,
        usage: &FakeUsage,
        oracle: &FakeOracle,
    ) -> Result<PipelineOutcome> {
        let pattern = EntityIdPattern::new()?;
        let mut steps = StepTracker::default();
        collect_report(log, usage, oracle, &options(), &pattern, &mut steps)
    }

    #[test]
    fn latest_deletion_wins_and_non_items_are_ignored() {
        let pattern = EntityIdPattern::new().unwrap();
        let entries = vec![
            entry("Q5", Some("EarlyAdmin"), 1),
            entry("Q5", Some("LateAdmin"), 3),
            entry("Q5", Some("MiddleAdmin"), 2),
            entry("Lexeme:L1", Some("Admin"), 1),
            entry("Q7", None, 1),
        ];

        let latest = latest_deletions(entries, &pattern);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[&q(5)].deleted_by, "LateAdmin");
        assert_eq!(latest[&q(5)].deleted_at, ts(3));
        assert_eq!(latest[&q(7)].deleted_by, HIDDEN_USER);
    }

    #[test]
    fn report_lists_exactly_the_deleted_referenced_entities() {
        let log = FakeLog(vec![
            entry("Q1", Some("A"), 1),
            entry("Q2", Some("B"), 1),
            entry("Q3", Some("C"), 1),
        ]);
        let usage = FakeUsage {
            references: vec![
                reference(1, "M10", SubjectKind::MediaInfo),
                reference(1, "M10-abc", SubjectKind::Statement),
                reference(2, "M11-def", SubjectKind::Statement),
                reference(3, "M12-ghi", SubjectKind::Statement),
            ],
            ..FakeUsage::default()
        };
        // Q2 was restored after deletion.
        let oracle = FakeOracle::deleted(vec![q(1), q(3)]);

        let outcome = run(&log, &usage, &oracle).unwrap();
        let listed: Vec<EntityId> = outcome.rows.iter().map(|row| row.entity).collect();
        assert_eq!(listed, vec![q(1), q(3)]);
        assert_eq!(outcome.rows[0].uses, 2);
        assert_eq!(outcome.rows[0].deleted_by, "A");
        assert_eq!(outcome.counts.live_entities, 1);
        assert_eq!(outcome.counts.deleted_entities, 2);
    }

    #[test]
    fn media_info_only_usage_does_not_qualify() {
        let log = FakeLog(vec![entry("Q1", Some("A"), 1)]);
        let usage = FakeUsage {
            references: vec![reference(1, "M10", SubjectKind::MediaInfo)],
            ..FakeUsage::default()
        };
        let oracle = FakeOracle::deleted(vec![q(1)]);

        let outcome = run(&log, &usage, &oracle).unwrap();
        assert!(outcome.rows.is_empty());
        assert_eq!(outcome.counts.references_total, 1);
    }

    #[test]
    fn unrecognized_subjects_count_but_do_not_qualify() {
        let log = FakeLog(vec![entry("Q1", Some("A"), 1), entry("Q2", Some("B"), 1)]);
        let usage = FakeUsage {
            references: vec![
                reference(1, "http://example.org/node/long-subject-iri", SubjectKind::Other),
                reference(2, "http://example.org/node/long-subject-iri", SubjectKind::Other),
                reference(2, "M20-0000-statement", SubjectKind::Statement),
            ],
            ..FakeUsage::default()
        };
        let oracle = FakeOracle::deleted(vec![q(1), q(2)]);

        let outcome = run(&log, &usage, &oracle).unwrap();
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.rows[0].entity, q(2));
        assert_eq!(outcome.rows[0].uses, 2);
    }

    #[test]
    fn empty_deletion_log_yields_empty_report() {
        let outcome = run(
            &FakeLog(Vec::new()),
            &FakeUsage::default(),
            &FakeOracle::deleted(Vec::new()),
        )
        .unwrap();
        assert!(outcome.rows.is_empty());
        assert_eq!(outcome.counts.candidates, 0);
    }

    #[test]
    fn orphaned_reference_nodes_are_dropped() {
        let log = FakeLog(vec![entry("Q1", Some("A"), 1), entry("Q2", Some("B"), 1)]);
        let usage = FakeUsage {
            references: vec![
                reference(1, "stalehash", SubjectKind::Reference),
                reference(2, "livehash", SubjectKind::Reference),
            ],
            orphaned: vec!["stalehash".to_string()],
            ..FakeUsage::default()
        };
        let oracle = FakeOracle::deleted(vec![q(1), q(2)]);

        let outcome = run(&log, &usage, &oracle).unwrap();
        let listed: Vec<EntityId> = outcome.rows.iter().map(|row| row.entity).collect();
        assert_eq!(listed, vec![q(2)]);
        assert_eq!(outcome.counts.orphaned_references, 1);
    }

    #[test]
    fn oracle_failure_is_surfaced() {
        let log = FakeLog(vec![entry("Q1", Some("A"), 1)]);
        let usage = FakeUsage {
            references: vec![reference(1, "M10-abc", SubjectKind::Statement)],
            ..FakeUsage::default()
        };
        let oracle = FakeOracle {
            deleted: vec![q(1)],
            fail: true,
            skip: None,
        };

        let pattern = EntityIdPattern::new().unwrap();
        let mut steps = StepTracker::default();
        let err = collect_report(&log, &usage, &oracle, &options(), &pattern, &mut steps)
            .unwrap_err();
        assert!(format!("{err:#}").contains("upstream unavailable"));
        assert_eq!(steps.current(), Some("verify-entities"));
        assert_eq!(
            steps.completed(),
            ["collect-candidates", "query-references", "validate-references"]
        );
    }

    #[test]
    fn unanswered_entity_is_an_error_not_live() {
        let oracle = FakeOracle {
            deleted: Vec::new(),
            fail: false,
            skip: Some(q(2)),
        };
        let err = verify_entities(&oracle, &[q(1), q(2)]).unwrap_err();
        assert_eq!(err.to_string(), "existence check returned no status for Q2");
    }

    #[test]
    fn verification_is_batched() {
        let entities: Vec<EntityId> = (1..=120).map(q).collect();
        let statuses = verify_entities(&FakeOracle::deleted(Vec::new()), &entities).unwrap();
        assert_eq!(statuses.len(), 120);
    }

    #[test]
    fn query_references_chunks_and_deduplicates() {
        let usage = FakeUsage {
            references: vec![
                reference(1, "M10-abc", SubjectKind::Statement),
                reference(1, "M10-abc", SubjectKind::Statement),
                reference(3, "M12-ghi", SubjectKind::Statement),
            ],
            ..FakeUsage::default()
        };
        let options = PipelineOptions {
            chunk_size: 2,
            ..options()
        };

        let references = query_references(&usage, &[q(1), q(2), q(3)], &options).unwrap();
        assert_eq!(references.len(), 2);
        assert_eq!(*usage.calls.borrow(), vec![2, 1]);
    }

    #[test]
    fn identical_inputs_give_identical_rows() {
        let log = FakeLog(vec![entry("Q9", Some("A"), 1), entry("Q10", Some("B"), 2)]);
        let usage = FakeUsage {
            references: vec![
                reference(10, "M1-x", SubjectKind::Statement),
                reference(9, "M2-y", SubjectKind::Statement),
            ],
            ..FakeUsage::default()
        };
        let oracle = FakeOracle::deleted(vec![q(9), q(10)]);

        let first = run(&log, &usage, &oracle).unwrap();
        let second = run(&log, &usage, &oracle).unwrap();
        assert_eq!(first.rows, second.rows);
        assert_eq!(first.rows[0].entity, q(9));
    }
}
