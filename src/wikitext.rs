use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::model::{HIDDEN_USER, ReportRow};

pub const REPORT_PAGE_TITLE: &str =
    "Wikidata:Database reports/Deleted Wikidata entities used in SDC";
pub const NO_DELETIONS_NOTICE: &str = "No deleted Wikidata entities are currently used in SDC.";

const INTRODUCTION: &str = "In order to find usage, visit [https://commons-query.wikimedia.org/ WCQS], log in, and run a query such as: {{SPARQL|project=sdc|query=SELECT ?s ?p WHERE { ?s ?p wd:Q42 } }}

The first column <code>?s</code> represents in most cases [[:mw:Extension:WikibaseMediaInfo#MediaInfo Entity|MediaInfo entities]] or SDC statement nodes. These links redirect to the file page that is using the queried Wikidata item via SDC. For (rare) usage in reference nodes, more sophisticated queries need to be run in order to find the page using the deleted entity.";

const CATEGORY: &str = "[[Category:Database reports|Deleted Wikidata entities used in SDC]]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedReport {
    pub text: String,
    pub body_sha256: String,
}

/// Render the full page; only the update line depends on `generated_at`.
pub fn render_report(rows: &[ReportRow], generated_at: DateTime<Utc>) -> RenderedReport {
    let body = render_body(rows);
    let body_sha256 = format!("{:x}", Sha256::digest(body.as_bytes()));
    let text = format!(
        "Update: <onlyinclude>{} (UTC)</onlyinclude>\n\n{body}",
        generated_at.format("%Y-%m-%d, %H:%M")
    );

    RenderedReport { text, body_sha256 }
}

fn render_body(rows: &[ReportRow]) -> String {
    let listing = if rows.is_empty() {
        NO_DELETIONS_NOTICE.to_string()
    } else {
        render_table(rows)
    };

    format!("{INTRODUCTION}\n\n{listing}\n\n{CATEGORY}")
}

fn render_table(rows: &[ReportRow]) -> String {
    let mut sorted: Vec<&ReportRow> = rows.iter().collect();
    sorted.sort_by_key(|row| row.entity);

    let mut table = String::from(
        "{| class=\"wikitable sortable\" style=\"margin:auto;\"\n|-\n! item !! deleted by !! deletion time !! SDC uses\n",
    );
    for row in sorted {
        table.push_str(&format!(
            "|-\n| [[{entity}]] || {admin} || {deleted_at} || {uses}\n",
            entity = row.entity,
            admin = user_link(&row.deleted_by),
            deleted_at = row.deleted_at.format("%Y-%m-%d %H:%M:%S"),
            uses = row.uses,
        ));
    }
    table.push_str("|}");
    table
}

fn user_link(user: &str) -> String {
    if user == HIDDEN_USER {
        user.to_string()
    } else {
        format!("[[User:{user}|{user}]]")
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::model::EntityId;

    fn row(entity: u64, admin: &str, uses: usize) -> ReportRow {
        ReportRow {
            entity: EntityId::from_number(entity),
            deleted_by: admin.to_string(),
            deleted_at: Utc.with_ymd_and_hms(2023, 1, 5, 12, 34, 56).unwrap(),
            uses,
        }
    }

    fn generated_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 6, 7, 8).unwrap()
    }

    #[test]
    fn table_rows_are_sorted_by_numeric_id() {
        let report = render_report(&[row(100, "B", 1), row(9, "A", 3)], generated_at());

        let q9 = report.text.find("[[Q9]]").unwrap();
        let q100 = report.text.find("[[Q100]]").unwrap();
        assert!(q9 < q100);
        assert!(report.text.contains(
            "|-\n| [[Q9]] || [[User:A|A]] || 2023-01-05 12:34:56 || 3\n"
        ));
        assert!(report.text.ends_with(CATEGORY));
    }

    #[test]
    fn header_carries_update_timestamp() {
        let report = render_report(&[row(1, "A", 1)], generated_at());
        assert!(report.text.starts_with(
            "Update: <onlyinclude>2024-03-01, 06:07 (UTC)</onlyinclude>\n\n"
        ));
        assert!(report.text.contains("! item !! deleted by !! deletion time !! SDC uses"));
    }

    #[test]
    fn empty_report_states_no_deletions() {
        let report = render_report(&[], generated_at());
        assert!(report.text.contains(NO_DELETIONS_NOTICE));
        assert!(!report.text.contains("wikitable"));
    }

    #[test]
    fn body_digest_ignores_generation_time() {
        let rows = [row(1, "A", 1), row(2, "B", 2)];
        let first = render_report(&rows, generated_at());
        let later = render_report(&rows, Utc.with_ymd_and_hms(2024, 3, 8, 6, 7, 8).unwrap());
        assert_ne!(first.text, later.text);
        assert_eq!(first.body_sha256, later.body_sha256);

        let changed = render_report(&[row(1, "A", 2)], generated_at());
        assert_ne!(first.body_sha256, changed.body_sha256);
    }

    #[test]
    fn hidden_deleter_is_not_linked() {
        let report = render_report(&[row(5, HIDDEN_USER, 1)], generated_at());
        assert!(report.text.contains(
            "|-\n| [[Q5]] || (hidden) || 2023-01-05 12:34:56 || 1\n"
        ));
        assert!(!report.text.contains("[[User:(hidden)"));
    }
}
