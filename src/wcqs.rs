//! Wikimedia Commons Query Service client.
//!
//! WCQS sits behind an OAuth login; the `wcqsOauth` cookie is obtained out of
//! band and passed verbatim on every request.

use std::collections::HashMap;

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, COOKIE};
use serde::Deserialize;

use crate::http::{ClientError, check_response};
use crate::model::{EntityId, EntityIdPattern, EntityReference, SubjectKind};
use crate::pipeline::UsageSource;

pub const WCQS_ENDPOINT: &str = "https://commons-query.wikimedia.org/sparql";
const WCQS_COOKIE_NAME: &str = "wcqsOauth";

const SDC_STATEMENT_PREFIX: &str = "https://commons.wikimedia.org/entity/statement/";
const SDC_ENTITY_PREFIX: &str = "https://commons.wikimedia.org/entity/";
const SDC_REFERENCE_PREFIX: &str = "https://commons.wikimedia.org/reference/";
const WD_ENTITY_PREFIX: &str = "http://www.wikidata.org/entity/";

const KNOWN_PREFIXES: [&str; 8] = [
    SDC_STATEMENT_PREFIX,
    SDC_ENTITY_PREFIX,
    SDC_REFERENCE_PREFIX,
    WD_ENTITY_PREFIX,
    "http://www.wikidata.org/prop/direct/",
    "http://www.wikidata.org/prop/reference/",
    "http://www.wikidata.org/prop/qualifier/",
    "http://www.wikidata.org/prop/statement/",
];

type Binding = HashMap<String, BindingValue>;

#[derive(Debug, Deserialize)]
struct BindingValue {
    value: String,
}

#[derive(Debug, Deserialize)]
struct SparqlResponse {
    #[serde(default)]
    results: SparqlResults,
}

#[derive(Debug, Default, Deserialize)]
struct SparqlResults {
    #[serde(default)]
    bindings: Vec<Binding>,
}

pub struct WcqsClient {
    http: Client,
    endpoint: String,
    cookie: String,
    pattern: EntityIdPattern,
}

impl WcqsClient {
    pub fn new(http: Client, endpoint: &str, token: &str, pattern: EntityIdPattern) -> Self {
        Self {
            http,
            endpoint: endpoint.to_string(),
            cookie: format!("{WCQS_COOKIE_NAME}={}", token.trim()),
            pattern,
        }
    }

    fn select(&self, query: &str) -> Result<Vec<Binding>, ClientError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .header(ACCEPT, "application/sparql-results+json")
            .header(COOKIE, &self.cookie)
            .form(&[("query", query)])
            .send()?;
        let body = check_response(resp)?.text()?;
        parse_bindings(&body)
    }
}

impl UsageSource for WcqsClient {
    fn references_to(&self, entities: &[EntityId]) -> Result<Vec<EntityReference>, ClientError> {
        if entities.is_empty() {
            return Ok(Vec::new());
        }

        let bindings = self.select(&usage_query(entities))?;
        bindings
            .iter()
            .map(|binding| parse_usage_binding(binding, &self.pattern))
            .collect()
    }

    fn orphaned_references(
        &self,
        reference_hashes: &[String],
    ) -> Result<Vec<String>, ClientError> {
        if reference_hashes.is_empty() {
            return Ok(Vec::new());
        }

        let bindings = self.select(&orphan_reference_query(reference_hashes))?;
        bindings.iter().map(parse_orphan_binding).collect()
    }
}

fn parse_bindings(body: &str) -> Result<Vec<Binding>, ClientError> {
    // An expired cookie yields the HTML login page with status 200.
    if body.trim_start().starts_with('<') {
        return Err(ClientError::Unauthorized { status: 200 });
    }

    let payload: SparqlResponse = serde_json::from_str(body)
        .map_err(|err| ClientError::Parse(format!("invalid SPARQL JSON results: {err}")))?;
    Ok(payload.results.bindings)
}

pub fn usage_query(entities: &[EntityId]) -> String {
    let values = entities
        .iter()
        .map(|entity| format!("wd:{entity}"))
        .collect::<Vec<_>>()
        .join(" ");

    format!(
        "SELECT ?file ?predicate ?item WHERE {{
  VALUES ?item {{
    {values}
  }}
  ?file ?predicate ?item .
}}"
    )
}

pub fn orphan_reference_query(reference_hashes: &[String]) -> String {
    let values = reference_hashes
        .iter()
        .map(|hash| format!("sdcref:{hash}"))
        .collect::<Vec<_>>()
        .join(" ");

    format!(
        "SELECT ?sdcref WHERE {{
  VALUES ?sdcref {{ {values} }}
  OPTIONAL {{ ?m ?p [ prov:wasDerivedFrom ?sdcref ] }}
  FILTER(!BOUND(?m)) .
}}"
    )
}

/// Strip the longest known namespace prefix; unknown IRIs pass through.
pub fn strip_known_prefix(iri: &str) -> (&str, Option<&'static str>) {
    KNOWN_PREFIXES
        .iter()
        .filter(|prefix| iri.starts_with(**prefix))
        .max_by_key(|prefix| prefix.len())
        .map(|prefix| (&iri[prefix.len()..], Some(*prefix)))
        .unwrap_or((iri, None))
}

pub fn classify_subject(iri: &str) -> (String, SubjectKind) {
    let (local, prefix) = strip_known_prefix(iri);
    let kind = match prefix {
        Some(SDC_STATEMENT_PREFIX) => SubjectKind::Statement,
        Some(SDC_REFERENCE_PREFIX) => SubjectKind::Reference,
        Some(SDC_ENTITY_PREFIX) => SubjectKind::MediaInfo,
        _ => SubjectKind::Other,
    };
    (local.to_string(), kind)
}

fn binding_value<'a>(binding: &'a Binding, name: &str) -> Result<&'a str, ClientError> {
    binding
        .get(name)
        .map(|value| value.value.as_str())
        .ok_or_else(|| ClientError::Parse(format!("SPARQL binding lacks ?{name}")))
}

fn parse_usage_binding(
    binding: &Binding,
    pattern: &EntityIdPattern,
) -> Result<EntityReference, ClientError> {
    let (subject, subject_kind) = classify_subject(binding_value(binding, "file")?);
    let (predicate, _) = strip_known_prefix(binding_value(binding, "predicate")?);

    let item_iri = binding_value(binding, "item")?;
    let (item, _) = strip_known_prefix(item_iri);
    let entity = pattern
        .parse(item)
        .ok_or_else(|| ClientError::Parse(format!("unexpected item IRI: {item_iri}")))?;

    Ok(EntityReference {
        entity,
        subject,
        subject_kind,
        predicate: predicate.to_string(),
    })
}

fn parse_orphan_binding(binding: &Binding) -> Result<String, ClientError> {
    let (hash, _) = strip_known_prefix(binding_value(binding, "sdcref")?);
    Ok(hash.to_string())
}
