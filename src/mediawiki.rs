//! Wikidata action API client: deletion log, entity existence and page edits.

use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::http::{ClientError, check_response};
use crate::model::{EntityId, EntityIdPattern, EntityStatus};
use crate::pipeline::{DeletionLog, DeletionLogEntry, ExistenceOracle};

pub const WIKIDATA_API: &str = "https://www.wikidata.org/w/api.php";

type Params = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditOutcome {
    pub new_revision_id: Option<u64>,
    pub no_change: bool,
}

#[derive(Debug, Deserialize)]
struct LogEventsResponse {
    #[serde(default, rename = "continue")]
    continuation: Option<serde_json::Map<String, Value>>,
    #[serde(default)]
    query: Option<LogEventsQuery>,
}

#[derive(Debug, Deserialize)]
struct LogEventsQuery {
    #[serde(default)]
    logevents: Vec<RawLogEvent>,
}

#[derive(Debug, Deserialize)]
struct RawLogEvent {
    title: Option<String>,
    user: Option<String>,
    timestamp: DateTime<Utc>,
}

pub struct MediaWikiClient {
    http: Client,
    api_url: String,
    pattern: EntityIdPattern,
}

impl MediaWikiClient {
    pub fn new(http: Client, api_url: &str, pattern: EntityIdPattern) -> Self {
        Self {
            http,
            api_url: api_url.to_string(),
            pattern,
        }
    }

    fn get(&self, params: &[(&str, &str)]) -> Result<Value, ClientError> {
        let resp = self
            .http
            .get(&self.api_url)
            .query(&with_format(params))
            .send()?;
        let payload: Value = check_response(resp)?.json()?;
        ensure_no_api_error(payload)
    }

    fn post(&self, params: &[(&str, &str)]) -> Result<Value, ClientError> {
        let resp = self
            .http
            .post(&self.api_url)
            .form(&with_format(params))
            .send()?;
        let payload: Value = check_response(resp)?.json()?;
        ensure_no_api_error(payload)
    }

    /// Log in with a bot password; the session cookie stays in the client.
    pub fn login(&self, username: &str, password: &str) -> Result<(), ClientError> {
        let payload = self.get(&[("action", "query"), ("meta", "tokens"), ("type", "login")])?;
        let login_token = token_from(&payload, "logintoken")?;

        let payload = self.post(&[
            ("action", "login"),
            ("lgname", username),
            ("lgpassword", password),
            ("lgtoken", login_token.as_str()),
        ])?;
        parse_login_result(&payload)?;

        info!(user = %username, "logged in to wikidata");
        Ok(())
    }

    pub fn csrf_token(&self) -> Result<String, ClientError> {
        let payload = self.get(&[("action", "query"), ("meta", "tokens"), ("type", "csrf")])?;
        token_from(&payload, "csrftoken")
    }

    /// Replace the whole page text; no base revision is sent, last writer wins.
    pub fn replace_page(
        &self,
        title: &str,
        text: &str,
        summary: &str,
        csrf_token: &str,
    ) -> Result<EditOutcome, ClientError> {
        let payload = self.post(&[
            ("action", "edit"),
            ("title", title),
            ("text", text),
            ("summary", summary),
            ("bot", "1"),
            ("assert", "user"),
            ("token", csrf_token),
        ])?;
        parse_edit_result(&payload)
    }
}

impl DeletionLog for MediaWikiClient {
    fn deletion_entries(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DeletionLogEntry>, ClientError> {
        read_deletion_log(since, |params| self.get(params))
    }
}

/// Page through `list=logevents` oldest first, feeding each `continue` block
/// back into the next request until the log is exhausted.
fn read_deletion_log<F>(
    since: Option<DateTime<Utc>>,
    mut fetch_page: F,
) -> Result<Vec<DeletionLogEntry>, ClientError>
where
    F: FnMut(&[(&str, &str)]) -> Result<Value, ClientError>,
{
    let since = since.map(|ts| ts.format("%Y-%m-%dT%H:%M:%SZ").to_string());
    let mut continuation: Params = Vec::new();
    let mut entries = Vec::new();
    let mut pages = 0_usize;

    loop {
        let payload = {
            let mut params: Vec<(&str, &str)> = vec![
                ("action", "query"),
                ("list", "logevents"),
                ("letype", "delete"),
                ("leaction", "delete/delete"),
                ("lenamespace", "0"),
                ("leprop", "title|user|timestamp"),
                ("lelimit", "max"),
                ("ledir", "newer"),
            ];
            if let Some(since) = since.as_deref() {
                params.push(("lestart", since));
            }
            params.extend(continuation.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            fetch_page(&params)?
        };
        let (page, next) = parse_log_events(payload)?;
        entries.extend(page);
        pages += 1;

        if pages % 20 == 0 {
            info!(pages, entries = entries.len(), "reading deletion log");
        }

        match next {
            Some(next) => continuation = next,
            None => break,
        }
    }

    debug!(pages, entries = entries.len(), "deletion log exhausted");
    Ok(entries)
}

impl ExistenceOracle for MediaWikiClient {
    fn statuses(
        &self,
        entities: &[EntityId],
    ) -> Result<Vec<(EntityId, EntityStatus)>, ClientError> {
        if entities.is_empty() {
            return Ok(Vec::new());
        }

        let ids = entities
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("|");
        let payload = self.get(&[
            ("action", "wbgetentities"),
            ("ids", ids.as_str()),
            ("props", "info"),
        ])?;
        parse_entity_statuses(&payload, &self.pattern)
    }
}

fn with_format<'a>(params: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
    let mut out = params.to_vec();
    out.push(("format", "json"));
    out.push(("formatversion", "2"));
    out
}

fn ensure_no_api_error(payload: Value) -> Result<Value, ClientError> {
    if let Some(error) = payload.get("error") {
        let field = |name: &str| {
            error
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        return Err(ClientError::MediaWiki {
            code: field("code"),
            info: field("info"),
        });
    }
    Ok(payload)
}

fn token_from(payload: &Value, name: &str) -> Result<String, ClientError> {
    payload
        .pointer(&format!("/query/tokens/{name}"))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or_else(|| ClientError::Parse(format!("response lacks {name}")))
}

fn parse_login_result(payload: &Value) -> Result<(), ClientError> {
    let result = payload
        .pointer("/login/result")
        .and_then(Value::as_str)
        .ok_or_else(|| ClientError::Parse("login response lacks result".to_string()))?;

    if result == "Success" {
        return Ok(());
    }

    let reason = payload
        .pointer("/login/reason")
        .and_then(Value::as_str)
        .unwrap_or("no reason given");
    Err(ClientError::MediaWiki {
        code: format!("login-{}", result.to_lowercase()),
        info: reason.to_string(),
    })
}

fn parse_edit_result(payload: &Value) -> Result<EditOutcome, ClientError> {
    let edit = payload
        .get("edit")
        .ok_or_else(|| ClientError::Parse("edit response lacks edit object".to_string()))?;

    let result = edit.get("result").and_then(Value::as_str).unwrap_or_default();
    if result != "Success" {
        return Err(ClientError::MediaWiki {
            code: format!("edit-{}", result.to_lowercase()),
            info: edit.to_string(),
        });
    }

    // formatversion=2 sends `nochange: true`, formatversion=1 an empty string.
    let no_change = edit.get("nochange").is_some_and(|value| value != &Value::Bool(false));
    Ok(EditOutcome {
        new_revision_id: edit.get("newrevid").and_then(Value::as_u64),
        no_change,
    })
}

fn parse_log_events(
    payload: Value,
) -> Result<(Vec<DeletionLogEntry>, Option<Params>), ClientError> {
    let response: LogEventsResponse = serde_json::from_value(payload)
        .map_err(|err| ClientError::Parse(format!("invalid logevents response: {err}")))?;

    let entries = response
        .query
        .map(|query| query.logevents)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|event| {
            // Suppressed entries carry no title and cannot be reported.
            let title = event.title?;
            Some(DeletionLogEntry {
                title,
                user: event.user,
                timestamp: event.timestamp,
            })
        })
        .collect();

    let next = response.continuation.map(|map| {
        map.into_iter()
            .filter_map(|(key, value)| match value {
                Value::String(text) => Some((key, text)),
                Value::Number(number) => Some((key, number.to_string())),
                _ => None,
            })
            .collect::<Params>()
    });

    Ok((entries, next))
}

fn parse_entity_statuses(
    payload: &Value,
    pattern: &EntityIdPattern,
) -> Result<Vec<(EntityId, EntityStatus)>, ClientError> {
    let entities = payload
        .get("entities")
        .and_then(Value::as_object)
        .ok_or_else(|| ClientError::Parse("wbgetentities response lacks entities".to_string()))?;

    let mut out = Vec::with_capacity(entities.len());
    for (key, entity) in entities {
        let requested = entity
            .pointer("/redirects/from")
            .and_then(Value::as_str)
            .unwrap_or(key);
        let id = pattern
            .parse(requested)
            .ok_or_else(|| ClientError::Parse(format!("unexpected entity key: {requested}")))?;

        let status = if entity.get("missing").is_some() {
            EntityStatus::Deleted
        } else {
            EntityStatus::Live
        };
        out.push((id, status));
    }

    Ok(out)
}
