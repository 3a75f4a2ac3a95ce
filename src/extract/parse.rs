//! Turning classifier replies into raw intents.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::PipelineError;
use crate::intents::RawIntent;

const KIND_KEYS: &[&str] = &["type", "tipo", "tipo_registro", "intent", "kind"];
const PAYLOAD_KEYS: &[&str] = &["payload", "details", "detalles", "datos", "data"];
const LIST_KEYS: &[&str] = &["intents", "intenciones", "registros"];

static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").unwrap());
static BARE_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([:\[,]\s*)(None|True|False)\b").unwrap());
static BARE_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#).unwrap());

/// Extract the JSON document from a model reply.
///
/// Handles bare JSON, ```json fences, plain fences and prose around the
/// outermost braces or brackets.
pub fn extract_json(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') || inner.starts_with('[') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

/// Fix the usual near-JSON slips: bare None/True/False, unquoted keys and
/// trailing commas. Only applied after a strict parse fails.
fn repair(json: &str) -> String {
    let fixed = BARE_LITERAL.replace_all(json, |caps: &regex::Captures<'_>| {
        let literal = match &caps[2] {
            "None" => "null",
            "True" => "true",
            _ => "false",
        };
        format!("{}{literal}", &caps[1])
    });
    let fixed = BARE_KEY.replace_all(&fixed, r#"$1"$2":"#);
    TRAILING_COMMA.replace_all(&fixed, "$1").into_owned()
}

fn parse_document(text: &str) -> Result<Value, PipelineError> {
    let json = extract_json(text);
    serde_json::from_str(&json)
        .or_else(|_| serde_json::from_str(&repair(&json)))
        .map_err(|e| PipelineError::Extraction(format!("unparseable classifier reply: {e}")))
}

fn first<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k))
}

/// One classifier entry to a raw intent. Entries without a usable type
/// or payload still become raw intents so validation reports them.
fn to_raw(sequence_index: usize, entry: Value) -> RawIntent {
    let Value::Object(mut obj) = entry else {
        return RawIntent::new(sequence_index, "", entry);
    };
    let kind = first(&obj, KIND_KEYS)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let payload = match PAYLOAD_KEYS.iter().find_map(|k| obj.remove(*k)) {
        Some(payload) => payload,
        None => {
            for key in KIND_KEYS {
                obj.remove(*key);
            }
            Value::Object(obj)
        }
    };
    RawIntent::new(sequence_index, kind, payload)
}

/// Parse a classifier reply into raw intents in reply order.
///
/// Accepts `{"intents": [...]}`, a bare array, or a single intent object.
pub fn parse_intents(text: &str) -> Result<Vec<RawIntent>, PipelineError> {
    let entries = match parse_document(text)? {
        Value::Array(entries) => entries,
        Value::Object(mut obj) => match LIST_KEYS.iter().find_map(|k| obj.remove(*k)) {
            Some(Value::Array(entries)) => entries,
            Some(other) => vec![other],
            None if first(&obj, KIND_KEYS).is_some() => vec![Value::Object(obj)],
            None => Vec::new(),
        },
        other => {
            return Err(PipelineError::Extraction(format!(
                "expected an object or array, got {other}"
            )));
        }
    };

    Ok(entries
        .into_iter()
        .enumerate()
        .map(|(i, entry)| to_raw(i, entry))
        .collect())
}
