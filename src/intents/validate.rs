//! Per-intent payload validators.
//!
//! Every validator is a pure function of the payload: no store access, so
//! shape rules are testable without a database. A failed check never
//! panics; malformed classifier output simply lists the offending fields.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Map, Value};

use super::model::*;
use crate::categories;
use crate::error::ValidationError;

/// The `(ok, missing_fields)` view of a validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub missing_fields: Vec<String>,
}

/// Check a raw intent without keeping the typed payload.
pub fn check(raw: &RawIntent) -> ValidationReport {
    match validate(raw) {
        Ok(_) => ValidationReport {
            ok: true,
            missing_fields: Vec::new(),
        },
        Err(e) => ValidationReport {
            ok: false,
            missing_fields: e.missing_fields,
        },
    }
}

/// Validate a raw intent into its typed form.
pub fn validate(raw: &RawIntent) -> Result<Intent, ValidationError> {
    let Some(kind) = IntentKind::parse(&raw.kind) else {
        return Err(ValidationError::new(raw.kind.clone(), vec!["type".into()]));
    };
    let Some(obj) = raw.payload.as_object() else {
        return Err(ValidationError::new(kind.label(), vec!["payload".into()]));
    };

    let mut missing = Missing::default();
    let intent = match kind {
        IntentKind::NewRescue => new_rescue(obj, &mut missing).map(Intent::NewRescue),
        IntentKind::StatusChange => status_change(obj, &mut missing).map(Intent::StatusChange),
        IntentKind::VetVisit => vet_visit(obj, &mut missing).map(Intent::VetVisit),
        IntentKind::Expense => expense(obj, &mut missing).map(Intent::Expense),
        IntentKind::MovementTracking => movement(obj, &mut missing).map(Intent::MovementTracking),
        IntentKind::Inquiry => inquiry(obj, &mut missing).map(Intent::Inquiry),
    };

    match intent {
        Some(intent) if missing.is_empty() => Ok(intent),
        _ => {
            if missing.is_empty() {
                missing.push("payload");
            }
            Err(ValidationError::new(kind.label(), missing.0))
        }
    }
}

#[derive(Debug, Default)]
struct Missing(Vec<String>);

impl Missing {
    fn push(&mut self, field: impl Into<String>) {
        self.0.push(field.into());
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ── Field helpers ───────────────────────────────────────────────────

/// First present, non-null value under any of `keys`.
fn field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| !v.is_null())
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn opt_text(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    field(obj, keys).and_then(text)
}

fn req_text(obj: &Map<String, Value>, keys: &[&str], missing: &mut Missing) -> Option<String> {
    let value = opt_text(obj, keys);
    if value.is_none() {
        missing.push(keys[0]);
    }
    value
}

/// Integer from a JSON number or a numeric string.
fn integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Exact decimal from a JSON number or a numeric string (`$` allowed).
fn decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            let s = n.to_string();
            Decimal::from_str(&s)
                .or_else(|_| Decimal::from_scientific(&s))
                .ok()
        }
        Value::String(s) => {
            let s = s.trim().trim_start_matches('$').trim();
            Decimal::from_str(s).ok()
        }
        _ => None,
    }
}

/// Lenient date: `YYYY-MM-DD`, RFC 3339, or `YYYY-MM-DD HH:MM[:SS]`.
/// Unparseable dates are dropped; the commit falls back to today.
fn date(obj: &Map<String, Value>, keys: &[&str]) -> Option<NaiveDate> {
    let s = opt_text(obj, keys)?;
    if let Ok(d) = NaiveDate::parse_from_str(&s, "%Y-%m-%d") {
        return Some(d);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Some(dt.date_naive());
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&s, fmt).ok())
        .map(|dt| dt.date())
}

fn ticket(obj: &Map<String, Value>) -> TicketInfo {
    TicketInfo {
        date: date(obj, &["date", "fecha"]),
        provider: opt_text(obj, &["provider", "proveedor"]),
        responsible_party: opt_text(obj, &["responsible_party", "responsible", "responsable"]),
        payment_method: opt_text(obj, &["payment_method", "forma_de_pago"]),
    }
}

// ── Line items ──────────────────────────────────────────────────────

/// Validate one line item. `default_category` applies when the item has
/// no category of its own (vet bills).
fn line_item(
    value: &Value,
    prefix: &str,
    default_category: Option<i64>,
    missing: &mut Missing,
) -> Option<ExpenseLineItem> {
    let Some(obj) = value.as_object() else {
        missing.push(prefix);
        return None;
    };
    let before = missing.0.len();

    let amount = field(obj, &["amount", "monto"])
        .and_then(decimal)
        .filter(|a| *a > Decimal::ZERO);
    if amount.is_none() {
        missing.push(format!("{prefix}.amount"));
    }

    let category_id = match field(obj, &["category_id", "categoria_id"]) {
        Some(v) => integer(v).filter(|id| categories::is_known(*id)),
        None => default_category,
    };
    if category_id.is_none() {
        missing.push(format!("{prefix}.category_id"));
    }

    let description = opt_text(obj, &["description", "descripcion"]);
    if description.is_none() {
        missing.push(format!("{prefix}.description"));
    }

    if missing.0.len() != before {
        return None;
    }
    Some(ExpenseLineItem {
        amount: amount?,
        category_id: category_id?,
        description: description?,
        animal_name: opt_text(obj, &["animal_name", "nombre_animal", "name", "nombre"]),
    })
}

/// Items under `items`, or the payload itself as a single item when it
/// carries a top-level amount.
fn line_items(
    obj: &Map<String, Value>,
    default_category: Option<i64>,
    missing: &mut Missing,
) -> Option<Vec<ExpenseLineItem>> {
    match field(obj, &["items", "line_items"]) {
        Some(Value::Array(list)) => {
            let items: Vec<_> = list
                .iter()
                .enumerate()
                .filter_map(|(i, v)| line_item(v, &format!("items[{i}]"), default_category, missing))
                .collect();
            (items.len() == list.len()).then_some(items)
        }
        Some(_) => {
            missing.push("items");
            None
        }
        None if field(obj, &["amount", "monto"]).is_some() => {
            let single = Value::Object(obj.clone());
            line_item(&single, "items[0]", default_category, missing).map(|i| vec![i])
        }
        None => Some(Vec::new()),
    }
}

// ── Per-type validators ─────────────────────────────────────────────

fn new_rescue(obj: &Map<String, Value>, missing: &mut Missing) -> Option<NewRescue> {
    let name = req_text(obj, &["name", "nombre"], missing);
    let species = req_text(obj, &["species", "tipo_animal"], missing);

    let coat_colors = match field(obj, &["coat_colors", "color_de_pelo"]) {
        Some(Value::Array(list)) => list
            .iter()
            .filter_map(|c| match c {
                Value::String(_) => text(c).map(|color| CoatColor {
                    color,
                    percentage: None,
                }),
                Value::Object(o) => opt_text(o, &["color"]).map(|color| CoatColor {
                    color,
                    percentage: field(o, &["percentage", "porcentaje"])
                        .and_then(integer)
                        .and_then(|p| u8::try_from(p).ok())
                        .filter(|p| *p <= 100),
                }),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    Some(NewRescue {
        name: name?,
        species: species?,
        age: opt_text(obj, &["age", "edad"]),
        coat_colors,
        health_condition: opt_text(obj, &["health_condition", "condicion_de_salud_inicial"]),
        status: opt_text(obj, &["status"]).unwrap_or_else(|| "in-shelter".into()),
        location: opt_text(obj, &["location", "ubicacion"]).unwrap_or_else(|| "shelter".into()),
        person: opt_text(obj, &["person", "persona"]),
    })
}

fn status_change(obj: &Map<String, Value>, missing: &mut Missing) -> Option<StatusChange> {
    let animal = match field(obj, &["animal_id"]).and_then(integer) {
        Some(id) => Some(AnimalRef::Id(id)),
        None => opt_text(obj, &["animal_name", "name", "nombre"]).map(AnimalRef::Name),
    };
    if animal.is_none() {
        missing.push("animal_name");
    }
    let status = req_text(obj, &["status", "estado"], missing);
    let location = req_text(obj, &["location", "ubicacion"], missing);

    Some(StatusChange {
        animal: animal?,
        status: status?,
        location: location?,
        person: opt_text(obj, &["person", "persona"]),
        date: date(obj, &["date", "fecha"]),
    })
}

fn vet_visit(obj: &Map<String, Value>, missing: &mut Missing) -> Option<VetVisit> {
    let items = line_items(obj, Some(categories::VETERINARY), missing)?;
    Some(VetVisit {
        animal_name: opt_text(obj, &["animal_name", "name", "nombre"]),
        vet: opt_text(obj, &["vet", "veterinario"]),
        date: date(obj, &["date", "fecha"]),
        diagnosis: opt_text(obj, &["diagnosis", "diagnostico"]),
        treatment: opt_text(obj, &["treatment", "tratamiento"]),
        next_appointment: opt_text(obj, &["next_appointment", "proxima_cita"]),
        companion: opt_text(obj, &["companion", "persona_acompanante"]),
        ticket: ticket(obj),
        items,
    })
}

fn expense(obj: &Map<String, Value>, missing: &mut Missing) -> Option<Expense> {
    let items = line_items(obj, None, missing)?;
    if items.is_empty() {
        missing.push("items");
        return None;
    }
    Some(Expense {
        ticket: ticket(obj),
        items,
    })
}

fn movement(obj: &Map<String, Value>, missing: &mut Missing) -> Option<Movement> {
    let direction = opt_text(obj, &["direction", "tipo"]).and_then(|s| Direction::parse(&s));
    if direction.is_none() {
        missing.push("direction");
    }
    let destination =
        opt_text(obj, &["destination", "destino"]).and_then(|s| Destination::parse(&s));
    if destination.is_none() {
        missing.push("destination");
    }

    let names: Vec<String> = match field(obj, &["animals", "animales"]) {
        Some(Value::Array(list)) => list.iter().filter_map(text).collect(),
        Some(v) if v.is_string() => text(v).into_iter().collect(),
        _ => Vec::new(),
    };
    let animals = if names.is_empty() {
        missing.push("animals");
        None
    } else if names
        .iter()
        .any(|n| matches!(n.to_lowercase().as_str(), "all" | "todos"))
    {
        Some(AnimalSelection::All)
    } else {
        Some(AnimalSelection::Named(names))
    };

    Some(Movement {
        direction: direction?,
        destination: destination?,
        animals: animals?,
        responsible: opt_text(obj, &["responsible", "responsable"]),
        date: date(obj, &["date", "fecha"]),
        notes: opt_text(obj, &["notes", "observaciones"]),
    })
}

fn inquiry(obj: &Map<String, Value>, missing: &mut Missing) -> Option<Inquiry> {
    let topic = req_text(obj, &["topic", "tema"], missing);
    Some(Inquiry {
        topic: topic?,
        animal_name: opt_text(obj, &["animal_name", "name", "nombre"]),
        suggested_answer: opt_text(obj, &["suggested_answer", "respuesta_sugerida"]),
    })
}
