//! Intent data model: the untrusted classifier shape and the typed payloads
//! produced by validation.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::categories;

/// Closed set of things a message can ask the ledger to record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntentKind {
    NewRescue,
    StatusChange,
    VetVisit,
    Expense,
    MovementTracking,
    Inquiry,
}

impl IntentKind {
    pub const ALL: [IntentKind; 6] = [
        Self::NewRescue,
        Self::StatusChange,
        Self::VetVisit,
        Self::Expense,
        Self::MovementTracking,
        Self::Inquiry,
    ];

    /// Parse a classifier label. Case, `_`, `-` and spaces are ignored, and
    /// the labels the classifier was historically trained on are accepted.
    pub fn parse(label: &str) -> Option<Self> {
        let folded: String = label
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .flat_map(char::to_lowercase)
            .collect();
        match folded.as_str() {
            "newrescue" | "rescue" | "nuevorescate" => Some(Self::NewRescue),
            "statuschange" | "cambioestado" => Some(Self::StatusChange),
            "vetvisit" | "veterinaria" | "visitavet" => Some(Self::VetVisit),
            "expense" | "gasto" => Some(Self::Expense),
            "movementtracking" | "movement" | "trackingmovimiento" => {
                Some(Self::MovementTracking)
            }
            "inquiry" | "consulta" => Some(Self::Inquiry),
            _ => None,
        }
    }

    /// Canonical label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::NewRescue => "new-rescue",
            Self::StatusChange => "status-change",
            Self::VetVisit => "vet-visit",
            Self::Expense => "expense",
            Self::MovementTracking => "movement-tracking",
            Self::Inquiry => "inquiry",
        }
    }

    /// Short human title used in confirmation prompts.
    pub fn title(&self) -> &'static str {
        match self {
            Self::NewRescue => "New rescue",
            Self::StatusChange => "Status change",
            Self::VetVisit => "Vet visit",
            Self::Expense => "Expense",
            Self::MovementTracking => "Movement",
            Self::Inquiry => "Inquiry",
        }
    }
}

impl std::fmt::Display for IntentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One entry of the classifier's output, before any checking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawIntent {
    /// Position within the originating message.
    pub sequence_index: usize,
    /// Type label exactly as the classifier produced it.
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RawIntent {
    pub fn new(sequence_index: usize, kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            sequence_index,
            kind: kind.into(),
            payload,
        }
    }
}

/// A validated intent with a statically shaped payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Intent {
    NewRescue(NewRescue),
    StatusChange(StatusChange),
    VetVisit(VetVisit),
    Expense(Expense),
    MovementTracking(Movement),
    Inquiry(Inquiry),
}

impl Intent {
    pub fn kind(&self) -> IntentKind {
        match self {
            Self::NewRescue(_) => IntentKind::NewRescue,
            Self::StatusChange(_) => IntentKind::StatusChange,
            Self::VetVisit(_) => IntentKind::VetVisit,
            Self::Expense(_) => IntentKind::Expense,
            Self::MovementTracking(_) => IntentKind::MovementTracking,
            Self::Inquiry(_) => IntentKind::Inquiry,
        }
    }

    /// Field lines shown to the user before committing.
    pub fn confirmation_fields(&self) -> Vec<(String, String)> {
        let mut fields = Vec::new();
        let mut push = |k: &str, v: String| fields.push((k.to_string(), v));
        match self {
            Self::NewRescue(r) => {
                push("Name", r.name.clone());
                push("Species", r.species.clone());
                if let Some(age) = &r.age {
                    push("Age", age.clone());
                }
                if !r.coat_colors.is_empty() {
                    let coat = r
                        .coat_colors
                        .iter()
                        .map(|c| match c.percentage {
                            Some(p) => format!("{} {p}%", c.color),
                            None => c.color.clone(),
                        })
                        .collect::<Vec<_>>()
                        .join(", ");
                    push("Coat", coat);
                }
                if let Some(health) = &r.health_condition {
                    push("Health", health.clone());
                }
                push("Status", format!("{} @ {}", r.status, r.location));
            }
            Self::StatusChange(s) => {
                push("Animal", s.animal.to_string());
                push("Status", s.status.clone());
                push("Location", s.location.clone());
                if let Some(person) = &s.person {
                    push("Person", person.clone());
                }
                if let Some(date) = s.date {
                    push("Date", date.to_string());
                }
            }
            Self::VetVisit(v) => {
                push(
                    "Animal",
                    v.animal_name.clone().unwrap_or_else(|| "not specified".into()),
                );
                if let Some(vet) = &v.vet {
                    push("Vet", vet.clone());
                }
                if let Some(date) = v.date {
                    push("Date", date.to_string());
                }
                if let Some(d) = &v.diagnosis {
                    push("Diagnosis", d.clone());
                }
                if let Some(t) = &v.treatment {
                    push("Treatment", t.clone());
                }
                if let Some(n) = &v.next_appointment {
                    push("Next appointment", n.clone());
                }
                if !v.items.is_empty() {
                    push("Costs", describe_items(&v.items));
                    push("Total", total(&v.items).to_string());
                }
            }
            Self::Expense(e) => {
                push("Items", describe_items(&e.items));
                push("Total", total(&e.items).to_string());
                if let Some(p) = &e.ticket.provider {
                    push("Provider", p.clone());
                }
                if let Some(r) = &e.ticket.responsible_party {
                    push("Paid by", r.clone());
                }
                if let Some(m) = &e.ticket.payment_method {
                    push("Payment", m.clone());
                }
                if let Some(d) = e.ticket.date {
                    push("Date", d.to_string());
                }
            }
            Self::MovementTracking(m) => {
                push("Direction", m.direction.label().to_string());
                push("Destination", m.destination.label().to_string());
                push("Animals", m.animals.to_string());
                if let Some(r) = &m.responsible {
                    push("Responsible", r.clone());
                }
                if let Some(n) = &m.notes {
                    push("Notes", n.clone());
                }
            }
            Self::Inquiry(q) => {
                push("Topic", q.topic.clone());
                if let Some(name) = &q.animal_name {
                    push("Animal", name.clone());
                }
            }
        }
        fields
    }
}

fn describe_items(items: &[ExpenseLineItem]) -> String {
    items
        .iter()
        .map(|i| {
            let category = categories::get(i.category_id).map_or("?", |c| c.label);
            match &i.animal_name {
                Some(name) => format!("{} ({category}, {name}) {}", i.description, i.amount),
                None => format!("{} ({category}) {}", i.description, i.amount),
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn total(items: &[ExpenseLineItem]) -> Decimal {
    items.iter().map(|i| i.amount).sum()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoatColor {
    pub color: String,
    pub percentage: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewRescue {
    pub name: String,
    pub species: String,
    pub age: Option<String>,
    pub coat_colors: Vec<CoatColor>,
    pub health_condition: Option<String>,
    pub status: String,
    pub location: String,
    pub person: Option<String>,
}

/// How a status change names its animal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnimalRef {
    Id(i64),
    Name(String),
}

impl std::fmt::Display for AnimalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "#{id}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub animal: AnimalRef,
    pub status: String,
    pub location: String,
    pub person: Option<String>,
    pub date: Option<NaiveDate>,
}

/// Fields shared by every record created from one ticket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TicketInfo {
    pub date: Option<NaiveDate>,
    pub provider: Option<String>,
    pub responsible_party: Option<String>,
    pub payment_method: Option<String>,
}

/// One priced entry of an expense.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpenseLineItem {
    pub amount: Decimal,
    pub category_id: i64,
    pub description: String,
    pub animal_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Expense {
    pub ticket: TicketInfo,
    pub items: Vec<ExpenseLineItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VetVisit {
    pub animal_name: Option<String>,
    pub vet: Option<String>,
    pub date: Option<NaiveDate>,
    pub diagnosis: Option<String>,
    pub treatment: Option<String>,
    pub next_appointment: Option<String>,
    pub companion: Option<String>,
    pub ticket: TicketInfo,
    /// Billed items; may be empty.
    pub items: Vec<ExpenseLineItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Departure,
    Return,
}

impl Direction {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "departure" | "out" | "salida" => Some(Self::Departure),
            "return" | "back" | "regreso" => Some(Self::Return),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Departure => "departure",
            Self::Return => "return",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Destination {
    Park,
    Vet,
    Shopping,
    AdoptionHandover,
}

impl Destination {
    pub fn parse(s: &str) -> Option<Self> {
        let folded = s.trim().to_lowercase().replace(['_', ' '], "-");
        match folded.as_str() {
            "park" | "parque" => Some(Self::Park),
            "vet" | "veterinary" | "veterinaria" => Some(Self::Vet),
            "shopping" | "compras" => Some(Self::Shopping),
            "adoption-handover" | "adoption" | "entrega-adopcion" => Some(Self::AdoptionHandover),
            _ => None,
        }
    }

    /// Location code written to presence events while away.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Park => "park",
            Self::Vet => "vet",
            Self::Shopping => "shopping",
            Self::AdoptionHandover => "adoption-handover",
        }
    }
}

/// Which animals a movement covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnimalSelection {
    All,
    Named(Vec<String>),
}

impl std::fmt::Display for AnimalSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Named(names) => f.write_str(&names.join(", ")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Movement {
    pub direction: Direction,
    pub destination: Destination,
    pub animals: AnimalSelection,
    pub responsible: Option<String>,
    pub date: Option<NaiveDate>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inquiry {
    pub topic: String,
    pub animal_name: Option<String>,
    pub suggested_answer: Option<String>,
}
