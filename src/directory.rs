//! Animal Directory: name resolution and presence over the ledger store.
//!
//! Resolution runs three stages over the active roster and stops at the
//! first stage that yields any candidate:
//!
//! 1. exact name,
//! 2. normalised name (case, whitespace, common accents),
//! 3. normalised name within one edit.
//!
//! One candidate resolves; more than one is ambiguous and resolves to
//! nothing. No stage guesses between candidates.

use crate::error::{ResolutionFailure, ResolutionWarning, StoreError};
use crate::store::{Animal, AnimalSummary, LedgerTx};

/// Status an animal's latest event must carry to count as present.
pub const PRESENT_STATUS: &str = "in-shelter";
/// Location an animal's latest event must carry to count as present.
pub const PRESENT_LOCATION: &str = "shelter";

/// Outcome of matching one name against a roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(i64),
    NotFound,
    Ambiguous(Vec<i64>),
}

impl Resolution {
    pub fn id(&self) -> Option<i64> {
        match self {
            Self::Found(id) => Some(*id),
            _ => None,
        }
    }

    /// The warning to surface when this did not resolve.
    pub fn warning(&self, name: &str) -> Option<ResolutionWarning> {
        let reason = match self {
            Self::Found(_) => return None,
            Self::NotFound => ResolutionFailure::Unmatched,
            Self::Ambiguous(candidates) => ResolutionFailure::Ambiguous {
                candidates: candidates.clone(),
            },
        };
        Some(ResolutionWarning {
            name: name.to_string(),
            reason,
        })
    }
}

/// Match `name` against `roster` (active animals only).
pub fn match_name(roster: &[Animal], name: &str) -> Resolution {
    let query = name.trim();
    if query.is_empty() {
        return Resolution::NotFound;
    }
    let active = || roster.iter().filter(|a| a.is_active);

    let exact: Vec<i64> = active().filter(|a| a.name == query).map(|a| a.id).collect();
    if let Some(r) = decide(exact) {
        return r;
    }

    let wanted = normalize(query);
    let normalized: Vec<i64> = active()
        .filter(|a| normalize(&a.name) == wanted)
        .map(|a| a.id)
        .collect();
    if let Some(r) = decide(normalized) {
        return r;
    }

    let near: Vec<i64> = active()
        .filter(|a| within_one_edit(&normalize(&a.name), &wanted))
        .map(|a| a.id)
        .collect();
    decide(near).unwrap_or(Resolution::NotFound)
}

fn decide(mut ids: Vec<i64>) -> Option<Resolution> {
    match ids.len() {
        0 => None,
        1 => Some(Resolution::Found(ids[0])),
        _ => {
            ids.sort_unstable();
            Some(Resolution::Ambiguous(ids))
        }
    }
}

/// Lowercase, collapse whitespace and fold the accents that show up in
/// Spanish pet names.
pub fn normalize(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'á' | 'à' | 'ä' | 'â' => 'a',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' => 'o',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            'ñ' => 'n',
            other => other,
        })
        .collect()
}

/// True when `a` and `b` differ by at most one insertion, deletion or
/// substitution.
pub fn within_one_edit(a: &str, b: &str) -> bool {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (short, long) = if a.len() <= b.len() { (&a, &b) } else { (&b, &a) };
    if long.len() - short.len() > 1 {
        return false;
    }

    let mut i = 0;
    let mut j = 0;
    let mut edits = 0;
    while i < short.len() && j < long.len() {
        if short[i] == long[j] {
            i += 1;
            j += 1;
            continue;
        }
        edits += 1;
        if edits > 1 {
            return false;
        }
        if short.len() == long.len() {
            i += 1;
        }
        j += 1;
    }
    edits + (long.len() - j) + (short.len() - i) <= 1
}

/// Resolve a free-text name inside an open transaction.
pub async fn resolve(tx: &mut dyn LedgerTx, name: &str) -> Result<Resolution, StoreError> {
    let roster = tx.active_animals().await?;
    Ok(match_name(&roster, name))
}

/// Point-in-time snapshot of the animals present at the shelter, ordered
/// by id ascending.
pub async fn present_animals(tx: &mut dyn LedgerTx) -> Result<Vec<AnimalSummary>, StoreError> {
    tx.present_animals().await
}

/// Canonical status/location code: trimmed, lowercase, words joined by `-`.
pub fn normalize_code(raw: &str) -> String {
    raw.split(|c: char| c.is_whitespace() || c == '_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
}
