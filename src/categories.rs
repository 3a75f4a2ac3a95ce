//! Fixed expense category table.
//!
//! The same rows are seeded into the `categories` table by migration; the
//! static copy lets validators check ids without a store round-trip.

use serde::Serialize;

/// One expense category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Category {
    pub id: i64,
    pub code: &'static str,
    pub label: &'static str,
    /// Unattributed cost is split across the animals present at the shelter.
    pub distributable: bool,
}

pub const VETERINARY: i64 = 1;
pub const FOOD: i64 = 2;
pub const LITTER: i64 = 3;

pub const CATEGORIES: &[Category] = &[
    Category { id: VETERINARY, code: "veterinary", label: "Veterinary", distributable: false },
    Category { id: FOOD, code: "food", label: "Food", distributable: true },
    Category { id: LITTER, code: "litter", label: "Litter", distributable: true },
    Category { id: 4, code: "medicine", label: "Medicine", distributable: false },
    Category { id: 5, code: "transport", label: "Transport", distributable: false },
    Category { id: 6, code: "supplies", label: "Supplies", distributable: false },
    Category { id: 7, code: "other", label: "Other", distributable: false },
];

/// Look up a category by id.
pub fn get(id: i64) -> Option<&'static Category> {
    CATEGORIES.iter().find(|c| c.id == id)
}

pub fn is_known(id: i64) -> bool {
    get(id).is_some()
}

pub fn is_distributable(id: i64) -> bool {
    get(id).is_some_and(|c| c.distributable)
}
