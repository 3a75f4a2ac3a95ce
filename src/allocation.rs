//! Expense Allocation Engine.
//!
//! Turns the line items of one expense (or vet-visit) intent into expense
//! records and allocation rows inside the caller's transaction. Each item
//! falls into exactly one case:
//!
//! | case            | when                                              | rows                   |
//! |-----------------|---------------------------------------------------|------------------------|
//! | `Named`         | the item (or its visit) names a resolvable animal | one, full amount       |
//! | `Distributable` | no name, distributable category, animals present  | one per present animal |
//! | `General`       | anything else, including unresolved names         | none                   |
//!
//! Allocated portions of a record always sum to its amount exactly.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, warn};

use crate::categories;
use crate::directory::{self, Resolution};
use crate::error::{ResolutionWarning, StoreError};
use crate::intents::{ExpenseLineItem, TicketInfo};
use crate::store::{AnimalSummary, ExpenseAllocation, LedgerTx, NewExpense};

/// Message-scoped inputs shared by every record of one commit.
#[derive(Debug, Clone)]
pub struct AllocationContext<'a> {
    pub message_key: Option<&'a str>,
    /// Durable reference of the message photo, uploaded once upstream.
    pub photo_reference: Option<&'a str>,
    /// Name used for items that carry none (a vet visit's animal).
    pub default_animal: Option<&'a str>,
    /// Record date when the ticket has none.
    pub today: NaiveDate,
}

/// What the engine did for one commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AllocationSummary {
    pub expense_ids: Vec<i64>,
    pub records_created: usize,
    pub allocations_created: usize,
    #[serde(skip)]
    pub warnings: Vec<ResolutionWarning>,
}

impl AllocationSummary {
    /// One-paragraph text for the result reply.
    pub fn render(&self) -> String {
        let mut out = format!(
            "{} expense record{} created, {} allocation{}.",
            self.records_created,
            plural(self.records_created),
            self.allocations_created,
            plural(self.allocations_created),
        );
        for w in &self.warnings {
            out.push_str(&format!("\nWarning: {w}; cost left unassigned."));
        }
        out
    }
}

fn plural(n: usize) -> &'static str {
    if n == 1 { "" } else { "s" }
}

/// How one line item is attributed.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AllocationCase {
    Named(i64),
    Distributable(Vec<AnimalSummary>),
    General,
}

/// Insert one expense record per item and its allocation rows.
///
/// Runs entirely inside `tx`; the caller commits or rolls back, so a store
/// failure on any item leaves nothing behind for this intent.
pub async fn allocate_expense(
    tx: &mut dyn LedgerTx,
    ctx: &AllocationContext<'_>,
    ticket: &TicketInfo,
    items: &[ExpenseLineItem],
) -> Result<AllocationSummary, StoreError> {
    let mut summary = AllocationSummary::default();

    for item in items {
        let expense_id = tx
            .insert_expense(&NewExpense {
                date: ticket.date.unwrap_or(ctx.today),
                category_id: item.category_id,
                amount: item.amount,
                description: item.description.clone(),
                provider: ticket.provider.clone(),
                responsible_party: ticket.responsible_party.clone(),
                payment_method: ticket.payment_method.clone(),
                photo_reference: ctx.photo_reference.map(str::to_string),
                message_key: ctx.message_key.map(str::to_string),
            })
            .await?;
        summary.expense_ids.push(expense_id);
        summary.records_created += 1;

        let case = match decide(tx, ctx, item).await? {
            (case, Some(warning)) => {
                warn!(
                    expense_id,
                    name = %warning.name,
                    reason = %warning.reason,
                    "Animal not resolved, expense left unassigned"
                );
                summary.warnings.push(warning);
                case
            }
            (case, None) => case,
        };

        let rows: Vec<ExpenseAllocation> = match case {
            AllocationCase::Named(animal_id) => vec![ExpenseAllocation {
                expense_id,
                animal_id,
                portion_amount: item.amount,
            }],
            AllocationCase::Distributable(animals) => split_evenly(item.amount, animals.len())
                .into_iter()
                .zip(animals)
                .map(|(portion_amount, animal)| ExpenseAllocation {
                    expense_id,
                    animal_id: animal.id,
                    portion_amount,
                })
                .collect(),
            AllocationCase::General => Vec::new(),
        };

        for row in &rows {
            tx.insert_allocation(row).await?;
        }
        debug!(
            expense_id,
            amount = %item.amount,
            allocations = rows.len(),
            "Line item recorded"
        );
        summary.allocations_created += rows.len();
    }

    Ok(summary)
}

/// Pick the case for one item. Presence is read fresh for every item.
async fn decide(
    tx: &mut dyn LedgerTx,
    ctx: &AllocationContext<'_>,
    item: &ExpenseLineItem,
) -> Result<(AllocationCase, Option<ResolutionWarning>), StoreError> {
    let name = item
        .animal_name
        .as_deref()
        .or(ctx.default_animal)
        .map(str::trim)
        .filter(|n| !n.is_empty());

    if let Some(name) = name {
        let resolution = directory::resolve(tx, name).await?;
        return Ok(match resolution {
            Resolution::Found(id) => (AllocationCase::Named(id), None),
            other => (AllocationCase::General, other.warning(name)),
        });
    }

    if categories::is_distributable(item.category_id) {
        let mut present = directory::present_animals(tx).await?;
        if !present.is_empty() {
            present.sort_by_key(|a| a.id);
            return Ok((AllocationCase::Distributable(present), None));
        }
    }

    Ok((AllocationCase::General, None))
}

/// Split `amount` into `n` shares that sum to it exactly.
///
/// Works in the smallest unit of the amount's scale, never coarser than a
/// cent. Leftover units all go to the first share.
pub fn split_evenly(amount: Decimal, n: usize) -> Vec<Decimal> {
    if n == 0 {
        return Vec::new();
    }
    let mut scaled = amount;
    scaled.rescale(amount.scale().max(2));
    // Rescaling settles on a coarser scale when the mantissa would overflow.
    let scale = scaled.scale();
    let units = scaled.mantissa();
    let count = n as i128;
    let base = units / count;
    let remainder = units % count;

    (0..n)
        .map(|i| {
            let share = if i == 0 { base + remainder } else { base };
            Decimal::from_i128_with_scale(share, scale).normalize()
        })
        .collect()
}
