//! Per-intent commit routines.
//!
//! Every confirmed intent commits in its own transaction together with its
//! `(message_key, sequence_index)` bookkeeping row, so a redelivered message
//! never writes the same intent twice and a failing sibling never undoes
//! one that already committed.

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::allocation::{self, AllocationContext};
use crate::directory::{self, PRESENT_LOCATION, PRESENT_STATUS, Resolution};
use crate::error::{ResolutionWarning, StoreError};
use crate::intents::{
    AnimalRef, AnimalSelection, Direction, Expense, Inquiry, Intent, Movement, NewRescue,
    StatusChange, VetVisit,
};
use crate::store::{
    Animal, Ledger, LedgerTx, NewAnimal, NewAnimalEvent, NewInquiry, NewMovement, NewVetVisit,
};

/// Message-scoped inputs for a commit.
#[derive(Debug, Clone)]
pub struct CommitContext<'a> {
    pub message_key: &'a str,
    pub sender: &'a str,
    /// Durable reference of the message photo, if one was uploaded.
    pub photo_reference: Option<&'a str>,
    pub today: NaiveDate,
}

/// Result of committing one intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommitOutcome {
    Committed {
        summary: String,
        #[serde(skip)]
        warnings: Vec<ResolutionWarning>,
    },
    /// Nothing written; the reason is shown to the user.
    Rejected { reason: String },
    /// This intent of this message was committed by an earlier delivery.
    AlreadyCommitted,
}

impl CommitOutcome {
    fn committed(summary: impl Into<String>) -> Self {
        Self::Committed {
            summary: summary.into(),
            warnings: Vec::new(),
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

/// Commit one validated intent atomically.
///
/// Only a store failure is an `Err`; the transaction is rolled back first.
pub async fn commit(
    ledger: &dyn Ledger,
    ctx: &CommitContext<'_>,
    sequence_index: usize,
    intent: &Intent,
) -> Result<CommitOutcome, StoreError> {
    let kind = intent.kind();
    let mut tx = ledger.begin().await?;

    match run(tx.as_mut(), ctx, sequence_index, intent).await {
        Ok(outcome @ CommitOutcome::Committed { .. }) => {
            tx.commit().await?;
            info!(
                message_key = ctx.message_key,
                sequence_index,
                intent = %kind,
                "Intent committed"
            );
            Ok(outcome)
        }
        Ok(outcome) => {
            if let Err(e) = tx.rollback().await {
                warn!(error = %e, "Rollback after non-committing intent failed");
            }
            debug!(
                message_key = ctx.message_key,
                sequence_index,
                intent = %kind,
                ?outcome,
                "Intent not committed"
            );
            Ok(outcome)
        }
        Err(e) => {
            error!(
                message_key = ctx.message_key,
                sequence_index,
                intent = %kind,
                error = %e,
                "Intent commit failed"
            );
            if let Err(rb) = tx.rollback().await {
                warn!(error = %rb, "Rollback after failed commit failed");
            }
            Err(e)
        }
    }
}

async fn run(
    tx: &mut dyn LedgerTx,
    ctx: &CommitContext<'_>,
    sequence_index: usize,
    intent: &Intent,
) -> Result<CommitOutcome, StoreError> {
    if tx.intent_committed(ctx.message_key, sequence_index).await? {
        return Ok(CommitOutcome::AlreadyCommitted);
    }

    let outcome = match intent {
        Intent::NewRescue(r) => new_rescue(tx, ctx, r).await?,
        Intent::StatusChange(s) => status_change(tx, ctx, s).await?,
        Intent::VetVisit(v) => vet_visit(tx, ctx, v).await?,
        Intent::Expense(e) => expense(tx, ctx, e).await?,
        Intent::MovementTracking(m) => movement(tx, ctx, m).await?,
        Intent::Inquiry(q) => inquiry(tx, ctx, q).await?,
    };

    if matches!(outcome, CommitOutcome::Committed { .. }) {
        tx.record_intent(ctx.message_key, sequence_index, intent.kind().label())
            .await?;
    }
    Ok(outcome)
}

async fn new_rescue(
    tx: &mut dyn LedgerTx,
    ctx: &CommitContext<'_>,
    rescue: &NewRescue,
) -> Result<CommitOutcome, StoreError> {
    let wanted = directory::normalize(&rescue.name);
    let roster = tx.active_animals().await?;
    if let Some(existing) = roster.iter().find(|a| directory::normalize(&a.name) == wanted) {
        return Ok(CommitOutcome::rejected(format!(
            "an active animal named {} already exists (#{})",
            existing.name, existing.id
        )));
    }

    let coat_colors = serde_json::to_string(&rescue.coat_colors)
        .map_err(|e| StoreError::Serialization(format!("coat colors: {e}")))?;
    let animal_id = tx
        .insert_animal(&NewAnimal {
            name: rescue.name.clone(),
            species: rescue.species.clone(),
            age: rescue.age.clone(),
            coat_colors,
            health_condition: rescue.health_condition.clone(),
            photo_reference: ctx.photo_reference.map(str::to_string),
        })
        .await?;

    let status = directory::normalize_code(&rescue.status);
    let location = directory::normalize_code(&rescue.location);
    tx.insert_animal_event(&NewAnimalEvent {
        animal_id,
        status: status.clone(),
        location: location.clone(),
        person: rescue.person.clone(),
        event_date: ctx.today,
        message_key: Some(ctx.message_key.to_string()),
    })
    .await?;

    Ok(CommitOutcome::committed(format!(
        "Registered {} ({}) as #{animal_id}, {status} @ {location}.",
        rescue.name, rescue.species
    )))
}

/// Resolve a status change's animal reference to an active animal.
async fn find_referenced(
    tx: &mut dyn LedgerTx,
    animal: &AnimalRef,
) -> Result<Result<Animal, String>, StoreError> {
    match animal {
        AnimalRef::Id(id) => Ok(match tx.find_animal(*id).await? {
            Some(a) if a.is_active => Ok(a),
            _ => Err(format!("no active animal with id #{id}")),
        }),
        AnimalRef::Name(name) => {
            let roster = tx.active_animals().await?;
            let resolution = directory::match_name(&roster, name);
            Ok(match resolution {
                Resolution::Found(id) => roster
                    .into_iter()
                    .find(|a| a.id == id)
                    .ok_or_else(|| format!("animal '{name}' not found")),
                other => Err(other
                    .warning(name)
                    .map_or_else(|| format!("animal '{name}' not found"), |w| w.to_string())),
            })
        }
    }
}

async fn status_change(
    tx: &mut dyn LedgerTx,
    ctx: &CommitContext<'_>,
    change: &StatusChange,
) -> Result<CommitOutcome, StoreError> {
    let animal = match find_referenced(tx, &change.animal).await? {
        Ok(animal) => animal,
        Err(reason) => return Ok(CommitOutcome::rejected(reason)),
    };

    let status = directory::normalize_code(&change.status);
    let location = directory::normalize_code(&change.location);
    tx.insert_animal_event(&NewAnimalEvent {
        animal_id: animal.id,
        status: status.clone(),
        location: location.clone(),
        person: change.person.clone(),
        event_date: change.date.unwrap_or(ctx.today),
        message_key: Some(ctx.message_key.to_string()),
    })
    .await?;

    Ok(CommitOutcome::committed(format!(
        "{} (#{}) is now {status} @ {location}.",
        animal.name, animal.id
    )))
}

async fn vet_visit(
    tx: &mut dyn LedgerTx,
    ctx: &CommitContext<'_>,
    visit: &VetVisit,
) -> Result<CommitOutcome, StoreError> {
    let mut warnings = Vec::new();
    let animal_id = match visit.animal_name.as_deref() {
        Some(name) => {
            let resolution = directory::resolve(tx, name).await?;
            if let Some(w) = resolution.warning(name) {
                warn!(name, reason = %w.reason, "Vet visit animal not resolved");
                warnings.push(w);
            }
            resolution.id()
        }
        None => None,
    };

    let visit_date = visit.date.or(visit.ticket.date).unwrap_or(ctx.today);
    let visit_id = tx
        .insert_vet_visit(&NewVetVisit {
            animal_id,
            vet: visit.vet.clone(),
            visit_date,
            diagnosis: visit.diagnosis.clone(),
            treatment: visit.treatment.clone(),
            next_appointment: visit.next_appointment.clone(),
            companion: visit.companion.clone(),
            message_key: Some(ctx.message_key.to_string()),
        })
        .await?;

    let subject = visit.animal_name.as_deref().unwrap_or("unnamed animal");
    let mut summary = format!("Vet visit #{visit_id} recorded for {subject}.");

    if !visit.items.is_empty() {
        let mut ticket = visit.ticket.clone();
        ticket.date = Some(ticket.date.unwrap_or(visit_date));
        let actx = AllocationContext {
            message_key: Some(ctx.message_key),
            photo_reference: ctx.photo_reference,
            default_animal: visit.animal_name.as_deref(),
            today: ctx.today,
        };
        let costs = allocation::allocate_expense(tx, &actx, &ticket, &visit.items).await?;
        summary.push(' ');
        summary.push_str(&costs.render());
        for w in costs.warnings {
            if !warnings.contains(&w) {
                warnings.push(w);
            }
        }
    }

    Ok(CommitOutcome::Committed { summary, warnings })
}

async fn expense(
    tx: &mut dyn LedgerTx,
    ctx: &CommitContext<'_>,
    expense: &Expense,
) -> Result<CommitOutcome, StoreError> {
    let actx = AllocationContext {
        message_key: Some(ctx.message_key),
        photo_reference: ctx.photo_reference,
        default_animal: None,
        today: ctx.today,
    };
    let summary = allocation::allocate_expense(tx, &actx, &expense.ticket, &expense.items).await?;
    Ok(CommitOutcome::Committed {
        summary: summary.render(),
        warnings: summary.warnings,
    })
}

async fn movement(
    tx: &mut dyn LedgerTx,
    ctx: &CommitContext<'_>,
    movement: &Movement,
) -> Result<CommitOutcome, StoreError> {
    let roster = tx.active_animals().await?;
    let mut warnings = Vec::new();
    let mut animals: Vec<&Animal> = Vec::new();

    match &movement.animals {
        AnimalSelection::All => animals.extend(roster.iter()),
        AnimalSelection::Named(names) => {
            for name in names {
                let resolution = directory::match_name(&roster, name);
                match resolution.id().and_then(|id| roster.iter().find(|a| a.id == id)) {
                    Some(animal) => {
                        if !animals.iter().any(|a| a.id == animal.id) {
                            animals.push(animal);
                        }
                    }
                    None => {
                        if let Some(w) = resolution.warning(name) {
                            warn!(name = %name, reason = %w.reason, "Movement animal not resolved");
                            warnings.push(w);
                        }
                    }
                }
            }
        }
    }

    if animals.is_empty() {
        let mut reason = String::from("none of the listed animals could be found");
        for w in &warnings {
            reason.push_str(&format!("; {w}"));
        }
        return Ok(CommitOutcome::rejected(reason));
    }

    let movement_date = movement.date.unwrap_or(ctx.today);
    let ids: Vec<i64> = animals.iter().map(|a| a.id).collect();
    let movement_id = tx
        .insert_movement(
            &NewMovement {
                direction: movement.direction.label().to_string(),
                destination: movement.destination.label().to_string(),
                responsible: movement.responsible.clone(),
                movement_date,
                notes: movement.notes.clone(),
                message_key: Some(ctx.message_key.to_string()),
            },
            &ids,
        )
        .await?;

    let location = match movement.direction {
        Direction::Departure => movement.destination.label(),
        Direction::Return => PRESENT_LOCATION,
    };
    for animal in &animals {
        let status = tx
            .latest_event(animal.id)
            .await?
            .map(|e| e.status)
            .unwrap_or_else(|| PRESENT_STATUS.to_string());
        tx.insert_animal_event(&NewAnimalEvent {
            animal_id: animal.id,
            status,
            location: location.to_string(),
            person: movement.responsible.clone(),
            event_date: movement_date,
            message_key: Some(ctx.message_key.to_string()),
        })
        .await?;
    }

    let names = animals
        .iter()
        .map(|a| a.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let verb = match movement.direction {
        Direction::Departure => "left for",
        Direction::Return => "returned from",
    };
    Ok(CommitOutcome::Committed {
        summary: format!(
            "Movement #{movement_id}: {names} {verb} {}.",
            movement.destination.label()
        ),
        warnings,
    })
}

async fn inquiry(
    tx: &mut dyn LedgerTx,
    ctx: &CommitContext<'_>,
    inquiry: &Inquiry,
) -> Result<CommitOutcome, StoreError> {
    let mut warnings = Vec::new();
    let mut status_line = None;
    let mut animal_id = None;

    if let Some(name) = inquiry.animal_name.as_deref() {
        let resolution = directory::resolve(tx, name).await?;
        match resolution.id() {
            Some(id) => {
                animal_id = Some(id);
                if let Some(event) = tx.latest_event(id).await? {
                    status_line = Some(format!(
                        "{name} is currently {} @ {} (since {}).",
                        event.status, event.location, event.event_date
                    ));
                }
            }
            None => warnings.extend(resolution.warning(name)),
        }
    }

    tx.insert_inquiry(&NewInquiry {
        topic: inquiry.topic.clone(),
        animal_name: inquiry.animal_name.clone(),
        animal_id,
        suggested_answer: inquiry.suggested_answer.clone(),
        sender: Some(ctx.sender.to_string()),
        message_key: Some(ctx.message_key.to_string()),
    })
    .await?;

    let mut summary = format!("Inquiry noted: {}.", inquiry.topic);
    if let Some(answer) = &inquiry.suggested_answer {
        summary.push_str(&format!("\nSuggested answer: {answer}"));
    }
    if let Some(line) = status_line {
        summary.push('\n');
        summary.push_str(&line);
    }
    Ok(CommitOutcome::Committed { summary, warnings })
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::categories::FOOD;
    use crate::intents::{CoatColor, Destination, ExpenseLineItem, TicketInfo};
    use crate::store::LibSqlBackend;

    fn ctx() -> CommitContext<'static> {
        CommitContext {
            message_key: "wamid.1",
            sender: "5491100000000",
            photo_reference: None,
            today: NaiveDate::from_ymd_opt(2024, 3, 2).unwrap(),
        }
    }

    async fn shelter() -> LibSqlBackend {
        let db = LibSqlBackend::new_memory().await.unwrap();
        for name in ["Luna", "Michi", "Tom"] {
            db.add_animal(name, "cat", "in-shelter", "shelter").await.unwrap();
        }
        db
    }

    fn food_expense(amount: rust_decimal::Decimal) -> Intent {
        Intent::Expense(Expense {
            ticket: TicketInfo::default(),
            items: vec![ExpenseLineItem {
                amount,
                category_id: FOOD,
                description: "kibble".into(),
                animal_name: None,
            }],
        })
    }

    fn rescue(name: &str) -> Intent {
        Intent::NewRescue(NewRescue {
            name: name.into(),
            species: "dog".into(),
            age: Some("2 months".into()),
            coat_colors: vec![CoatColor {
                color: "brown".into(),
                percentage: Some(100),
            }],
            health_condition: None,
            status: "In Shelter".into(),
            location: "shelter".into(),
            person: Some("Ana".into()),
        })
    }

    #[tokio::test]
    async fn expense_commits_and_records_intent() {
        let db = shelter().await;
        let outcome = commit(&db, &ctx(), 0, &food_expense(dec!(6000))).await.unwrap();
        let CommitOutcome::Committed { summary, warnings } = outcome else {
            panic!("expected commit, got {outcome:?}");
        };
        assert!(summary.contains("3 allocations"));
        assert!(warnings.is_empty());
        assert_eq!(db.count_allocations().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn same_intent_is_not_committed_twice() {
        let db = shelter().await;
        let intent = food_expense(dec!(90));
        commit(&db, &ctx(), 0, &intent).await.unwrap();
        let again = commit(&db, &ctx(), 0, &intent).await.unwrap();
        assert_eq!(again, CommitOutcome::AlreadyCommitted);
        assert_eq!(db.count_expenses().await.unwrap(), 1);

        // A different position in the same message is its own intent.
        commit(&db, &ctx(), 1, &intent).await.unwrap();
        assert_eq!(db.count_expenses().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rescue_registers_present_animal() {
        let db = shelter().await;
        let outcome = commit(&db, &ctx(), 0, &rescue("Firulais")).await.unwrap();
        assert!(matches!(outcome, CommitOutcome::Committed { .. }));

        let present = db.present_animals().await.unwrap();
        assert_eq!(present.len(), 4);
        assert_eq!(present[3].name, "Firulais");
    }

    #[tokio::test]
    async fn rescue_rejects_duplicate_name() {
        let db = shelter().await;
        let outcome = commit(&db, &ctx(), 0, &rescue("luna")).await.unwrap();
        assert!(matches!(outcome, CommitOutcome::Rejected { .. }));
        assert_eq!(db.active_animals().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn status_change_moves_animal_out_of_presence() {
        let db = shelter().await;
        let intent = Intent::StatusChange(StatusChange {
            animal: AnimalRef::Name("Michi".into()),
            status: "adopted".into(),
            location: "home".into(),
            person: None,
            date: None,
        });
        let outcome = commit(&db, &ctx(), 0, &intent).await.unwrap();
        assert!(matches!(outcome, CommitOutcome::Committed { .. }));
        let present: Vec<String> = db.present_animals().await.unwrap().into_iter().map(|a| a.name).collect();
        assert_eq!(present, vec!["Luna", "Tom"]);
    }

    #[tokio::test]
    async fn status_change_for_unknown_animal_is_rejected() {
        let db = shelter().await;
        for animal in [AnimalRef::Name("Ghost".into()), AnimalRef::Id(42)] {
            let intent = Intent::StatusChange(StatusChange {
                animal,
                status: "adopted".into(),
                location: "home".into(),
                person: None,
                date: None,
            });
            let outcome = commit(&db, &ctx(), 0, &intent).await.unwrap();
            assert!(matches!(outcome, CommitOutcome::Rejected { .. }), "{outcome:?}");
        }
        // Rejections leave no bookkeeping behind.
        let outcome = commit(&db, &ctx(), 0, &food_expense(dec!(1))).await.unwrap();
        assert!(matches!(outcome, CommitOutcome::Committed { .. }));
    }

    #[tokio::test]
    async fn departure_and_return_drive_presence() {
        let db = shelter().await;
        let out = Intent::MovementTracking(Movement {
            direction: Direction::Departure,
            destination: Destination::Park,
            animals: AnimalSelection::Named(vec!["Luna".into(), "Tom".into(), "Ghost".into()]),
            responsible: Some("Ana".into()),
            date: None,
            notes: None,
        });
        let CommitOutcome::Committed { warnings, .. } = commit(&db, &ctx(), 0, &out).await.unwrap()
        else {
            panic!("expected commit");
        };
        assert_eq!(warnings.len(), 1);
        let present: Vec<String> = db.present_animals().await.unwrap().into_iter().map(|a| a.name).collect();
        assert_eq!(present, vec!["Michi"]);

        let back = Intent::MovementTracking(Movement {
            direction: Direction::Return,
            destination: Destination::Park,
            animals: AnimalSelection::All,
            responsible: None,
            date: None,
            notes: None,
        });
        commit(&db, &ctx(), 1, &back).await.unwrap();
        assert_eq!(db.present_animals().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn movement_without_known_animals_is_rejected() {
        let db = shelter().await;
        let intent = Intent::MovementTracking(Movement {
            direction: Direction::Departure,
            destination: Destination::Vet,
            animals: AnimalSelection::Named(vec!["Ghost".into()]),
            responsible: None,
            date: None,
            notes: None,
        });
        let outcome = commit(&db, &ctx(), 0, &intent).await.unwrap();
        assert!(matches!(outcome, CommitOutcome::Rejected { ref reason } if reason.contains("Ghost")));
    }

    #[tokio::test]
    async fn vet_visit_allocates_to_visited_animal() {
        let db = shelter().await;
        let intent = Intent::VetVisit(VetVisit {
            animal_name: Some("Michi".into()),
            vet: Some("Dr. Paz".into()),
            date: None,
            diagnosis: Some("otitis".into()),
            treatment: None,
            next_appointment: None,
            companion: None,
            ticket: TicketInfo::default(),
            items: vec![ExpenseLineItem {
                amount: dec!(3500),
                category_id: crate::categories::VETERINARY,
                description: "consult".into(),
                animal_name: None,
            }],
        });
        commit(&db, &ctx(), 0, &intent).await.unwrap();

        let records = db.expenses_for_message("wamid.1").await.unwrap();
        assert_eq!(records.len(), 1);
        let allocations = db.expense_allocations(records[0].id).await.unwrap();
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].animal_id, 2);
        assert_eq!(allocations[0].portion_amount, dec!(3500));
    }

    #[tokio::test]
    async fn inquiry_reports_animal_status() {
        let db = shelter().await;
        let intent = Intent::Inquiry(Inquiry {
            topic: "adoption requirements".into(),
            animal_name: Some("Tom".into()),
            suggested_answer: Some("Fill in the adoption form.".into()),
        });
        let CommitOutcome::Committed { summary, .. } = commit(&db, &ctx(), 0, &intent).await.unwrap()
        else {
            panic!("expected commit");
        };
        assert!(summary.contains("Suggested answer: Fill in the adoption form."));
        assert!(summary.contains("Tom is currently in-shelter @ shelter"));
    }
}
