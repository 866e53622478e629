//! Contract activation: pending → active, with bill generation as the
//! side effect.
//!
//! The batch entry point is invoked externally (a cron-style caller or the
//! manual trigger) and accumulates per-contract errors instead of aborting:
//! a failed bill generation leaves the contract activated; bills can be
//! regenerated later through the idempotent generator.

use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::error::AppError;
use crate::repository::table_service::{get_row, list_rows, update_row};
use crate::services::bill_generation::{self, GenerationOutcome};
use crate::services::settings;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ActivationError {
    pub contract_id: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct ActivationOutcome {
    pub activated: u32,
    pub expired: u32,
    pub bills_created: u32,
    pub errors: Vec<ActivationError>,
}

#[derive(Debug)]
pub struct ManualActivation {
    pub contract: Value,
    pub generation: Option<GenerationOutcome>,
    pub generation_error: Option<String>,
}

/// Activate every pending contract whose start date has arrived, then mark
/// active contracts past their end date as expired.
pub async fn activate_pending_contracts(pool: &PgPool) -> Result<ActivationOutcome, AppError> {
    let today = Utc::now().date_naive().to_string();

    let mut filters = Map::new();
    filters.insert("status".to_string(), Value::String("pending".to_string()));
    filters.insert("start_date__lte".to_string(), Value::String(today.clone()));

    let due = list_rows(pool, "contracts", Some(&filters), 1000, 0, "start_date", true).await?;

    let mut outcome = ActivationOutcome::default();
    for contract in due {
        let contract_id = val_str(&contract, "id");
        if contract_id.is_empty() {
            continue;
        }

        match activate_one(pool, &contract).await {
            Ok(activation) => {
                outcome.activated += 1;
                if let Some(generation) = &activation.generation {
                    outcome.bills_created += generation.created.len() as u32;
                    for failed in &generation.failed {
                        outcome.errors.push(ActivationError {
                            contract_id: contract_id.clone(),
                            message: format!(
                                "Bill {} ({}) was not created: {}",
                                failed.bill_type, failed.due_date, failed.message
                            ),
                        });
                    }
                }
                if let Some(message) = activation.generation_error {
                    outcome.errors.push(ActivationError {
                        contract_id: contract_id.clone(),
                        message,
                    });
                }
            }
            Err(error) => {
                warn!(%contract_id, error = %error, "Contract activation failed");
                outcome.errors.push(ActivationError {
                    contract_id,
                    message: error.to_string(),
                });
            }
        }
    }

    expire_ended_contracts(pool, &today, &mut outcome).await;

    info!(
        activated = outcome.activated,
        expired = outcome.expired,
        bills_created = outcome.bills_created,
        errors = outcome.errors.len(),
        "Batch contract activation completed"
    );

    Ok(outcome)
}

/// Active contracts whose end date has passed become expired and release
/// their room. Failures are accumulated like activation failures.
async fn expire_ended_contracts(pool: &PgPool, today: &str, outcome: &mut ActivationOutcome) {
    let mut filters = Map::new();
    filters.insert("status".to_string(), Value::String("active".to_string()));
    filters.insert("end_date__lt".to_string(), Value::String(today.to_string()));

    let ended = match list_rows(pool, "contracts", Some(&filters), 1000, 0, "end_date", true).await
    {
        Ok(rows) => rows,
        Err(error) => {
            warn!(error = %error, "Failed to fetch ended contracts");
            outcome.errors.push(ActivationError {
                contract_id: String::new(),
                message: format!("Could not scan for ended contracts: {error}"),
            });
            return;
        }
    };

    for contract in ended {
        let contract_id = val_str(&contract, "id");
        if contract_id.is_empty() {
            continue;
        }

        let mut patch = Map::new();
        patch.insert("status".to_string(), Value::String("expired".to_string()));
        if let Err(error) = update_row(pool, "contracts", &contract_id, &patch, "id").await {
            warn!(%contract_id, error = %error, "Failed to expire contract");
            outcome.errors.push(ActivationError {
                contract_id,
                message: error.to_string(),
            });
            continue;
        }
        outcome.expired += 1;

        let room_id = val_str(&contract, "room_id");
        if !room_id.is_empty() {
            let mut room_patch = Map::new();
            room_patch.insert("status".to_string(), Value::String("vacant".to_string()));
            if let Err(error) = update_row(pool, "rooms", &room_id, &room_patch, "id").await {
                warn!(%room_id, error = %error, "Failed to mark room vacant after expiry");
            }
        }
    }
}

/// Activate a single contract regardless of its start date. Fails without
/// mutating anything when the contract is missing or not pending.
pub async fn activate_contract(
    pool: &PgPool,
    contract_id: &str,
) -> Result<ManualActivation, AppError> {
    let contract = get_row(pool, "contracts", contract_id, "id").await?;
    activate_one(pool, &contract).await
}

async fn activate_one(pool: &PgPool, contract: &Value) -> Result<ManualActivation, AppError> {
    let contract_id = val_str(contract, "id");
    assert_pending(&val_str(contract, "status"))?;

    let room_id = val_str(contract, "room_id");
    ensure_room_has_no_active_contract(pool, &room_id, &contract_id).await?;

    let mut patch = Map::new();
    patch.insert("status".to_string(), Value::String("active".to_string()));
    patch.insert(
        "activated_at".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );
    let updated = update_row(pool, "contracts", &contract_id, &patch, "id").await?;

    // The room flip is best-effort: an occupancy flag lagging behind is a
    // display issue, not a reason to fail the activation.
    if !room_id.is_empty() {
        let mut room_patch = Map::new();
        room_patch.insert("status".to_string(), Value::String("occupied".to_string()));
        if let Err(error) = update_row(pool, "rooms", &room_id, &room_patch, "id").await {
            warn!(%room_id, error = %error, "Failed to mark room occupied");
        }
    }

    if !settings::get_bool(pool, settings::AUTO_GENERATE_ON_ACTIVATION_KEY, true).await {
        return Ok(ManualActivation {
            contract: updated,
            generation: None,
            generation_error: None,
        });
    }

    // Activation survives a bill-generation failure (no rollback); the error
    // is reported so the caller can regenerate.
    match bill_generation::generate_bills_for_contract(pool, &contract_id).await {
        Ok(generation) => Ok(ManualActivation {
            contract: updated,
            generation: Some(generation),
            generation_error: None,
        }),
        Err(error) => {
            warn!(%contract_id, error = %error, "Bill generation failed after activation");
            Ok(ManualActivation {
                contract: updated,
                generation: None,
                generation_error: Some(format!(
                    "Contract activated but bill generation failed: {error}"
                )),
            })
        }
    }
}

/// At most one active contract per room.
async fn ensure_room_has_no_active_contract(
    pool: &PgPool,
    room_id: &str,
    contract_id: &str,
) -> Result<(), AppError> {
    if room_id.is_empty() {
        return Ok(());
    }

    let mut filters = Map::new();
    filters.insert("room_id".to_string(), Value::String(room_id.to_string()));
    filters.insert("status".to_string(), Value::String("active".to_string()));

    let active = list_rows(pool, "contracts", Some(&filters), 5, 0, "created_at", true).await?;
    let conflicting = active
        .iter()
        .map(|existing| val_str(existing, "id"))
        .find(|existing_id| !existing_id.is_empty() && existing_id != contract_id);

    match conflicting {
        Some(existing_id) => Err(AppError::Conflict(format!(
            "Room already has an active contract ({existing_id})."
        ))),
        None => Ok(()),
    }
}

/// Precondition for both manual and batch activation. Checked before any
/// mutation so a failed activation leaves the contract untouched.
fn assert_pending(status: &str) -> Result<(), AppError> {
    if status == "pending" {
        return Ok(());
    }
    Err(AppError::Conflict(format!(
        "Contract is {status}; only pending contracts can be activated."
    )))
}

fn val_str(row: &Value, key: &str) -> String {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::assert_pending;
    use crate::error::AppError;

    #[test]
    fn only_pending_contracts_pass_the_precondition() {
        assert!(assert_pending("pending").is_ok());
        for status in ["active", "expired", "terminated", ""] {
            assert!(matches!(
                assert_pending(status),
                Err(AppError::Conflict(_))
            ));
        }
    }
}
