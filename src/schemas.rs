use serde::Deserialize;
use validator::Validate;

use crate::error::AppError;

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::UnprocessableEntity(format!("Validation failed: {errors}")))
}

pub fn serialize_to_map<T>(value: &T) -> serde_json::Map<String, serde_json::Value>
where
    T: serde::Serialize,
{
    let json = serde_json::to_value(value)
        .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()));
    json.as_object().cloned().unwrap_or_default()
}

pub fn remove_nulls(
    mut map: serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    map.retain(|_, value| !value.is_null());
    map
}

pub fn clamp_limit_in_range(limit: i64, minimum: i64, maximum: i64) -> i64 {
    limit.clamp(minimum, maximum)
}

pub fn ensure_one_of(value: &str, allowed: &[&str], field: &str) -> Result<(), AppError> {
    if allowed.contains(&value) {
        return Ok(());
    }
    Err(AppError::UnprocessableEntity(format!(
        "Invalid {field} '{value}'. Expected one of: {}.",
        allowed.join(", ")
    )))
}

fn default_limit_100() -> i64 {
    100
}

fn default_limit_200() -> i64 {
    200
}

fn default_limit_500() -> i64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_room_status_vacant() -> String {
    "vacant".to_string()
}

fn default_contract_status_pending() -> String {
    "pending".to_string()
}

fn default_bill_status_pending() -> String {
    "pending".to_string()
}

fn default_reading_status_pending() -> String {
    "pending".to_string()
}

fn default_payment_method_transfer() -> String {
    "transfer".to_string()
}

fn default_payment_timing_monthly() -> String {
    "monthly".to_string()
}

fn default_unit_kwh() -> String {
    "kWh".to_string()
}

fn default_group_by_day() -> String {
    "day".to_string()
}

fn default_scope_global() -> String {
    "global".to_string()
}

// ===== Path params =====

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct BuildingPath {
    pub building_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct RoomPath {
    pub room_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct RenterPath {
    pub renter_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ContractPath {
    pub contract_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct BillPath {
    pub bill_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct MeterPath {
    pub meter_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ReadingPath {
    pub reading_id: String,
}

// ===== Buildings =====

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateBuildingInput {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub address: Option<String>,
    #[serde(default)]
    pub total_rooms: i32,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateBuildingInput {
    pub name: Option<String>,
    pub address: Option<String>,
    pub total_rooms: Option<i32>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct BuildingsQuery {
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

// ===== Rooms =====

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateRoomInput {
    pub building_id: String,
    #[validate(length(min = 1, max = 32))]
    pub room_number: String,
    #[serde(default)]
    pub rent: f64,
    pub area: Option<f64>,
    #[serde(default = "default_room_status_vacant")]
    pub status: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateRoomInput {
    pub room_number: Option<String>,
    pub rent: Option<f64>,
    pub area: Option<f64>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct RoomsQuery {
    pub building_id: Option<String>,
    pub status: Option<String>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

// ===== Renters =====

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateRenterInput {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(length(min = 5, max = 32))]
    pub phone: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateRenterInput {
    pub name: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct RentersQuery {
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

// ===== Contracts =====

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateContractInput {
    #[validate(length(min = 1, max = 64))]
    pub contract_number: String,
    pub renter_id: String,
    pub room_id: String,
    #[serde(default = "default_contract_status_pending")]
    pub status: String,
    pub start_date: String,
    pub end_date: String,
    #[serde(default)]
    pub monthly_rent: f64,
    pub total_rent: Option<f64>,
    #[serde(default)]
    pub deposit: f64,
    pub key_deposit: Option<f64>,
    pub cleaning_fee: Option<f64>,
    #[serde(default = "default_payment_method_transfer")]
    pub payment_method: String,
    #[serde(default = "default_payment_timing_monthly")]
    pub payment_timing: String,
    pub signed_by: Option<String>,
    pub signed_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateContractInput {
    pub end_date: Option<String>,
    pub monthly_rent: Option<f64>,
    pub total_rent: Option<f64>,
    pub deposit: Option<f64>,
    pub key_deposit: Option<f64>,
    pub cleaning_fee: Option<f64>,
    pub payment_method: Option<String>,
    pub payment_timing: Option<String>,
    pub signed_by: Option<String>,
    pub signed_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ContractsQuery {
    pub status: Option<String>,
    pub room_id: Option<String>,
    pub renter_id: Option<String>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Default, Deserialize, serde::Serialize)]
pub struct ActivateContractsInput {
    pub contract_id: Option<String>,
}

// ===== Bills =====

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateBillInput {
    pub contract_id: String,
    #[validate(length(min = 1, max = 32))]
    pub bill_type: String,
    #[serde(default)]
    pub amount: f64,
    pub due_date: String,
    #[serde(default = "default_bill_status_pending")]
    pub status: String,
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateBillInput {
    pub due_date: Option<String>,
    pub status: Option<String>,
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct BillsQuery {
    pub contract_id: Option<String>,
    pub status: Option<String>,
    pub bill_type: Option<String>,
    pub due_from: Option<String>,
    pub due_to: Option<String>,
    #[serde(default = "default_limit_500")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct BillPaymentInput {
    pub amount: f64,
    pub payment_method: Option<String>,
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct BillStatsQuery {
    pub start: Option<String>,
    pub end: Option<String>,
    pub range: Option<String>,
    #[serde(default = "default_group_by_day", alias = "groupBy")]
    pub group_by: String,
    #[serde(default)]
    pub comparison: bool,
}

// ===== Meters =====

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateMeterInput {
    #[validate(length(min = 1, max = 64))]
    pub meter_number: String,
    #[validate(length(min = 1, max = 255))]
    pub display_name: String,
    pub meter_type: String,
    pub room_id: String,
    #[serde(default)]
    pub unit_price: f64,
    #[serde(default = "default_unit_kwh")]
    pub unit: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub sort_order: i32,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateMeterInput {
    pub display_name: Option<String>,
    pub unit_price: Option<f64>,
    pub unit: Option<String>,
    pub is_active: Option<bool>,
    pub sort_order: Option<i32>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct MetersQuery {
    pub room_id: Option<String>,
    pub meter_type: Option<String>,
    pub is_active: Option<bool>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

// ===== Meter readings =====

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct CreateReadingInput {
    pub meter_id: String,
    pub contract_id: Option<String>,
    pub previous_reading: Option<f64>,
    pub current_reading: f64,
    pub unit_price: Option<f64>,
    pub reading_date: String,
    #[serde(default = "default_reading_status_pending")]
    pub status: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateReadingInput {
    pub status: Option<String>,
    pub reading_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ReadingsQuery {
    pub meter_id: Option<String>,
    pub contract_id: Option<String>,
    pub status: Option<String>,
    pub is_billed: Option<bool>,
    #[serde(default = "default_limit_500")]
    pub limit: i64,
}

// ===== Settings =====

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct BulkUpdateSettingsInput {
    pub settings: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "default_scope_global")]
    pub scope: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        clamp_limit_in_range, ensure_one_of, remove_nulls, serialize_to_map, UpdateContractInput,
    };

    #[test]
    fn clamps_limits() {
        assert_eq!(clamp_limit_in_range(0, 1, 1000), 1);
        assert_eq!(clamp_limit_in_range(250, 1, 1000), 250);
        assert_eq!(clamp_limit_in_range(99999, 1, 1000), 1000);
    }

    #[test]
    fn enum_guard_rejects_unknown_values() {
        assert!(ensure_one_of("pending", &["pending", "active"], "status").is_ok());
        assert!(ensure_one_of("archived", &["pending", "active"], "status").is_err());
    }

    #[test]
    fn patch_serialization_drops_missing_fields() {
        let patch: UpdateContractInput = serde_json::from_value(json!({
            "monthly_rent": 3500.0
        }))
        .expect("valid patch");

        let map = remove_nulls(serialize_to_map(&patch));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("monthly_rent"), Some(&json!(3500.0)));
    }
}
