use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VehicleType {
    Bicycle,
    Motorcycle,
    Car,
    Van,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverProfile {
    pub id: Uuid,
    pub is_available: bool,
    pub rating: f64,
    pub total_deliveries: u64,
    pub vehicle_type: VehicleType,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDriver {
    /// Party id of the driver account; generated when absent.
    #[serde(default)]
    pub id: Option<Uuid>,
    pub rating: f64,
    #[serde(default)]
    pub total_deliveries: u64,
    pub vehicle_type: VehicleType,
}
