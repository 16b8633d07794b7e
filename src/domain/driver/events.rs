use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event_sourcing::Event;

// ============================================================================
// Driver Events
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DriverRegistered {
    pub driver_id: Uuid,
    pub name: String,
    pub date_of_birth: NaiveDate,
}

impl Event for DriverRegistered {
    const TYPE_NAME: &'static str = "DriverRegistered";
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DriverNameAmended {
    pub driver_id: Uuid,
    pub name: String,
}

impl Event for DriverNameAmended {
    const TYPE_NAME: &'static str = "DriverNameAmended";
}
