use chrono::NaiveDate;
use uuid::Uuid;

use crate::event_sourcing::Command;
use super::aggregate::Driver;

// ============================================================================
// Driver Commands - Represent user intent
// ============================================================================

#[derive(Debug, Clone)]
pub struct RegisterDriver {
    pub id: Uuid,
    pub name: String,
    pub date_of_birth: NaiveDate,
}

impl Command for RegisterDriver {
    type Aggregate = Driver;

    fn target_aggregate_id(&self) -> Option<Uuid> {
        Some(self.id)
    }
}

#[derive(Debug, Clone)]
pub struct AmendDriverName {
    pub id: Uuid,
    pub name: String,
}

impl Command for AmendDriverName {
    type Aggregate = Driver;

    fn target_aggregate_id(&self) -> Option<Uuid> {
        Some(self.id)
    }
}
