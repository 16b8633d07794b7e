use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event_sourcing::{Aggregate, EventBuffer};
use super::commands::{AmendDriverName, RegisterDriver};
use super::errors::DriverError;
use super::events::{DriverNameAmended, DriverRegistered};

// ============================================================================
// Driver Aggregate - Domain Logic
// ============================================================================
//
// Command handlers validate and emit events; they never touch the fields.
// The state handlers below are the only place the state changes, so the
// stored snapshot always equals the fold of the event log.
//
// ============================================================================

const MAX_NAME_LENGTH: usize = 120;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Driver {
    pub id: Uuid,
    pub name: String,
    pub date_of_birth: Option<NaiveDate>,
}

impl Aggregate for Driver {
    const TYPE_NAME: &'static str = "Driver";
}

impl Driver {
    // ========================================================================
    // Command Handlers
    // ========================================================================

    pub fn register(command: RegisterDriver, events: &mut EventBuffer) -> anyhow::Result<Driver> {
        let name = validated_name(&command.name)?;
        if command.date_of_birth > Utc::now().date_naive() {
            return Err(DriverError::BornInFuture(command.date_of_birth).into());
        }

        events.apply(DriverRegistered {
            driver_id: command.id,
            name,
            date_of_birth: command.date_of_birth,
        });
        Ok(Driver::default())
    }

    /// Amending to the current name is accepted and changes nothing.
    pub fn amend_name(
        &mut self,
        command: AmendDriverName,
        events: &mut EventBuffer,
    ) -> anyhow::Result<()> {
        let name = validated_name(&command.name)?;
        if name == self.name {
            return Ok(());
        }

        events.apply(DriverNameAmended {
            driver_id: command.id,
            name,
        });
        Ok(())
    }

    // ========================================================================
    // State Handlers
    // ========================================================================

    pub fn on_registered(&mut self, event: &DriverRegistered) {
        self.id = event.driver_id;
        self.name = event.name.clone();
        self.date_of_birth = Some(event.date_of_birth);
    }

    pub fn on_name_amended(&mut self, event: &DriverNameAmended) {
        self.name = event.name.clone();
    }
}

fn validated_name(name: &str) -> Result<String, DriverError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(DriverError::EmptyName);
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(DriverError::NameTooLong(MAX_NAME_LENGTH));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_register_emits_trimmed_name() {
        let id = Uuid::new_v4();
        let mut events = EventBuffer::new();

        let driver = Driver::register(
            RegisterDriver {
                id,
                name: "  Alice ".to_string(),
                date_of_birth: date(1990, 4, 1),
            },
            &mut events,
        )
        .unwrap();

        assert_eq!(driver, Driver::default());
        let events = events.into_events();
        assert_eq!(events.len(), 1);
        let registered = events[0].as_any().downcast_ref::<DriverRegistered>().unwrap();
        assert_eq!(registered.name, "Alice");
        assert_eq!(registered.driver_id, id);
    }

    #[test]
    fn test_register_rejects_bad_input() {
        let tomorrow = Utc::now().date_naive().succ_opt().unwrap();
        for (name, date_of_birth, expected) in [
            ("   ", date(1990, 1, 1), DriverError::EmptyName),
            ("Bob", tomorrow, DriverError::BornInFuture(tomorrow)),
        ] {
            let mut events = EventBuffer::new();
            let err = Driver::register(
                RegisterDriver {
                    id: Uuid::new_v4(),
                    name: name.to_string(),
                    date_of_birth,
                },
                &mut events,
            )
            .unwrap_err();

            assert_eq!(err.downcast_ref::<DriverError>(), Some(&expected));
            assert!(events.is_empty());
        }
    }

    #[test]
    fn test_amend_to_same_name_emits_nothing() {
        let mut driver = Driver::default();
        driver.on_registered(&DriverRegistered {
            driver_id: Uuid::new_v4(),
            name: "Alice".to_string(),
            date_of_birth: date(1990, 4, 1),
        });

        let mut events = EventBuffer::new();
        driver
            .amend_name(
                AmendDriverName {
                    id: driver.id,
                    name: "Alice ".to_string(),
                },
                &mut events,
            )
            .unwrap();
        assert!(events.is_empty());

        driver
            .amend_name(
                AmendDriverName {
                    id: driver.id,
                    name: "Bob".to_string(),
                },
                &mut events,
            )
            .unwrap();
        assert_eq!(events.len(), 1);
        // Handlers never mutate state directly.
        assert_eq!(driver.name, "Alice");
    }

    #[test]
    fn test_state_handlers_fold_events() {
        let id = Uuid::new_v4();
        let mut driver = Driver::default();

        driver.on_registered(&DriverRegistered {
            driver_id: id,
            name: "Alice".to_string(),
            date_of_birth: date(1990, 4, 1),
        });
        driver.on_name_amended(&DriverNameAmended {
            driver_id: id,
            name: "Bob".to_string(),
        });

        assert_eq!(
            driver,
            Driver {
                id,
                name: "Bob".to_string(),
                date_of_birth: Some(date(1990, 4, 1)),
            }
        );
    }
}
