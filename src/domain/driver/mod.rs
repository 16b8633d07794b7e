// ============================================================================
// Driver Domain - Registering Drivers and Amending Their Names
// ============================================================================
//
// - Commands (RegisterDriver, AmendDriverName)
// - Events (DriverRegistered, DriverNameAmended)
// - Errors (DriverError enum)
// - Aggregate (Driver with command and state handlers)
// - Projection (driver read model, GET_DRIVER_BY_ID, stream logging)
//
// ============================================================================

pub mod aggregate;
pub mod commands;
pub mod errors;
pub mod events;
pub mod projection;

pub use aggregate::*;
pub use commands::*;
pub use errors::*;
pub use events::*;
pub use projection::{DriverView, GET_DRIVER_BY_ID};

use crate::error::Result;
use crate::wiring::HandlerRegistryBuilder;

/// Processing group of the driver stream handlers.
pub const DRIVERS_GROUP: &str = "drivers";

/// Registers every driver handler. Call before `build()`.
pub fn register_handlers(builder: &mut HandlerRegistryBuilder) -> Result<()> {
    builder
        .on_creation(Driver::register)?
        .on_command(Driver::amend_name)?
        .on_state(Driver::on_registered)?
        .on_state(Driver::on_name_amended)?
        .on_domain_event(projection::project_registered)?
        .on_domain_event(projection::project_name_amended)?
        .on_query(GET_DRIVER_BY_ID, projection::driver_by_id)?
        .processing_group(DRIVERS_GROUP, 2)?
        .on_stream_event(DRIVERS_GROUP, projection::stream_registered)?
        .on_stream_event(DRIVERS_GROUP, projection::stream_name_amended)?;
    Ok(())
}
