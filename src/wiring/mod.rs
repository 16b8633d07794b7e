// ============================================================================
// Wiring - Handlers, Dependencies and the Registry that Binds Them
// ============================================================================
//
// Business logic is written as plain functions. This module turns them into
// a validated, type-erased dispatch table at startup:
//
//   DependencyRegister  -> values injected into handlers by type
//   handler traits      -> which function shapes are accepted
//   HandlerRegistry     -> command / event / query dispatch
//
// ============================================================================

pub mod dependency;
pub mod handler;
pub mod registry;

pub use dependency::{Dep, DependencyRegister, FromContext, HandlerContext, HandlerScope};
pub use handler::{CreationHandler, EventHandler, MutationHandler, QueryHandler};
pub use registry::{HandlerRegistry, HandlerRegistryBuilder, ProcessingGroup, MAX_WORKERS};
