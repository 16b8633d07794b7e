// ============================================================================
// Domain Layer - Business Logic
// ============================================================================
//
// Domain-specific aggregates, events and read models. Each aggregate has its
// own subdirectory and a `register_handlers` function that wires it into a
// HandlerRegistryBuilder.
//
// This layer only depends on the public engine API.
//
// ============================================================================

pub mod driver;
