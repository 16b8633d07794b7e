use uuid::Uuid;

// ============================================================================
// Engine Errors
// ============================================================================
//
// One error type for the whole command/query/stream pipeline.
//
// - Registration problems (Definition, UnsatisfiedDependency) are raised while
//   the handler registry is being built and are fatal at startup.
// - Per-command problems propagate to the caller of the command gateway after
//   the unit-of-work has been rolled back.
// - Stream consumer problems never leave a worker; they drive redelivery.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Aggregate {business_id} was not found")]
    NotFound { business_id: Uuid },

    #[error("Illegal domain definition: {0}")]
    Definition(String),

    #[error("Unsatisfied dependency: {0}")]
    UnsatisfiedDependency(String),

    #[error("Serialization failed for {type_name}: {message}")]
    Serialization { type_name: String, message: String },

    #[error("Aggregate {business_id} was modified concurrently (expected event sequence {expected_sequence})")]
    Conflict {
        business_id: Uuid,
        expected_sequence: i64,
    },

    #[error("Command {0} did not provide a target aggregate identifier")]
    NoTargetIdentifier(&'static str),

    #[error("Attempted to send a creation command for {0}, which already exists")]
    AggregateAlreadyExists(Uuid),

    #[error("Attempted to send a mutation command for {0}, which does not exist")]
    AggregateNotFound(Uuid),

    #[error("No command handler registered for {0}")]
    CommandHandlerNotFound(String),

    #[error("No query handler registered for key {0}")]
    QueryHandlerNotFound(String),

    #[error("A unit of work is already active for this execution context")]
    UnitOfWorkActive,

    #[error("No unit of work is active for this execution context")]
    NoUnitOfWork,

    #[error("Handler failed: {0}")]
    Handler(#[source] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Broker error: {0}")]
    Broker(String),
}

impl Error {
    pub(crate) fn serialization(type_name: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Error::Serialization {
            type_name: type_name.into(),
            message: err.to_string(),
        }
    }

    /// Short, stable label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "not_found",
            Error::Definition(_) => "definition",
            Error::UnsatisfiedDependency(_) => "unsatisfied_dependency",
            Error::Serialization { .. } => "serialization",
            Error::Conflict { .. } => "conflict",
            Error::NoTargetIdentifier(_) => "no_target_identifier",
            Error::AggregateAlreadyExists(_) => "aggregate_already_exists",
            Error::AggregateNotFound(_) => "aggregate_not_found",
            Error::CommandHandlerNotFound(_) => "command_handler_not_found",
            Error::QueryHandlerNotFound(_) => "query_handler_not_found",
            Error::UnitOfWorkActive => "unit_of_work_active",
            Error::NoUnitOfWork => "no_unit_of_work",
            Error::Handler(_) => "handler",
            Error::Database(_) => "database",
            Error::Broker(_) => "broker",
        }
    }
}

impl From<rdkafka::error::KafkaError> for Error {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        Error::Broker(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
