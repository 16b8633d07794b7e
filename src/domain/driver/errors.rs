use chrono::NaiveDate;

// ============================================================================
// Driver Business Rule Errors
// ============================================================================

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DriverError {
    #[error("Driver name cannot be empty")]
    EmptyName,

    #[error("Driver name is longer than {0} characters")]
    NameTooLong(usize),

    #[error("Date of birth {0} is in the future")]
    BornInFuture(NaiveDate),
}
