use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("Credentials missing: {0}")]
    CredentialsMissing(String),

    #[error("Login timed out: {0}")]
    LoginTimeout(String),

    #[error("Follow-up table not found: {0}")]
    TableNotFound(String),

    #[error("Table not populated after {attempts} attempts: {nonzero} non-zero cells found, {needed} needed")]
    TableNotPopulated {
        attempts: u32,
        nonzero: usize,
        needed: usize,
    },

    #[error("Required columns missing, headers seen: {headers:?}")]
    MissingColumns { headers: Vec<String> },

    #[error("No valid data: {0}")]
    NoValidData(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Browser driver error: {0}")]
    Driver(String),
}
