use thiserror::Error;

/// Fatal errors of a bisection run. Anything that is not one of these is
/// folded into a failing outcome at the test executor boundary.
#[derive(Error, Debug)]
pub enum BisectError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("bisect tool failure: {0}")]
    BisectToolFailure(String),

    #[error("version control error: {0:#}")]
    Vcs(#[from] anyhow::Error),

    #[error("interrupted")]
    Interrupted,
}

impl BisectError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            BisectError::InvalidInput(_) => 2,
            BisectError::ValidationFailed(_) => 3,
            BisectError::BisectToolFailure(_) => 4,
            BisectError::Vcs(_) => 5,
            BisectError::Interrupted => 130,
        }
    }
}
