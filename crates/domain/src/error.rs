use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("Invalid argument: `{0}`")]
    InvalidArgument(String),
    #[error("Invalid configuration: `{0}`")]
    Configuration(String),
    #[error("Directory error: `{0}`")]
    Gateway(String),
    #[error("Group expansion from `{dn}` exceeded the limit of {limit} groups")]
    RecursionLimitExceeded { dn: String, limit: usize },
    #[error("Operation cancelled")]
    Cancelled,
}

impl DirectoryError {
    pub fn gateway(error: impl std::fmt::Display) -> Self {
        Self::Gateway(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DirectoryError>;
