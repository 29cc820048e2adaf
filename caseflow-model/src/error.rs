use std::fmt::{self, Display};

/// Errors produced by model constructors and validation routines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    EmptyIdentity(&'static str),
    UnknownState(String),
    /// Exactly one of owner and lease expiry was present.
    InconsistentLease {
        owner_id: Option<String>,
        has_expiry: bool,
    },
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::EmptyIdentity(kind) => {
                write!(f, "{kind} identity cannot be empty")
            }
            ModelError::UnknownState(raw) => {
                write!(f, "unknown work item state: {raw}")
            }
            ModelError::InconsistentLease {
                owner_id,
                has_expiry,
            } => write!(
                f,
                "inconsistent lease: owner {owner_id:?}, expiry {}",
                if *has_expiry { "set" } else { "missing" }
            ),
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
