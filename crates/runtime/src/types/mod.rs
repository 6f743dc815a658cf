//! Core types and data structures for the analytics runtime

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod entities;
pub mod error;

pub use entities::*;
pub use error::*;

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

define_id!(
    /// Unique identifier for users
    UserId
);
define_id!(
    /// Unique identifier for datasets
    DatasetId
);
define_id!(
    /// Unique identifier for analysis sessions
    SessionId
);
define_id!(
    /// Unique identifier for agent runs
    RunId
);
define_id!(
    /// Unique identifier for sandbox executions
    ExecutionId
);
define_id!(
    /// Unique identifier for vector notes
    NoteId
);
define_id!(
    /// Unique identifier for chat messages
    MessageId
);
define_id!(
    /// Unique identifier for analysis results
    ResultId
);
define_id!(
    /// Unique identifier for audit events
    AuditId
);

/// Correlation identifier propagated to every side effect of an operation
/// so that audit events and tool calls can be reconstructed post-hoc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

