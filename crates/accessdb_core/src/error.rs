//! Typed failures surfaced by the migration engine.
//!
//! Store and step internals report through `anyhow` with context attached at
//! each call site. The variants here are the ones callers need to match on:
//! lock contention, a failed step, and residual duplicates found while
//! building a unique index.

/// A unique constraint rejected a write or an index build.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "duplicate key in collection `{collection}`{}{}",
    index_suffix(.index),
    values_suffix(.values)
)]
pub struct DuplicateKeyError {
    pub collection: String,
    pub index: Option<String>,
    /// Colliding key values, one rendered tuple per duplicate group.
    pub values: Vec<String>,
}

fn index_suffix(index: &Option<String>) -> String {
    index
        .as_deref()
        .map(|index| format!(" (index `{index}`)"))
        .unwrap_or_default()
}

fn values_suffix(values: &[String]) -> String {
    if values.is_empty() {
        String::new()
    } else {
        format!(": {}", values.join(", "))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// Another runner holds a live lease.
    #[error("migration lock is held by `{owner}` until unix {expires_at_unix}")]
    LockHeld { owner: String, expires_at_unix: i64 },

    /// The lease row could not be read or written.
    #[error("failed to acquire migration lock: {0:#}")]
    LockUnavailable(#[source] anyhow::Error),

    /// The lease expired and was taken over while this runner was working.
    #[error("migration lease for `{owner}` was lost before step {key}")]
    LeaseLost { owner: String, key: u64 },

    #[error("migration step {key} ({name}) failed: {source:#}")]
    StepFailed {
        key: u64,
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid migration catalog: {0}")]
    InvalidCatalog(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl MigrationError {
    /// True for the failures a caller should treat as "retry the run later".
    pub fn is_lock_acquisition_failure(&self) -> bool {
        matches!(self, Self::LockHeld { .. } | Self::LockUnavailable(_))
    }

    /// The duplicate-key report carried by a failed step, if that is what failed.
    pub fn duplicate_key(&self) -> Option<&DuplicateKeyError> {
        match self {
            Self::StepFailed { source, .. } | Self::Store(source) => {
                source.downcast_ref::<DuplicateKeyError>()
            }
            _ => None,
        }
    }
}
