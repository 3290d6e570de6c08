//! Hook for installing collection validators.
//!
//! Validator enforcement belongs to the deployment's store; steps only need
//! to say "the shape of `collection` changed, refresh its validator".

use anyhow::Result;
use tracing::debug;

use crate::store::Store;

pub trait SchemaValidators {
    fn apply(&self, store: &Store, collection: &str) -> Result<()>;
}

/// Default hook: nothing to install for the embedded store.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopValidators;

impl SchemaValidators for NoopValidators {
    fn apply(&self, _store: &Store, collection: &str) -> Result<()> {
        debug!(collection, "no validator installed");
        Ok(())
    }
}

/// Records which collections were refreshed, in call order.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingValidators {
    applied: std::cell::RefCell<Vec<String>>,
}

#[cfg(test)]
impl RecordingValidators {
    pub(crate) fn applied(&self) -> Vec<String> {
        self.applied.borrow().clone()
    }
}

#[cfg(test)]
impl SchemaValidators for RecordingValidators {
    fn apply(&self, _store: &Store, collection: &str) -> Result<()> {
        self.applied.borrow_mut().push(collection.to_string());
        Ok(())
    }
}
