use std::collections::HashSet;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::MigrationError;
use crate::lease::{self, AcquireOutcome, HistoryEntry, Lease, MigrationProgress};
use crate::pipeline::DEFAULT_BATCH_SIZE;
use crate::store::Store;
use crate::validators::{NoopValidators, SchemaValidators};

pub type StepBody = fn(&StepContext<'_>) -> Result<()>;

/// One named, idempotent unit of schema or data change.
#[derive(Clone, Copy)]
pub struct MigrationStep {
    pub key: u64,
    pub name: &'static str,
    pub body: StepBody,
}

impl std::fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationStep")
            .field("key", &self.key)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Handles passed to a step body.
pub struct StepContext<'a> {
    pub key: u64,
    pub name: &'static str,
    pub store: &'a Store,
    pub batch_size: usize,
    pub validators: &'a dyn SchemaValidators,
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub owner: String,
    pub lease_ttl: Duration,
    pub batch_size: usize,
}

impl RunnerOptions {
    pub fn new(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            lease_ttl: lease::DEFAULT_LEASE_TTL,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Report returned after running migrations.
#[derive(Debug, Clone, Serialize)]
pub struct MigrateReport {
    pub applied: Vec<AppliedMigration>,
    pub previous_key: u64,
    pub current_key: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppliedMigration {
    pub key: u64,
    pub name: String,
    pub elapsed_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingMigration {
    pub key: u64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub progress: MigrationProgress,
    pub pending: Vec<PendingMigration>,
    pub history: Vec<HistoryEntry>,
}

/// Catalog entries sorted by key; duplicate or zero keys are rejected.
pub fn validate_catalog(catalog: &[MigrationStep]) -> Result<Vec<&MigrationStep>, MigrationError> {
    let mut seen = HashSet::new();
    for step in catalog {
        if step.key == 0 {
            return Err(MigrationError::InvalidCatalog(format!(
                "step `{}` uses reserved key 0",
                step.name
            )));
        }
        if !seen.insert(step.key) {
            return Err(MigrationError::InvalidCatalog(format!(
                "duplicate step key {} (`{}`)",
                step.key, step.name
            )));
        }
    }
    let mut steps: Vec<&MigrationStep> = catalog.iter().collect();
    steps.sort_by_key(|step| step.key);
    Ok(steps)
}

/// Steps with a key above the stored marker, in application order.
pub fn pending_steps<'c>(
    store: &Store,
    catalog: &'c [MigrationStep],
) -> Result<Vec<&'c MigrationStep>, MigrationError> {
    let steps = validate_catalog(catalog)?;
    let current = lease::read_progress(store)?.current_key;
    Ok(steps.into_iter().filter(|step| step.key > current).collect())
}

pub fn migration_status(
    store: &Store,
    catalog: &[MigrationStep],
) -> Result<MigrationStatus, MigrationError> {
    let pending = pending_steps(store, catalog)?
        .into_iter()
        .map(|step| PendingMigration {
            key: step.key,
            name: step.name.to_string(),
        })
        .collect();
    Ok(MigrationStatus {
        progress: lease::read_progress(store)?,
        pending,
        history: lease::load_history(store)?,
    })
}

pub struct Runner<'a> {
    store: &'a Store,
    options: RunnerOptions,
    validators: &'a dyn SchemaValidators,
}

impl<'a> Runner<'a> {
    pub fn new(store: &'a Store, options: RunnerOptions) -> Self {
        Self {
            store,
            options,
            validators: &NoopValidators,
        }
    }

    pub fn with_validators(mut self, validators: &'a dyn SchemaValidators) -> Self {
        self.validators = validators;
        self
    }

    /// Apply every pending step under the migration lease.
    ///
    /// The lease is released whether or not a step fails. Progress is
    /// committed after each step, so a later failure keeps earlier steps.
    pub fn run(&self, catalog: &[MigrationStep]) -> Result<MigrateReport, MigrationError> {
        let steps = validate_catalog(catalog)?;
        let owner = self.options.owner.as_str();

        let mut lease =
            match lease::try_acquire(self.store, owner, self.options.lease_ttl) {
                Ok(AcquireOutcome::Acquired(lease)) => lease,
                Ok(AcquireOutcome::Held {
                    owner,
                    expires_at_unix,
                }) => {
                    warn!(holder = %owner, expires_at_unix, "migration lock is held");
                    return Err(MigrationError::LockHeld {
                        owner,
                        expires_at_unix,
                    });
                }
                Err(err) => return Err(MigrationError::LockUnavailable(err)),
            };
        info!(owner, expires_at_unix = lease.expires_at_unix(), "migration lock acquired");

        let result = self.apply_pending(&steps, &mut lease);
        let released = lease::release(self.store, lease);

        match (result, released) {
            (Ok(report), Ok(released)) => {
                if !released {
                    warn!(owner, "migration lease was taken over before release");
                }
                info!(
                    owner,
                    applied = report.applied.len(),
                    current_key = report.current_key,
                    "migration lock released"
                );
                Ok(report)
            }
            (Ok(_), Err(err)) => Err(MigrationError::Store(
                err.context("migrations applied but the lock could not be released"),
            )),
            (Err(err), released) => {
                if let Err(release_err) = released {
                    warn!(owner, error = %format!("{release_err:#}"), "failed to release migration lock");
                }
                error!(owner, error = %err, "migration run aborted");
                Err(err)
            }
        }
    }

    fn apply_pending(
        &self,
        steps: &[&MigrationStep],
        lease: &mut Lease,
    ) -> Result<MigrateReport, MigrationError> {
        let previous_key = lease::read_progress(self.store)?.current_key;
        let mut current_key = previous_key;
        let mut applied = Vec::new();

        for step in steps.iter().filter(|step| step.key > previous_key) {
            if !lease::renew(self.store, lease)? {
                return Err(MigrationError::LeaseLost {
                    owner: lease.owner().to_string(),
                    key: step.key,
                });
            }

            info!(key = step.key, name = step.name, "applying migration step");
            let started = Instant::now();
            let context = StepContext {
                key: step.key,
                name: step.name,
                store: self.store,
                batch_size: self.options.batch_size,
                validators: self.validators,
            };
            (step.body)(&context).map_err(|source| MigrationError::StepFailed {
                key: step.key,
                name: step.name,
                source,
            })?;

            if !lease::commit_key(self.store, lease, step.key, step.name)? {
                return Err(MigrationError::LeaseLost {
                    owner: lease.owner().to_string(),
                    key: step.key,
                });
            }
            current_key = step.key;
            let elapsed_ms = started.elapsed().as_millis();
            info!(key = step.key, name = step.name, elapsed_ms, "migration step committed");
            applied.push(AppliedMigration {
                key: step.key,
                name: step.name.to_string(),
                elapsed_ms,
            });
        }

        Ok(MigrateReport {
            applied,
            previous_key,
            current_key,
        })
    }
}
