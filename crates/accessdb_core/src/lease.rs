//! Leased mutex over the `migration_progress` singleton.
//!
//! Acquisition is one conditional `UPDATE`: it succeeds only when the row is
//! unlocked or the current lease has expired, so two processes sharing the
//! database file can never both hold it. Each acquisition mints a fresh
//! lease token and every write made under the lease is guarded by it, so two
//! runners configured with the same owner label never act as one holder.

use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::params;
use serde::Serialize;
use uuid::Uuid;

use crate::store::{Store, unix_timestamp};

pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(900);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationProgress {
    pub current_key: u64,
    pub locked: bool,
    pub owner: Option<String>,
    pub acquired_at_unix: Option<i64>,
    pub lease_expires_at_unix: Option<i64>,
}

impl MigrationProgress {
    pub fn is_expired(&self, now_unix: i64) -> bool {
        self.lease_expires_at_unix
            .is_some_and(|expires| expires <= now_unix)
    }
}

/// A held lease. Dropping it does not unlock; call [`release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    owner: String,
    token: String,
    ttl_seconds: i64,
    expires_at_unix: i64,
}

impl Lease {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at_unix(&self) -> i64 {
        self.expires_at_unix
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(Lease),
    Held { owner: String, expires_at_unix: i64 },
}

pub fn read_progress(store: &Store) -> Result<MigrationProgress> {
    store
        .connection()
        .query_row(
            "SELECT current_key, locked, owner, acquired_at_unix, lease_expires_at_unix
             FROM migration_progress WHERE id = 1",
            [],
            |row| {
                let current_key: i64 = row.get(0)?;
                let locked: i64 = row.get(1)?;
                Ok((
                    current_key,
                    locked == 1,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                ))
            },
        )
        .context("failed to read migration progress")
        .and_then(
            |(current_key, locked, owner, acquired_at_unix, lease_expires_at_unix)| {
                Ok(MigrationProgress {
                    current_key: u64::try_from(current_key)
                        .context("stored migration key is negative")?,
                    locked,
                    owner,
                    acquired_at_unix,
                    lease_expires_at_unix,
                })
            },
        )
}

pub fn try_acquire(store: &Store, owner: &str, ttl: Duration) -> Result<AcquireOutcome> {
    try_acquire_at(store, owner, ttl, unix_timestamp()?)
}

pub(crate) fn try_acquire_at(
    store: &Store,
    owner: &str,
    ttl: Duration,
    now_unix: i64,
) -> Result<AcquireOutcome> {
    let ttl_seconds = ttl_seconds(ttl)?;
    let expires_at_unix = now_unix.saturating_add(ttl_seconds);
    let token = Uuid::new_v4().to_string();
    let affected = store
        .connection()
        .execute(
            "UPDATE migration_progress
             SET locked = 1,
                 owner = ?1,
                 lease_token = ?4,
                 acquired_at_unix = ?2,
                 lease_expires_at_unix = ?3,
                 updated_at_unix = ?2
             WHERE id = 1
               AND (locked = 0 OR lease_expires_at_unix IS NULL OR lease_expires_at_unix <= ?2)",
            params![owner, now_unix, expires_at_unix, token],
        )
        .context("failed to update migration lock")?;

    if affected == 1 {
        return Ok(AcquireOutcome::Acquired(Lease {
            owner: owner.to_string(),
            token,
            ttl_seconds,
            expires_at_unix,
        }));
    }

    let progress = read_progress(store)?;
    Ok(AcquireOutcome::Held {
        owner: progress.owner.unwrap_or_default(),
        expires_at_unix: progress.lease_expires_at_unix.unwrap_or_default(),
    })
}

/// Extend the lease; `false` means ownership was lost to another runner.
pub fn renew(store: &Store, lease: &mut Lease) -> Result<bool> {
    renew_at(store, lease, unix_timestamp()?)
}

pub(crate) fn renew_at(store: &Store, lease: &mut Lease, now_unix: i64) -> Result<bool> {
    let expires_at_unix = now_unix.saturating_add(lease.ttl_seconds);
    let affected = store
        .connection()
        .execute(
            "UPDATE migration_progress
             SET lease_expires_at_unix = ?2, updated_at_unix = ?3
             WHERE id = 1 AND locked = 1 AND lease_token = ?1",
            params![lease.token, expires_at_unix, now_unix],
        )
        .context("failed to renew migration lease")?;
    if affected == 1 {
        lease.expires_at_unix = expires_at_unix;
    }
    Ok(affected == 1)
}

/// Advance the progress marker and record history. Never lowers the marker.
/// Returns `false`, writing nothing, when `lease` no longer holds the lock.
pub fn commit_key(store: &Store, lease: &Lease, key: u64, name: &str) -> Result<bool> {
    commit_key_at(store, lease, key, name, unix_timestamp()?)
}

pub(crate) fn commit_key_at(
    store: &Store,
    lease: &Lease,
    key: u64,
    name: &str,
    now: i64,
) -> Result<bool> {
    let key = i64::try_from(key).context("migration key does not fit into i64")?;
    let transaction = store
        .connection()
        .unchecked_transaction()
        .context("failed to start progress transaction")?;
    let affected = transaction
        .execute(
            "UPDATE migration_progress
             SET current_key = MAX(current_key, ?2), updated_at_unix = ?3
             WHERE id = 1 AND locked = 1 AND lease_token = ?1",
            params![lease.token, key, now],
        )
        .context("failed to persist migration progress")?;
    if affected != 1 {
        return Ok(false);
    }
    transaction
        .execute(
            "INSERT INTO migration_history (key, name, owner, applied_at_unix)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
                name = excluded.name,
                owner = excluded.owner,
                applied_at_unix = excluded.applied_at_unix",
            params![key, name, lease.owner, now],
        )
        .context("failed to record migration history")?;
    transaction
        .commit()
        .context("failed to commit migration progress")?;
    Ok(true)
}

/// Unlock if still held by `lease`; `false` when another runner took over.
pub fn release(store: &Store, lease: Lease) -> Result<bool> {
    let affected = store
        .connection()
        .execute(
            "UPDATE migration_progress
             SET locked = 0, owner = NULL, lease_token = NULL, acquired_at_unix = NULL,
                 lease_expires_at_unix = NULL, updated_at_unix = ?2
             WHERE id = 1 AND lease_token = ?1",
            params![lease.token, unix_timestamp()?],
        )
        .context("failed to release migration lock")?;
    Ok(affected == 1)
}

/// Operator unlock. Without `force` only an expired lease is cleared.
/// Returns the previous owner when a lock was removed.
pub fn force_unlock(store: &Store, force: bool) -> Result<Option<String>> {
    force_unlock_at(store, force, unix_timestamp()?)
}

pub(crate) fn force_unlock_at(store: &Store, force: bool, now_unix: i64) -> Result<Option<String>> {
    let progress = read_progress(store)?;
    if !progress.locked {
        return Ok(None);
    }
    if !force && !progress.is_expired(now_unix) {
        anyhow::bail!(
            "migration lock held by `{}` has not expired (expires at unix {}); pass --force to override",
            progress.owner.as_deref().unwrap_or("<unknown>"),
            progress.lease_expires_at_unix.unwrap_or_default()
        );
    }
    store
        .connection()
        .execute(
            "UPDATE migration_progress
             SET locked = 0, owner = NULL, lease_token = NULL, acquired_at_unix = NULL,
                 lease_expires_at_unix = NULL, updated_at_unix = ?1
             WHERE id = 1",
            params![now_unix],
        )
        .context("failed to clear migration lock")?;
    Ok(progress.owner)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub key: u64,
    pub name: String,
    pub owner: String,
    pub applied_at_unix: i64,
}

pub fn load_history(store: &Store) -> Result<Vec<HistoryEntry>> {
    let mut statement = store
        .connection()
        .prepare(
            "SELECT key, name, owner, applied_at_unix FROM migration_history ORDER BY key ASC",
        )
        .context("failed to prepare migration history query")?;
    let rows = statement
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })
        .context("failed to run migration history query")?;
    let mut out = Vec::new();
    for row in rows {
        let (key, name, owner, applied_at_unix) =
            row.context("failed to decode migration history row")?;
        out.push(HistoryEntry {
            key: u64::try_from(key).context("history key is negative")?,
            name,
            owner,
            applied_at_unix,
        });
    }
    Ok(out)
}

/// Test helper: force the stored marker, bypassing the lease.
#[cfg(test)]
pub(crate) fn set_current_key(store: &Store, key: u64) -> Result<()> {
    store
        .connection()
        .execute(
            "UPDATE migration_progress SET current_key = ?1 WHERE id = 1",
            params![i64::try_from(key)?],
        )
        .context("failed to set current key")?;
    Ok(())
}

fn ttl_seconds(ttl: Duration) -> Result<i64> {
    let seconds = i64::try_from(ttl.as_secs()).context("lease ttl does not fit into i64")?;
    if seconds == 0 {
        anyhow::bail!("lease ttl must be at least one second");
    }
    Ok(seconds)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    fn acquired(outcome: AcquireOutcome) -> Lease {
        match outcome {
            AcquireOutcome::Acquired(lease) => lease,
            AcquireOutcome::Held { owner, .. } => panic!("lock unexpectedly held by {owner}"),
        }
    }

    #[test]
    fn fresh_store_starts_unlocked_at_zero() {
        let store = Store::open_in_memory().expect("store");
        let progress = read_progress(&store).expect("progress");
        assert_eq!(progress.current_key, 0);
        assert!(!progress.locked);
        assert!(progress.owner.is_none());
    }

    #[test]
    fn second_owner_sees_held_lock() {
        let store = Store::open_in_memory().expect("store");
        let lease = acquired(try_acquire_at(&store, "node-a", TTL, 1_000).expect("acquire"));
        assert_eq!(lease.expires_at_unix(), 1_060);

        let outcome = try_acquire_at(&store, "node-b", TTL, 1_010).expect("acquire");
        assert_eq!(
            outcome,
            AcquireOutcome::Held {
                owner: "node-a".to_string(),
                expires_at_unix: 1_060,
            }
        );
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let store = Store::open_in_memory().expect("store");
        let mut stale = acquired(try_acquire_at(&store, "node-a", TTL, 1_000).expect("acquire"));
        let fresh = acquired(try_acquire_at(&store, "node-b", TTL, 1_061).expect("takeover"));
        assert_eq!(fresh.owner(), "node-b");

        assert!(!renew_at(&store, &mut stale, 1_062).expect("renew"));
        assert!(!commit_key(&store, &stale, 3, "late").expect("commit"));
        assert_eq!(read_progress(&store).expect("progress").current_key, 0);
        assert!(!release(&store, stale).expect("release"));
        assert_eq!(read_progress(&store).expect("progress").owner.as_deref(), Some("node-b"));
    }

    #[test]
    fn takeover_by_same_owner_name_fences_the_stale_lease() {
        let store = Store::open_in_memory().expect("store");
        let mut stale = acquired(try_acquire_at(&store, "deploy-01", TTL, 1_000).expect("acquire"));
        let fresh = acquired(try_acquire_at(&store, "deploy-01", TTL, 1_061).expect("takeover"));
        assert_eq!(stale.owner(), fresh.owner());
        assert_ne!(stale.token(), fresh.token());

        assert!(!renew_at(&store, &mut stale, 1_062).expect("renew"));
        assert_eq!(stale.expires_at_unix(), 1_060);
        assert!(!commit_key_at(&store, &stale, 7, "late", 1_062).expect("commit"));
        assert!(!release(&store, stale).expect("release"));

        let progress = read_progress(&store).expect("progress");
        assert!(progress.locked);
        assert_eq!(progress.current_key, 0);
        assert_eq!(progress.lease_expires_at_unix, Some(1_121));
        assert!(load_history(&store).expect("history").is_empty());

        assert!(commit_key_at(&store, &fresh, 7, "live", 1_063).expect("commit"));
        assert!(release(&store, fresh).expect("release"));
        assert!(!read_progress(&store).expect("progress").locked);
    }

    #[test]
    fn renew_extends_expiry() {
        let store = Store::open_in_memory().expect("store");
        let mut lease = acquired(try_acquire_at(&store, "node-a", TTL, 1_000).expect("acquire"));
        assert!(renew_at(&store, &mut lease, 1_050).expect("renew"));
        assert_eq!(lease.expires_at_unix(), 1_110);
        let outcome = try_acquire_at(&store, "node-b", TTL, 1_070).expect("acquire");
        assert!(matches!(outcome, AcquireOutcome::Held { .. }));
    }

    #[test]
    fn commit_key_never_lowers_marker() {
        let store = Store::open_in_memory().expect("store");
        let lease = acquired(try_acquire(&store, "node-a", TTL).expect("acquire"));
        assert!(commit_key(&store, &lease, 20, "later").expect("commit"));
        assert!(commit_key(&store, &lease, 10, "earlier").expect("commit"));
        assert_eq!(read_progress(&store).expect("progress").current_key, 20);

        let history = load_history(&store).expect("history");
        assert_eq!(
            history.iter().map(|entry| entry.key).collect::<Vec<_>>(),
            vec![10, 20]
        );
    }

    #[test]
    fn release_clears_lock_fields() {
        let store = Store::open_in_memory().expect("store");
        let lease = acquired(try_acquire(&store, "node-a", TTL).expect("acquire"));
        assert!(release(&store, lease).expect("release"));
        let progress = read_progress(&store).expect("progress");
        assert!(!progress.locked);
        assert!(progress.owner.is_none());
        assert!(progress.lease_expires_at_unix.is_none());
    }

    #[test]
    fn force_unlock_requires_expiry_unless_forced() {
        let store = Store::open_in_memory().expect("store");
        acquired(try_acquire_at(&store, "node-a", TTL, 1_000).expect("acquire"));

        let err = force_unlock_at(&store, false, 1_030).expect_err("must refuse");
        assert!(err.to_string().contains("has not expired"));
        assert_eq!(
            force_unlock_at(&store, false, 1_100).expect("unlock expired"),
            Some("node-a".to_string())
        );
        assert_eq!(force_unlock_at(&store, true, 1_100).expect("noop"), None);

        acquired(try_acquire_at(&store, "node-b", TTL, 1_200).expect("acquire"));
        assert_eq!(
            force_unlock_at(&store, true, 1_201).expect("forced"),
            Some("node-b".to_string())
        );
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let store = Store::open_in_memory().expect("store");
        let err = try_acquire(&store, "node-a", Duration::ZERO).expect_err("must fail");
        assert!(err.to_string().contains("at least one second"));
    }

    #[test]
    fn lock_is_exclusive_across_connections() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("accessdb.db");
        let first = Store::open(&db_path).expect("first");
        let second = Store::open(&db_path).expect("second");

        let lease = acquired(try_acquire(&first, "node-a", TTL).expect("acquire"));
        let outcome = try_acquire(&second, "node-b", TTL).expect("acquire");
        assert!(matches!(outcome, AcquireOutcome::Held { ref owner, .. } if owner == "node-a"));

        assert!(release(&first, lease).expect("release"));
        let outcome = try_acquire(&second, "node-b", TTL).expect("acquire");
        assert!(matches!(outcome, AcquireOutcome::Acquired(_)));
    }
}
