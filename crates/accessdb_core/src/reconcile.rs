//! Rebuilds `Permittable` records from workspace membership.
//!
//! Workspaces are authoritative. The reconciler derives the
//! `(workspace, role)` pairs each principal should hold and rewrites any
//! permittable whose stored set differs, creating missing ones on the way.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::lease::{self, AcquireOutcome, Lease};
use crate::model::{
    PERMITTABLE_COLLECTION, Permittable, ROLE_COLLECTION, ROLE_SELF, Role, WORKSPACE_COLLECTION,
    WORKSPACE_ROLE_NAMES, Workspace, WorkspaceRole,
};
use crate::pipeline::{Change, for_each_batch};
use crate::store::{Filter, Store};

/// Role name/id lookups, rebuilt each time a step needs them.
#[derive(Debug, Clone, Default)]
pub struct RoleDirectory {
    name_to_id: HashMap<String, String>,
    id_to_name: HashMap<String, String>,
}

impl RoleDirectory {
    pub fn load(store: &Store) -> Result<Self> {
        let roles = store
            .find_all::<Role>(ROLE_COLLECTION, &Filter::All)
            .context("failed to load roles")?;
        Ok(Self::from_roles(roles.into_iter().map(|doc| doc.body)))
    }

    pub fn from_roles(roles: impl IntoIterator<Item = Role>) -> Self {
        let mut directory = Self::default();
        for role in roles {
            directory
                .id_to_name
                .insert(role.id.clone(), role.name.clone());
            directory.name_to_id.insert(role.name, role.id);
        }
        directory
    }

    pub fn id_of(&self, name: &str) -> Option<&str> {
        self.name_to_id.get(name).map(String::as_str)
    }

    pub fn name_of(&self, id: &str) -> Option<&str> {
        self.id_to_name.get(id).map(String::as_str)
    }

    pub fn self_role_id(&self) -> Option<&str> {
        self.id_of(ROLE_SELF)
    }
}

/// Unordered set comparison keyed on `workspaceId:roleId`; duplicates ignored.
pub fn same_workspace_roles(left: &[WorkspaceRole], right: &[WorkspaceRole]) -> bool {
    let left: HashSet<String> = left.iter().map(WorkspaceRole::dedup_key).collect();
    let right: HashSet<String> = right.iter().map(WorkspaceRole::dedup_key).collect();
    left == right
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedRoles {
    pub by_principal: HashMap<String, BTreeSet<WorkspaceRole>>,
    pub workspaces: usize,
    pub unresolved: usize,
}

impl ExpectedRoles {
    pub fn for_principal(&self, principal_id: &str) -> Vec<WorkspaceRole> {
        self.by_principal
            .get(principal_id)
            .map(|roles| roles.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Accumulate the active, resolvable memberships of every workspace.
pub fn expected_workspace_roles(
    store: &Store,
    roles: &RoleDirectory,
    batch_size: usize,
) -> Result<ExpectedRoles> {
    let mut expected = ExpectedRoles::default();
    for_each_batch(
        store,
        WORKSPACE_COLLECTION,
        &Filter::All,
        batch_size,
        |workspace_id, workspace: &mut Workspace| {
            expected.workspaces += 1;
            for (principal_id, role_name) in workspace.active_principals() {
                let Some(role_id) = roles.id_of(role_name) else {
                    expected.unresolved += 1;
                    warn!(
                        workspace = workspace_id,
                        principal = principal_id,
                        role = role_name,
                        "skipping membership with unknown role"
                    );
                    continue;
                };
                expected
                    .by_principal
                    .entry(principal_id.to_string())
                    .or_default()
                    .insert(WorkspaceRole::new(workspace_id, role_id));
            }
            Ok(Change::Skip)
        },
    )?;
    Ok(expected)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub workspaces: usize,
    pub permittables_scanned: usize,
    pub updated: usize,
    pub created: usize,
    pub unresolved_roles: usize,
}

pub fn reconcile(store: &Store, batch_size: usize) -> Result<ReconcileReport> {
    let roles = RoleDirectory::load(store)?;
    let expected = expected_workspace_roles(store, &roles, batch_size)?;

    let mut seen: HashSet<String> = HashSet::new();
    let batch = for_each_batch(
        store,
        PERMITTABLE_COLLECTION,
        &Filter::All,
        batch_size,
        |_, permittable: &mut Permittable| {
            seen.insert(permittable.user_id.clone());
            let wanted = expected.for_principal(&permittable.user_id);
            if same_workspace_roles(&permittable.workspace_roles, &wanted) {
                return Ok(Change::Skip);
            }
            permittable.workspace_roles = wanted;
            Ok(Change::Save)
        },
    )?;

    let missing: BTreeMap<&str, &BTreeSet<WorkspaceRole>> = expected
        .by_principal
        .iter()
        .filter(|(principal_id, roles)| !roles.is_empty() && !seen.contains(*principal_id))
        .map(|(principal_id, roles)| (principal_id.as_str(), roles))
        .collect();
    let self_role: Vec<String> = roles.self_role_id().map(str::to_string).into_iter().collect();
    let mut created = Vec::with_capacity(missing.len());
    for (principal_id, workspace_roles) in missing {
        let id = Uuid::new_v4().to_string();
        created.push((
            id.clone(),
            Permittable {
                id,
                user_id: principal_id.to_string(),
                role_ids: self_role.clone(),
                workspace_roles: workspace_roles.iter().cloned().collect(),
            },
        ));
    }
    for chunk in created.chunks(batch_size.max(1)) {
        store
            .upsert_batch(PERMITTABLE_COLLECTION, chunk)
            .context("failed to create missing permittables")?;
    }

    let report = ReconcileReport {
        workspaces: expected.workspaces,
        permittables_scanned: batch.scanned,
        updated: batch.written,
        created: created.len(),
        unresolved_roles: expected.unresolved,
    };
    info!(
        workspaces = report.workspaces,
        scanned = report.permittables_scanned,
        updated = report.updated,
        created = report.created,
        unresolved = report.unresolved_roles,
        "permittables reconciled"
    );
    Ok(report)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FixRoleIdsReport {
    pub scanned: usize,
    pub updated: usize,
}

/// Strip workspace-scoped ids from `roleIds` and make sure `self` is present.
pub fn fix_role_ids(store: &Store, batch_size: usize) -> Result<FixRoleIdsReport> {
    let roles = RoleDirectory::load(store)?;
    let scoped = workspace_scoped_role_ids(store, &roles, batch_size)?;
    let self_role = roles.self_role_id().map(str::to_string);

    let batch = for_each_batch(
        store,
        PERMITTABLE_COLLECTION,
        &Filter::All,
        batch_size,
        |_, permittable: &mut Permittable| {
            let before = permittable.role_ids.len();
            permittable.role_ids.retain(|id| !scoped.contains(id));
            let mut changed = permittable.role_ids.len() != before;
            if let Some(self_role) = &self_role
                && !permittable.role_ids.contains(self_role)
            {
                permittable.role_ids.push(self_role.clone());
                changed = true;
            }
            Ok(Change::save_if(changed))
        },
    )?;
    Ok(FixRoleIdsReport {
        scanned: batch.scanned,
        updated: batch.written,
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileRun {
    pub fixed_role_ids: Option<FixRoleIdsReport>,
    pub report: ReconcileReport,
}

/// Run the reconcile passes outside a migration, holding the migration lease
/// so `migrate` cannot interleave. The lease is renewed before each pass and
/// released whether or not a pass fails.
pub fn reconcile_exclusive(
    store: &Store,
    owner: &str,
    ttl: Duration,
    batch_size: usize,
    fix: bool,
) -> Result<ReconcileRun> {
    let mut held = match lease::try_acquire(store, owner, ttl)? {
        AcquireOutcome::Acquired(lease) => lease,
        AcquireOutcome::Held {
            owner,
            expires_at_unix,
        } => bail!("migration lock is held by `{owner}` until unix {expires_at_unix}; retry later"),
    };

    let result = reconcile_passes(store, &mut held, batch_size, fix);
    let released = lease::release(store, held);

    match (result, released) {
        (Ok(run), Ok(released)) => {
            if !released {
                warn!(owner, "migration lease was taken over before release");
            }
            Ok(run)
        }
        (Ok(_), Err(err)) => {
            Err(err.context("reconcile finished but the lock could not be released"))
        }
        (Err(err), released) => {
            if let Err(release_err) = released {
                warn!(owner, error = %format!("{release_err:#}"), "failed to release migration lock");
            }
            Err(err)
        }
    }
}

fn reconcile_passes(
    store: &Store,
    lease: &mut Lease,
    batch_size: usize,
    fix: bool,
) -> Result<ReconcileRun> {
    let fixed_role_ids = if fix {
        ensure_lease(store, lease, "fix-role-ids")?;
        Some(fix_role_ids(store, batch_size)?)
    } else {
        None
    };
    ensure_lease(store, lease, "reconcile")?;
    let report = reconcile(store, batch_size)?;
    Ok(ReconcileRun {
        fixed_role_ids,
        report,
    })
}

fn ensure_lease(store: &Store, lease: &mut Lease, pass: &str) -> Result<()> {
    if !lease::renew(store, lease)? {
        bail!(
            "migration lease for `{}` was lost before the {pass} pass",
            lease.owner()
        );
    }
    Ok(())
}

fn workspace_scoped_role_ids(
    store: &Store,
    roles: &RoleDirectory,
    batch_size: usize,
) -> Result<HashSet<String>> {
    let mut names: HashSet<String> = WORKSPACE_ROLE_NAMES.iter().map(|name| name.to_string()).collect();
    for_each_batch(
        store,
        WORKSPACE_COLLECTION,
        &Filter::All,
        batch_size,
        |_, workspace: &mut Workspace| {
            for membership in workspace.members.values().chain(workspace.integrations.values()) {
                names.insert(membership.role.clone());
            }
            Ok(Change::Skip)
        },
    )?;
    names.remove(ROLE_SELF);
    Ok(names
        .iter()
        .filter_map(|name| roles.id_of(name))
        .map(str::to_string)
        .collect())
}
