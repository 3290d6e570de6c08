//! The production migration catalog.
//!
//! Keys are `YYYYMMDDhhmmss` stamps. Every body is safe to run again after a
//! partial or complete earlier run.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::alias::{
    AliasTarget, DuplicatePolicy, apply_assignments, canonicalize, find_duplicate_groups,
    is_valid_alias, resolve_duplicates,
};
use crate::error::DuplicateKeyError;
use crate::migrate::{MigrationStep, StepContext};
use crate::model::{
    PERMITTABLE_COLLECTION, ROLE_COLLECTION, ROLE_SELF, Role, USER_COLLECTION, User,
    WORKSPACE_COLLECTION, WORKSPACE_ROLE_NAMES, Workspace,
};
use crate::pipeline::{Change, for_each_batch};
use crate::reconcile::{RoleDirectory, fix_role_ids, reconcile};
use crate::store::{Filter, IndexField, Store, UniqueIndex};

pub const USER_ALIAS_INDEX: &str = "user_alias_nocase";
pub const WORKSPACE_ALIAS_INDEX: &str = "workspace_alias_members_hash";

pub const CATALOG: &[MigrationStep] = &[
    MigrationStep {
        key: 20210601000000,
        name: "seed-roles",
        body: seed_roles,
    },
    MigrationStep {
        key: 20210615000000,
        name: "backfill-membership-fields",
        body: backfill_membership_fields,
    },
    MigrationStep {
        key: 20210701000000,
        name: "canonicalize-user-aliases",
        body: canonicalize_user_aliases,
    },
    MigrationStep {
        key: 20210702000000,
        name: "user-alias-unique-index",
        body: user_alias_unique_index,
    },
    MigrationStep {
        key: 20210801000000,
        name: "canonicalize-workspace-aliases",
        body: canonicalize_workspace_aliases,
    },
    MigrationStep {
        key: 20210802000000,
        name: "workspace-members-hash",
        body: workspace_members_hash,
    },
    MigrationStep {
        key: 20210803000000,
        name: "workspace-alias-unique-index",
        body: workspace_alias_unique_index,
    },
    MigrationStep {
        key: 20210901000000,
        name: "fix-permittable-role-ids",
        body: fix_permittable_role_ids,
    },
    MigrationStep {
        key: 20210902000000,
        name: "reconcile-permittables",
        body: reconcile_permittables,
    },
    MigrationStep {
        key: 20210903000000,
        name: "apply-validators",
        body: apply_validators,
    },
];

fn seed_roles(ctx: &StepContext<'_>) -> Result<()> {
    let directory = RoleDirectory::load(ctx.store)?;
    let missing: Vec<(String, Role)> = WORKSPACE_ROLE_NAMES
        .iter()
        .chain(std::iter::once(&ROLE_SELF))
        .filter(|name| directory.id_of(name).is_none())
        .map(|name| {
            let id = Uuid::new_v4().to_string();
            (
                id.clone(),
                Role {
                    id,
                    name: name.to_string(),
                },
            )
        })
        .collect();
    let written = ctx
        .store
        .upsert_batch(ROLE_COLLECTION, &missing)
        .context("failed to seed built-in roles")?;
    info!(step = ctx.name, created = written, "built-in roles seeded");
    Ok(())
}

/// Raw-document pass: older workspaces predate integrations and the
/// `invitedBy`/`disabled` membership fields.
fn backfill_membership_fields(ctx: &StepContext<'_>) -> Result<()> {
    let report = for_each_batch(
        ctx.store,
        WORKSPACE_COLLECTION,
        &Filter::All,
        ctx.batch_size,
        |_, workspace: &mut Value| {
            let Some(object) = workspace.as_object_mut() else {
                anyhow::bail!("workspace document is not an object");
            };
            let mut changed = false;
            for (field, default) in [
                ("members", Value::Object(Map::new())),
                ("integrations", Value::Object(Map::new())),
                ("membersHash", Value::String(String::new())),
                ("personal", Value::Bool(false)),
            ] {
                if !object.contains_key(field) {
                    object.insert(field.to_string(), default);
                    changed = true;
                }
            }
            for field in ["members", "integrations"] {
                let Some(entries) = object.get_mut(field).and_then(Value::as_object_mut) else {
                    continue;
                };
                for membership in entries.values_mut().filter_map(Value::as_object_mut) {
                    if !membership.get("disabled").is_some_and(Value::is_boolean) {
                        membership.insert("disabled".to_string(), Value::Bool(false));
                        changed = true;
                    }
                    if !membership.contains_key("invitedBy") {
                        membership.insert("invitedBy".to_string(), Value::Null);
                        changed = true;
                    }
                }
            }
            Ok(Change::save_if(changed))
        },
    )?;
    info!(step = ctx.name, scanned = report.scanned, written = report.written, "membership fields backfilled");
    Ok(())
}

fn canonicalize_user_aliases(ctx: &StepContext<'_>) -> Result<()> {
    canonicalize_aliases::<User>(ctx, USER_COLLECTION, |user| &mut user.alias)
}

fn canonicalize_workspace_aliases(ctx: &StepContext<'_>) -> Result<()> {
    canonicalize_aliases::<Workspace>(ctx, WORKSPACE_COLLECTION, |workspace| {
        &mut workspace.alias
    })
}

/// Only invalid aliases are rewritten, so valid handles never change.
fn canonicalize_aliases<T>(
    ctx: &StepContext<'_>,
    collection: &str,
    alias_of: impl Fn(&mut T) -> &mut String,
) -> Result<()>
where
    T: DeserializeOwned + Serialize,
{
    let report = for_each_batch(
        ctx.store,
        collection,
        &Filter::All,
        ctx.batch_size,
        |_, doc: &mut T| {
            let alias = alias_of(doc);
            if is_valid_alias(alias) {
                return Ok(Change::Skip);
            }
            *alias = canonicalize(alias);
            Ok(Change::Save)
        },
    )?;
    info!(
        step = ctx.name,
        collection,
        scanned = report.scanned,
        rewritten = report.written,
        "aliases canonicalized"
    );
    Ok(())
}

fn user_alias_unique_index(ctx: &StepContext<'_>) -> Result<()> {
    enforce_unique_aliases(
        ctx.store,
        AliasTarget::User,
        DuplicatePolicy::Rename,
        &UniqueIndex {
            name: USER_ALIAS_INDEX.to_string(),
            collection: USER_COLLECTION.to_string(),
            fields: vec![IndexField::nocase("alias")],
        },
    )
}

fn workspace_members_hash(ctx: &StepContext<'_>) -> Result<()> {
    let report = for_each_batch(
        ctx.store,
        WORKSPACE_COLLECTION,
        &Filter::All,
        ctx.batch_size,
        |_, workspace: &mut Workspace| Ok(Change::save_if(workspace.refresh_members_hash())),
    )?;
    info!(step = ctx.name, scanned = report.scanned, written = report.written, "members hash refreshed");
    Ok(())
}

fn workspace_alias_unique_index(ctx: &StepContext<'_>) -> Result<()> {
    enforce_unique_aliases(
        ctx.store,
        AliasTarget::Workspace,
        DuplicatePolicy::Abort,
        &UniqueIndex {
            name: WORKSPACE_ALIAS_INDEX.to_string(),
            collection: WORKSPACE_COLLECTION.to_string(),
            fields: vec![IndexField::nocase("alias"), IndexField::exact("membersHash")],
        },
    )
}

/// Clear or reject residual duplicates according to `policy`, then build `index`.
fn enforce_unique_aliases(
    store: &Store,
    target: AliasTarget,
    policy: DuplicatePolicy,
    index: &UniqueIndex,
) -> Result<()> {
    let groups = find_duplicate_groups(store, target)?;
    if !groups.is_empty() {
        match policy {
            DuplicatePolicy::Abort => {
                let values = groups
                    .iter()
                    .map(|group| {
                        let ids: Vec<&str> =
                            group.members.iter().map(|member| member.id.as_str()).collect();
                        format!("({}) ids [{}]", group.key.replace('|', ", "), ids.join(", "))
                    })
                    .collect();
                return Err(anyhow::Error::new(DuplicateKeyError {
                    collection: target.collection().to_string(),
                    index: Some(index.name.clone()),
                    values,
                }));
            }
            DuplicatePolicy::Rename => {
                let assignments = resolve_duplicates(target, &groups);
                let renamed = apply_assignments(store, &assignments)?;
                info!(
                    collection = target.collection(),
                    groups = groups.len(),
                    renamed,
                    "duplicate aliases renamed"
                );
            }
        }
    }
    let created = store
        .create_unique_index(index)
        .with_context(|| format!("failed to build unique index {}", index.name))?;
    info!(index = %index.name, created, "unique index ensured");
    Ok(())
}

fn fix_permittable_role_ids(ctx: &StepContext<'_>) -> Result<()> {
    let report = fix_role_ids(ctx.store, ctx.batch_size)?;
    info!(step = ctx.name, scanned = report.scanned, updated = report.updated, "role ids fixed");
    Ok(())
}

fn reconcile_permittables(ctx: &StepContext<'_>) -> Result<()> {
    reconcile(ctx.store, ctx.batch_size).map(|_| ())
}

fn apply_validators(ctx: &StepContext<'_>) -> Result<()> {
    for collection in [
        USER_COLLECTION,
        WORKSPACE_COLLECTION,
        ROLE_COLLECTION,
        PERMITTABLE_COLLECTION,
    ] {
        ctx.validators
            .apply(ctx.store, collection)
            .with_context(|| format!("failed to apply {collection} validator"))?;
    }
    Ok(())
}
