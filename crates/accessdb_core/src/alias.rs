//! Alias canonicalization and duplicate resolution.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use anyhow::Result;
use rand::Rng;
use regex::Regex;
use serde::Serialize;

use crate::model::{USER_COLLECTION, User, WORKSPACE_COLLECTION, Workspace};
use crate::store::{Filter, Store};

pub const MIN_ALIAS_LEN: usize = 5;
pub const MAX_ALIAS_LEN: usize = 30;
pub const ALIAS_FILLER: char = 'a';
const RANDOM_ALIAS_LEN: usize = 10;
const DUPLICATE_SUFFIX_LEN: usize = 6;

static ALIAS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9-]{3,30}[a-zA-Z0-9]$").expect("alias pattern compiles")
});

/// Placeholder values left behind by clients that serialized a missing field.
const DENYLIST: &[&str] = &["undefined", "nulla", "nanaa", "object-object", "none-none"];

pub fn is_valid_alias(candidate: &str) -> bool {
    ALIAS_PATTERN.is_match(candidate) && !is_denied(candidate)
}

fn is_denied(candidate: &str) -> bool {
    DENYLIST
        .iter()
        .any(|denied| denied.eq_ignore_ascii_case(candidate))
}

/// Normalize `raw` into a handle matching the alias pattern.
///
/// Falls back to a random lowercase token when the slug is unusable.
pub fn canonicalize(raw: &str) -> String {
    canonicalize_with(raw, &mut rand::rng())
}

pub fn canonicalize_with<R: Rng + ?Sized>(raw: &str, rng: &mut R) -> String {
    let mut slug = String::with_capacity(raw.len());
    for ch in raw.chars() {
        let ch = if ch.is_ascii_alphanumeric() || ch == '-' {
            ch
        } else {
            '-'
        };
        if ch == '-' && slug.ends_with('-') {
            continue;
        }
        slug.push(ch);
    }
    let mut slug = slug.trim_matches('-').to_string();
    pad_to_min(&mut slug);

    if slug.len() > MAX_ALIAS_LEN {
        slug.truncate(MAX_ALIAS_LEN);
        let trimmed_len = slug.trim_end_matches('-').len();
        slug.truncate(trimmed_len);
        pad_to_min(&mut slug);
    }

    if is_valid_alias(&slug) {
        slug
    } else {
        random_token(rng, RANDOM_ALIAS_LEN)
    }
}

fn pad_to_min(slug: &mut String) {
    while slug.len() < MIN_ALIAS_LEN {
        slug.push(ALIAS_FILLER);
    }
}

fn random_token<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| char::from(b'a' + rng.random_range(0..26u8)))
        .collect()
}

/// Which collection and key shape a duplicate scan covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasTarget {
    /// Users: alias alone, case-insensitive.
    User,
    /// Workspaces: alias case-insensitive together with `membersHash`.
    Workspace,
}

impl AliasTarget {
    pub fn collection(self) -> &'static str {
        match self {
            Self::User => USER_COLLECTION,
            Self::Workspace => WORKSPACE_COLLECTION,
        }
    }
}

/// What to do when a step finds residual duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    Abort,
    Rename,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateMember {
    pub id: String,
    pub alias: String,
}

/// Records sharing one uniqueness key, in store insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub key: String,
    pub members: Vec<DuplicateMember>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AliasAssignment {
    pub target: AliasTarget,
    pub id: String,
    pub previous: String,
    pub alias: String,
}

/// Group records whose uniqueness key collides. Singleton groups are dropped.
pub fn find_duplicate_groups(store: &Store, target: AliasTarget) -> Result<Vec<DuplicateGroup>> {
    let keyed: Vec<(String, DuplicateMember)> = match target {
        AliasTarget::User => store
            .find_all::<User>(USER_COLLECTION, &Filter::All)?
            .into_iter()
            .map(|doc| {
                (
                    doc.body.alias.to_lowercase(),
                    DuplicateMember {
                        id: doc.id,
                        alias: doc.body.alias,
                    },
                )
            })
            .collect(),
        AliasTarget::Workspace => store
            .find_all::<Workspace>(WORKSPACE_COLLECTION, &Filter::All)?
            .into_iter()
            .map(|doc| {
                (
                    format!("{}|{}", doc.body.alias.to_lowercase(), doc.body.members_hash),
                    DuplicateMember {
                        id: doc.id,
                        alias: doc.body.alias,
                    },
                )
            })
            .collect(),
    };

    // find_all yields seq order, so each group's first member is the oldest record.
    let mut order: Vec<String> = Vec::new();
    let mut groups: BTreeMap<String, Vec<DuplicateMember>> = BTreeMap::new();
    for (key, member) in keyed {
        let entry = groups.entry(key.clone()).or_default();
        if entry.is_empty() {
            order.push(key);
        }
        entry.push(member);
    }

    Ok(order
        .into_iter()
        .filter_map(|key| {
            let members = groups.remove(&key)?;
            (members.len() > 1).then_some(DuplicateGroup { key, members })
        })
        .collect())
}

/// First member of each group keeps its alias; the rest get
/// `lowercased-alias-<suffix>`.
pub fn resolve_duplicates(target: AliasTarget, groups: &[DuplicateGroup]) -> Vec<AliasAssignment> {
    resolve_duplicates_with(target, groups, &mut rand::rng())
}

pub fn resolve_duplicates_with<R: Rng + ?Sized>(
    target: AliasTarget,
    groups: &[DuplicateGroup],
    rng: &mut R,
) -> Vec<AliasAssignment> {
    let mut out = Vec::new();
    for group in groups.iter().filter(|group| group.members.len() > 1) {
        for member in group.members.iter().skip(1) {
            let alias = format!(
                "{}-{}",
                member.alias.to_lowercase(),
                random_token(rng, DUPLICATE_SUFFIX_LEN)
            );
            out.push(AliasAssignment {
                target,
                id: member.id.clone(),
                previous: member.alias.clone(),
                alias,
            });
        }
    }
    out
}

/// Write `assignments` back. Records that no longer carry the previous alias
/// are left alone, so a re-run after partial application is harmless.
pub fn apply_assignments(store: &Store, assignments: &[AliasAssignment]) -> Result<usize> {
    let mut written = 0;
    for assignment in assignments {
        let collection = assignment.target.collection();
        let updated = match assignment.target {
            AliasTarget::User => {
                rename::<User>(store, collection, assignment, |user| &mut user.alias)?
            }
            AliasTarget::Workspace => {
                rename::<Workspace>(store, collection, assignment, |ws| &mut ws.alias)?
            }
        };
        if updated {
            written += 1;
        }
    }
    Ok(written)
}

fn rename<T>(
    store: &Store,
    collection: &str,
    assignment: &AliasAssignment,
    alias_of: impl Fn(&mut T) -> &mut String,
) -> Result<bool>
where
    T: serde::de::DeserializeOwned + Serialize,
{
    let Some(mut body) = store.get::<T>(collection, &assignment.id)? else {
        return Ok(false);
    };
    let alias = alias_of(&mut body);
    if *alias != assignment.previous {
        return Ok(false);
    }
    *alias = assignment.alias.clone();
    store.upsert(collection, &assignment.id, &body)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::model::Membership;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn canonicalize_known_examples() {
        assert_eq!(canonicalize("invalid_name"), "invalid-name");
        assert_eq!(canonicalize("-invalid"), "invalid");
        assert_eq!(canonicalize(""), "aaaaa");
        assert_eq!(canonicalize("ab"), "abaaa");
    }

    #[test]
    fn canonicalize_collapses_and_trims_separators() {
        assert_eq!(canonicalize("  My   Team!! "), "My-Team");
        assert_eq!(canonicalize("a--b__c"), "a-b-c");
        assert_eq!(canonicalize("---"), "aaaaa");
    }

    #[test]
    fn canonicalize_replaces_non_ascii() {
        assert_eq!(canonicalize("zoë-team"), "zo-team");
    }

    #[test]
    fn canonicalize_truncates_and_trims_trailing_separator() {
        let raw = format!("{}-tail", "x".repeat(29));
        let alias = canonicalize(&raw);
        assert_eq!(alias, "x".repeat(29));
        assert!(is_valid_alias(&alias));

        let long = "y".repeat(45);
        assert_eq!(canonicalize(&long), "y".repeat(MAX_ALIAS_LEN));
    }

    #[test]
    fn canonicalize_regenerates_denied_placeholders() {
        let mut rng = rng();
        let alias = canonicalize_with("null", &mut rng);
        assert_ne!(alias, "nulla");
        assert_eq!(alias.len(), RANDOM_ALIAS_LEN);
        assert!(alias.chars().all(|ch| ch.is_ascii_lowercase()));

        let object = canonicalize_with("[object Object]", &mut rng);
        assert_ne!(object.to_lowercase(), "object-object");
        assert!(is_valid_alias(&object));
    }

    #[test]
    fn valid_alias_rejects_edge_hyphens_and_length() {
        assert!(is_valid_alias("abcde"));
        assert!(!is_valid_alias("abcd"));
        assert!(!is_valid_alias("-abcde"));
        assert!(!is_valid_alias("abcde-"));
        assert!(!is_valid_alias(&"a".repeat(33)));
        assert!(!is_valid_alias("Undefined"));
    }

    #[test]
    fn resolve_duplicates_keeps_first_member() {
        let groups = vec![DuplicateGroup {
            key: "myworkspace".to_string(),
            members: vec![
                DuplicateMember {
                    id: "w1".to_string(),
                    alias: "myworkspace".to_string(),
                },
                DuplicateMember {
                    id: "w2".to_string(),
                    alias: "MYWORKSPACE".to_string(),
                },
                DuplicateMember {
                    id: "w3".to_string(),
                    alias: "MyWorkspace".to_string(),
                },
            ],
        }];
        let assignments = resolve_duplicates_with(AliasTarget::User, &groups, &mut rng());
        assert_eq!(assignments.len(), 2);
        assert_eq!(assignments[0].id, "w2");
        assert_eq!(assignments[1].previous, "MyWorkspace");
        for assignment in &assignments {
            let suffix = assignment
                .alias
                .strip_prefix("myworkspace-")
                .expect("lowercased prefix");
            assert_eq!(suffix.len(), DUPLICATE_SUFFIX_LEN);
        }
        assert_ne!(assignments[0].alias, assignments[1].alias);
    }

    #[test]
    fn renamed_duplicate_may_exceed_alias_bound() {
        let long = format!("{}b", "a".repeat(28));
        assert!(is_valid_alias(&long));
        let groups = vec![DuplicateGroup {
            key: long.clone(),
            members: vec![
                DuplicateMember {
                    id: "u1".to_string(),
                    alias: long.clone(),
                },
                DuplicateMember {
                    id: "u2".to_string(),
                    alias: long.to_uppercase(),
                },
            ],
        }];

        let assignments = resolve_duplicates_with(AliasTarget::User, &groups, &mut rng());
        assert_eq!(assignments.len(), 1);
        let renamed = &assignments[0].alias;
        assert!(renamed.starts_with(&format!("{long}-")));
        assert_eq!(renamed.len(), long.len() + 1 + DUPLICATE_SUFFIX_LEN);
        assert_eq!(renamed.len(), 36);
        assert!(!is_valid_alias(renamed));
    }

    #[test]
    fn find_duplicate_groups_uses_insertion_order() {
        let store = Store::open_in_memory().expect("store");
        for (id, alias) in [("u2", "Alice"), ("u1", "bob-b"), ("u3", "ALICE"), ("u4", "alice")] {
            store
                .insert(
                    USER_COLLECTION,
                    id,
                    &User {
                        id: id.to_string(),
                        alias: alias.to_string(),
                        name: None,
                    },
                )
                .expect("insert");
        }
        let groups = find_duplicate_groups(&store, AliasTarget::User).expect("groups");
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, "alice");
        let ids: Vec<_> = groups[0].members.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["u2", "u3", "u4"]);
    }

    #[test]
    fn workspace_duplicates_require_matching_members_hash() {
        let store = Store::open_in_memory().expect("store");
        let workspace = |id: &str, alias: &str, owner: &str| {
            let mut ws = Workspace {
                id: id.to_string(),
                alias: alias.to_string(),
                ..Workspace::default()
            };
            ws.members
                .insert(owner.to_string(), Membership::new("owner"));
            ws.refresh_members_hash();
            ws
        };
        for ws in [
            workspace("w1", "team", "alice"),
            workspace("w2", "TEAM", "bob"),
            workspace("w3", "Team", "alice"),
        ] {
            store
                .insert(WORKSPACE_COLLECTION, &ws.id.clone(), &ws)
                .expect("insert");
        }
        let groups = find_duplicate_groups(&store, AliasTarget::Workspace).expect("groups");
        assert_eq!(groups.len(), 1);
        let ids: Vec<_> = groups[0].members.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["w1", "w3"]);
    }

    #[test]
    fn apply_assignments_is_idempotent() {
        let store = Store::open_in_memory().expect("store");
        store
            .insert(
                USER_COLLECTION,
                "u1",
                &User {
                    id: "u1".to_string(),
                    alias: "Alice".to_string(),
                    name: None,
                },
            )
            .expect("insert");
        let assignments = vec![AliasAssignment {
            target: AliasTarget::User,
            id: "u1".to_string(),
            previous: "Alice".to_string(),
            alias: "alice-qwerty".to_string(),
        }];
        assert_eq!(apply_assignments(&store, &assignments).expect("apply"), 1);
        assert_eq!(apply_assignments(&store, &assignments).expect("reapply"), 0);
        let user: User = store.get(USER_COLLECTION, "u1").expect("get").expect("user");
        assert_eq!(user.alias, "alice-qwerty");
    }

    proptest! {
        #[test]
        fn canonicalize_always_matches_pattern(raw in "\\PC{0,60}") {
            let alias = canonicalize(&raw);
            prop_assert!(ALIAS_PATTERN.is_match(&alias), "bad alias {alias:?} for {raw:?}");
            prop_assert!(alias.len() <= MAX_ALIAS_LEN);
        }

        #[test]
        fn canonicalize_is_stable_for_valid_aliases(raw in "[a-z0-9]{5,30}") {
            prop_assert_eq!(canonicalize(&raw), raw);
        }
    }
}
