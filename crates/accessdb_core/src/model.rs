use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::hash::hash_members;

pub const USER_COLLECTION: &str = "user";
pub const WORKSPACE_COLLECTION: &str = "workspace";
pub const ROLE_COLLECTION: &str = "role";
pub const PERMITTABLE_COLLECTION: &str = "permittable";

pub const ROLE_READER: &str = "reader";
pub const ROLE_WRITER: &str = "writer";
pub const ROLE_MAINTAINER: &str = "maintainer";
pub const ROLE_OWNER: &str = "owner";
pub const ROLE_SELF: &str = "self";

/// Built-in roles granted through workspace membership.
pub const WORKSPACE_ROLE_NAMES: &[&str] = &[ROLE_READER, ROLE_WRITER, ROLE_MAINTAINER, ROLE_OWNER];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub role: String,
    #[serde(default)]
    pub invited_by: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

impl Membership {
    pub fn new(role: &str) -> Self {
        Self {
            role: role.to_string(),
            invited_by: None,
            disabled: false,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.disabled
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub alias: String,
    #[serde(default)]
    pub members: BTreeMap<String, Membership>,
    #[serde(default)]
    pub integrations: BTreeMap<String, Membership>,
    #[serde(default)]
    pub members_hash: String,
    #[serde(default)]
    pub personal: bool,
}

impl Workspace {
    /// Recompute `members_hash` from the current composition; true when it changed.
    pub fn refresh_members_hash(&mut self) -> bool {
        let next = hash_members(&self.members, &self.integrations);
        if next == self.members_hash {
            return false;
        }
        self.members_hash = next;
        true
    }

    /// Every active member and integration, as `(principal_id, role_name)`.
    pub fn active_principals(&self) -> impl Iterator<Item = (&str, &str)> {
        self.members
            .iter()
            .chain(self.integrations.iter())
            .filter(|(_, membership)| membership.is_active())
            .map(|(id, membership)| (id.as_str(), membership.role.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceRole {
    pub workspace_id: String,
    pub role_id: String,
}

impl WorkspaceRole {
    pub fn new(workspace_id: &str, role_id: &str) -> Self {
        Self {
            workspace_id: workspace_id.to_string(),
            role_id: role_id.to_string(),
        }
    }

    /// Identity used when comparing role collections as sets.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.workspace_id, self.role_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permittable {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub role_ids: Vec<String>,
    #[serde(default)]
    pub workspace_roles: Vec<WorkspaceRole>,
}
