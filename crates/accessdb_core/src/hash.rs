//! Deterministic digest over a workspace's membership composition.
//!
//! Workspaces may share an alias only when their membership differs, and the
//! store cannot index equality over an unordered map. The composition is
//! therefore reduced to a scalar: flatten, sort by principal id, encode as
//! compact JSON, SHA-256, lowercase hex.

use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::model::Membership;

const TYPE_USER: &str = "user";
const TYPE_INTEGRATION: &str = "integration";

struct FlatEntry<'a> {
    id: &'a str,
    membership: &'a Membership,
    kind: &'static str,
}

impl FlatEntry<'_> {
    fn to_value(&self) -> Value {
        json!({
            "id": self.id,
            "role": self.membership.role,
            "invitedBy": self.membership.invited_by,
            "disabled": self.membership.disabled,
            "type": self.kind,
        })
    }
}

/// Hash `members` and `integrations` into a 64-char hex digest.
///
/// Input iteration order does not affect the result.
pub fn hash_members<'a, M, I>(members: M, integrations: I) -> String
where
    M: IntoIterator<Item = (&'a String, &'a Membership)>,
    I: IntoIterator<Item = (&'a String, &'a Membership)>,
{
    let mut entries: Vec<FlatEntry<'a>> = members
        .into_iter()
        .map(|(id, membership)| FlatEntry {
            id: id.as_str(),
            membership,
            kind: TYPE_USER,
        })
        .collect();
    entries.extend(integrations.into_iter().map(|(id, membership)| FlatEntry {
        id: id.as_str(),
        membership,
        kind: TYPE_INTEGRATION,
    }));
    // Stable: a principal listed as both member and integration keeps the
    // member entry first.
    entries.sort_by(|a, b| a.id.cmp(b.id));

    let encoded = Value::Array(entries.iter().map(FlatEntry::to_value).collect()).to_string();
    hex_digest(encoded.as_bytes())
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
