//! Principal encoding
//!
//! A principal is matched purely by its canonical string,
//! `[idd=<IDD>:]<type>:<name>`. Two principals are the same principal iff
//! their encoded strings are byte-equal.

use serde::{Deserialize, Serialize};

/// Principal type for users
pub const PRINCIPAL_TYPE_USER: &str = "user";
/// Principal type for groups
pub const PRINCIPAL_TYPE_GROUP: &str = "group";
/// Principal type for roles
pub const PRINCIPAL_TYPE_ROLE: &str = "role";
/// Principal type for entities (services, devices)
pub const PRINCIPAL_TYPE_ENTITY: &str = "entity";

/// Prefix of role principals
pub const ROLE_PREFIX: &str = "role:";

/// Role held by every subject
pub const EVERYONE_ROLE: &str = "everyone_role";
/// Role held by subjects with no user, group or entity principal
pub const ANONYMOUS_ROLE: &str = "anonymous_role";
/// Role held by subjects with at least one user, group or entity principal
pub const AUTHENTICATED_ROLE: &str = "authenticated_role";

/// A principal presented by a subject
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    /// Principal type (`user`, `group`, `role`, `entity`)
    #[serde(rename = "type")]
    pub kind: String,

    /// Principal name
    pub name: String,

    /// Identity domain
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub idd: String,
}

impl Principal {
    /// Create a principal without an identity domain
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            idd: String::new(),
        }
    }

    /// User principal
    pub fn user(name: impl Into<String>) -> Self {
        Self::new(PRINCIPAL_TYPE_USER, name)
    }

    /// Group principal
    pub fn group(name: impl Into<String>) -> Self {
        Self::new(PRINCIPAL_TYPE_GROUP, name)
    }

    /// Entity principal
    pub fn entity(name: impl Into<String>) -> Self {
        Self::new(PRINCIPAL_TYPE_ENTITY, name)
    }

    /// Role principal
    pub fn role(name: impl Into<String>) -> Self {
        Self::new(PRINCIPAL_TYPE_ROLE, name)
    }

    /// Scope the principal to an identity domain
    pub fn with_idd(mut self, idd: impl Into<String>) -> Self {
        self.idd = idd.into();
        self
    }

    /// Canonical string, including the identity domain when present
    pub fn encode(&self) -> String {
        encode_principal(&self.kind, &self.name, &self.idd)
    }

    /// Canonical string without the identity domain
    pub fn encode_without_idd(&self) -> String {
        encode_principal(&self.kind, &self.name, "")
    }
}

/// Encode a principal as `[idd=<IDD>:]<type>:<name>`
pub fn encode_principal(kind: &str, name: &str, idd: &str) -> String {
    if idd.is_empty() {
        format!("{}:{}", kind, name)
    } else {
        format!("idd={}:{}:{}", idd, kind, name)
    }
}

/// Encode a role name as a role principal
pub fn role_principal(role: &str) -> String {
    format!("{}{}", ROLE_PREFIX, role)
}

/// Strip the `role:` prefix, if the principal is a role
pub fn role_name(principal: &str) -> Option<&str> {
    principal.strip_prefix(ROLE_PREFIX)
}
