use std::fmt;

use serde::{Deserialize, Serialize};

/// Role of the user on whose behalf a turn runs. Ordered: each level
/// holds every permission of the levels below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    #[default]
    Guest,
    Member,
    Trusted,
    Admin,
}

/// Capability a tool may declare it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    Execute,
    Admin,
}

impl Permission {
    pub fn minimum_level(&self) -> AccessLevel {
        match self {
            Permission::Read => AccessLevel::Guest,
            Permission::Write => AccessLevel::Member,
            Permission::Execute => AccessLevel::Trusted,
            Permission::Admin => AccessLevel::Admin,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Execute => "execute",
            Permission::Admin => "admin",
        };
        f.write_str(s)
    }
}

impl AccessLevel {
    pub fn grants(self, permission: Permission) -> bool {
        self >= permission.minimum_level()
    }
}

/// The user a turn runs for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: String,
    pub access: AccessLevel,
}

impl Caller {
    pub fn new(user_id: impl Into<String>, access: AccessLevel) -> Self {
        Self {
            user_id: user_id.into(),
            access,
        }
    }
}
