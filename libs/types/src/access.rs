//! Authorization types consumed from the identity service

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::ids::UserId;

/// Ordered access level. Higher values grant more.
///
/// The identity service reports levels either numerically or by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct AccessLevel(u8);

impl AccessLevel {
    pub const NONE: AccessLevel = AccessLevel(0);
    pub const VIEWER: AccessLevel = AccessLevel(1);
    pub const OPERATOR: AccessLevel = AccessLevel(2);
    pub const MANAGER: AccessLevel = AccessLevel(3);
    pub const ADMIN: AccessLevel = AccessLevel(4);

    pub fn new(level: u8) -> Self {
        Self(level)
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    /// Parse a level name or number.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u8>() {
            return Some(Self(n));
        }
        match s.to_ascii_lowercase().as_str() {
            "none" => Some(Self::NONE),
            "viewer" | "user" => Some(Self::VIEWER),
            "operator" => Some(Self::OPERATOR),
            "manager" => Some(Self::MANAGER),
            "admin" => Some(Self::ADMIN),
            _ => None,
        }
    }

    pub fn satisfies(&self, required: AccessLevel) -> bool {
        *self >= required
    }
}

impl<'de> Deserialize<'de> for AccessLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u8),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Self(n)),
            Raw::Text(s) => Self::parse(&s)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown access level: {s}"))),
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => f.write_str("none"),
            Self::VIEWER => f.write_str("viewer"),
            Self::OPERATOR => f.write_str("operator"),
            Self::MANAGER => f.write_str("manager"),
            Self::ADMIN => f.write_str("admin"),
            AccessLevel(n) => write!(f, "level-{n}"),
        }
    }
}

/// Who the identity service says the caller is, valid for one check only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationGrant {
    pub user_id: UserId,
    pub access_level: AccessLevel,
}
