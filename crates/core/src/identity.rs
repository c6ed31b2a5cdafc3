use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Permission attached to an identity. Only `Write` may emit relay events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Read,
    Write,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Read => "read",
            Capability::Write => "write",
        }
    }

    pub fn can_emit(&self) -> bool {
        matches!(self, Capability::Write)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported capability '{0}'; expected 'read' or 'write'")]
pub struct UnknownCapability(pub String);

impl FromStr for Capability {
    type Err = UnknownCapability;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" => Ok(Capability::Read),
            "write" => Ok(Capability::Write),
            other => Err(UnknownCapability(other.to_string())),
        }
    }
}

/// An authenticated principal as carried inside a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub login: String,
    pub role: Capability,
}

impl Identity {
    pub fn new(login: impl Into<String>, role: Capability) -> Self {
        Self {
            login: login.into(),
            role,
        }
    }

    pub fn can_emit(&self) -> bool {
        self.role.can_emit()
    }
}
