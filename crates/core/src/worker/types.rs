//! Worker roles and loop errors.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{JobError, Stage};

/// What a worker process does. Each role claims jobs from exactly one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Import,
    Render,
    Qa,
    Upload,
    Publish,
    Cleanup,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Import,
        Role::Render,
        Role::Qa,
        Role::Upload,
        Role::Publish,
        Role::Cleanup,
    ];

    /// The stage this role claims from. Approval has no worker role.
    pub fn stage(&self) -> Stage {
        match self {
            Role::Import => Stage::Import,
            Role::Render => Stage::Render,
            Role::Qa => Stage::Qa,
            Role::Upload => Stage::Upload,
            Role::Publish => Stage::Publish,
            Role::Cleanup => Stage::Cleanup,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.stage().as_str()
    }

    /// A fresh worker id such as `render:3f9a1c2e`.
    pub fn new_worker_id(&self) -> String {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        format!("{}:{}", self.as_str(), &uuid[..8])
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| format!("unknown role '{}'", s))
    }
}

/// Errors surfacing from one worker loop iteration.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("No handler registered for role {0}")]
    NoHandler(Role),

    #[error(transparent)]
    Store(#[from] JobError),
}

impl WorkerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, WorkerError::Store(e) if e.is_transient())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip_and_stage() {
        for role in Role::ALL {
            assert_eq!(role.to_string().parse::<Role>().unwrap(), role);
            assert_eq!(role.stage().as_str(), role.as_str());
        }
        assert!("approval".parse::<Role>().is_err());
    }

    #[test]
    fn test_worker_id_prefix() {
        let id = Role::Render.new_worker_id();
        assert!(id.starts_with("render:"));
        assert_eq!(id.len(), "render:".len() + 8);
        assert_ne!(id, Role::Render.new_worker_id());
    }
}
