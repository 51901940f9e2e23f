//! Dispatch from a claimed job to the code that executes its stage.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::handlers::{
    CleanupHandler, ImportHandler, PublishHandler, QaHandler, RenderHandler, UploadHandler,
};
use super::types::Role;
use crate::job::{Job, Outcome};

/// Executes one stage for a job the caller has leased.
///
/// Handlers never touch the job row: they report an [`Outcome`] and the
/// worker loop applies it through the guarded transition.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn execute(&self, job: &Job) -> Outcome;
}

/// The fixed set of stage handlers.
pub enum RoleHandler {
    Import(ImportHandler),
    Render(RenderHandler),
    Qa(QaHandler),
    Upload(UploadHandler),
    Publish(PublishHandler),
    Cleanup(CleanupHandler),
}

impl RoleHandler {
    pub fn role(&self) -> Role {
        match self {
            RoleHandler::Import(_) => Role::Import,
            RoleHandler::Render(_) => Role::Render,
            RoleHandler::Qa(_) => Role::Qa,
            RoleHandler::Upload(_) => Role::Upload,
            RoleHandler::Publish(_) => Role::Publish,
            RoleHandler::Cleanup(_) => Role::Cleanup,
        }
    }
}

#[async_trait]
impl Handler for RoleHandler {
    async fn execute(&self, job: &Job) -> Outcome {
        match self {
            RoleHandler::Import(h) => h.execute(job).await,
            RoleHandler::Render(h) => h.execute(job).await,
            RoleHandler::Qa(h) => h.execute(job).await,
            RoleHandler::Upload(h) => h.execute(job).await,
            RoleHandler::Publish(h) => h.execute(job).await,
            RoleHandler::Cleanup(h) => h.execute(job).await,
        }
    }
}

/// Handlers keyed by role.
#[derive(Default, Clone)]
pub struct HandlerTable {
    handlers: HashMap<Role, Arc<RoleHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, replacing any previous one for its role.
    pub fn with(mut self, handler: RoleHandler) -> Self {
        self.handlers.insert(handler.role(), Arc::new(handler));
        self
    }

    pub fn get(&self, role: Role) -> Option<Arc<RoleHandler>> {
        self.handlers.get(&role).cloned()
    }

    pub fn roles(&self) -> Vec<Role> {
        Role::ALL
            .into_iter()
            .filter(|role| self.handlers.contains_key(role))
            .collect()
    }
}
