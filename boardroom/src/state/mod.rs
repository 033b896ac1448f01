//! Session state — phase machine, session records, and the persistence seam.

pub mod phase;
pub mod types;

pub use phase::{PhaseTransition, SessionPhase, TransitionError};
pub use types::{
    ContributionMessage, ContributionSummary, DeliberationState, Recommendation, Session,
    SessionStatus, SubProblem,
};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{DeliberationFault, EngineError, EngineResult};

/// Durable session storage. The orchestrator writes at phase boundaries;
/// the storage engine behind this seam is a collaborator's concern.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: &Session) -> EngineResult<()>;
    async fn get(&self, session_id: &str) -> EngineResult<Session>;
    async fn update(&self, session: &Session) -> EngineResult<()>;
}

pub type SharedSessionStore = Arc<dyn SessionStore>;

/// In-memory session store for tests and single-process deployments.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: &Session) -> EngineResult<()> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, session_id: &str) -> EngineResult<Session> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| {
                EngineError::Deliberation(DeliberationFault::SessionNotFound {
                    session_id: session_id.to_string(),
                })
            })
    }

    async fn update(&self, session: &Session) -> EngineResult<()> {
        let mut sessions = self.sessions.write().await;
        if !sessions.contains_key(&session.id) {
            return Err(EngineError::Deliberation(DeliberationFault::SessionNotFound {
                session_id: session.id.clone(),
            }));
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }
}
