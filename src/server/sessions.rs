use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::session::{AgentSession, SessionDeps};

use super::models::AgentRequest;

pub type SessionHandle = Arc<tokio::sync::Mutex<AgentSession>>;

/// Live sessions keyed by `applicationId:traceId`.
#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, request: &AgentRequest, deps: &SessionDeps) -> SessionHandle {
        let key = request.session_key();
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = sessions.get(&key) {
            tracing::info!(session = %key, "Reusing existing session");
            return session.clone();
        }
        tracing::info!(session = %key, "Creating new agent session");
        let session = Arc::new(tokio::sync::Mutex::new(AgentSession::new(
            &request.application_id,
            &request.trace_id,
            deps.clone(),
        )));
        sessions.insert(key, session.clone());
        session
    }

    pub fn remove(&self, key: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if sessions.remove(key).is_some() {
            tracing::info!(session = %key, "Removed session");
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.sessions
            .lock()
            .map(|s| s.contains_key(key))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;
    use crate::pipeline::actors::{ActorEnv, SearchSettings};
    use crate::pipeline::InteractionMode;
    use crate::snapshot::SnapshotSaver;
    use crate::validate::{FileMap, NoopCompiler};

    fn deps() -> SessionDeps {
        let llm = Arc::new(ScriptedLlm::default());
        SessionDeps {
            env: ActorEnv::new(llm.clone(), Arc::new(NoopCompiler), SearchSettings::default()),
            agent_llm: llm,
            naming_llm: None,
            template: Arc::new(FileMap::new()),
            snapshots: SnapshotSaver::disabled(),
            mode: InteractionMode::Interactive,
            max_iterations: 1,
        }
    }

    fn request(app: &str, trace: &str) -> AgentRequest {
        serde_json::from_value(serde_json::json!({
            "allMessages": [],
            "applicationId": app,
            "traceId": trace
        }))
        .unwrap()
    }

    #[test]
    fn sessions_are_reused_per_key() {
        let manager = SessionManager::new();
        let deps = deps();
        let a = manager.get_or_create(&request("app", "t1"), &deps);
        let b = manager.get_or_create(&request("app", "t1"), &deps);
        let c = manager.get_or_create(&request("app", "t2"), &deps);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(manager.len(), 2);

        manager.remove("app:t1");
        assert!(!manager.contains("app:t1"));
        assert!(manager.contains("app:t2"));
    }
}
