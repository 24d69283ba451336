//! Session manager (spec §4.5): owns chat history for loaded models' primary
//! sessions, each identified by `"{modelId}-main"`. The native session
//! handle itself lives on [`crate::registry::RuntimeInfo`]; this module
//! tracks the ordered `{role, content}` history the response generator
//! replays on each turn, and the save/restore pair `disableChatHistory` uses.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::ChatMessage;

#[derive(Default)]
pub struct SessionManager {
    histories: Mutex<HashMap<String, Vec<ChatMessage>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_id_for(model_id: &str) -> String {
        format!("{model_id}-main")
    }

    pub fn create(&self, session_id: &str) {
        self.histories.lock().unwrap().entry(session_id.to_string()).or_default();
    }

    pub fn get(&self, session_id: &str) -> Option<Vec<ChatMessage>> {
        self.histories.lock().unwrap().get(session_id).cloned()
    }

    pub fn dispose(&self, session_id: &str) {
        self.histories.lock().unwrap().remove(session_id);
    }

    pub fn append(&self, session_id: &str, message: ChatMessage) {
        self.histories.lock().unwrap().entry(session_id.to_string()).or_default().push(message);
    }

    /// Reserved for future per-thread replay (spec §4.5, §9): "in this
    /// version a no-op when no external history source is wired in."
    pub fn update_session_history(&self, _model_id: &str, _thread_id: &str) {}

    /// Snapshot the current history, for the response generator to restore
    /// after a `disableChatHistory` turn (spec §4.6).
    pub fn snapshot(&self, session_id: &str) -> Vec<ChatMessage> {
        self.get(session_id).unwrap_or_default()
    }

    pub fn restore(&self, session_id: &str, history: Vec<ChatMessage>) {
        self.histories.lock().unwrap().insert(session_id.to_string(), history);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_append_then_get_round_trips() {
        let sessions = SessionManager::new();
        let id = SessionManager::session_id_for("model1");
        sessions.create(&id);
        sessions.append(&id, ChatMessage { role: "user".into(), content: "hi".into() });
        assert_eq!(sessions.get(&id).unwrap().len(), 1);
    }

    #[test]
    fn dispose_removes_history() {
        let sessions = SessionManager::new();
        let id = SessionManager::session_id_for("model1");
        sessions.create(&id);
        sessions.dispose(&id);
        assert!(sessions.get(&id).is_none());
    }

    #[test]
    fn snapshot_restore_round_trips_for_disable_chat_history() {
        let sessions = SessionManager::new();
        let id = SessionManager::session_id_for("model1");
        sessions.create(&id);
        sessions.append(&id, ChatMessage { role: "user".into(), content: "hi".into() });

        let snapshot = sessions.snapshot(&id);
        sessions.append(&id, ChatMessage { role: "assistant".into(), content: "hello".into() });
        assert_eq!(sessions.get(&id).unwrap().len(), 2);

        sessions.restore(&id, snapshot);
        assert_eq!(sessions.get(&id).unwrap().len(), 1);
    }
}
