use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::executor::QueryResult;
use crate::sql::StatementKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of a conversation. Holds counts and column names, never full row data.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub question_text: String,
    pub generated_sql: Option<String>,
    pub result_summary: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn user(question: &str) -> Self {
        Self {
            role: Role::User,
            question_text: question.to_string(),
            generated_sql: None,
            result_summary: None,
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(question: &str, sql: Option<String>, summary: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            question_text: question.to_string(),
            generated_sql: sql,
            result_summary: Some(summary.into()),
            timestamp: Utc::now(),
        }
    }
}

/// Append-only history, oldest turns dropped once `max_turns` is reached.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationHistory {
    turns: VecDeque<ConversationTurn>,
    #[serde(skip)]
    max_turns: usize,
}

impl ConversationHistory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            max_turns: max_turns.max(1),
        }
    }

    pub fn push(&mut self, turn: ConversationTurn) {
        while self.turns.len() >= self.max_turns {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
    }

    pub fn turns(&self) -> impl DoubleEndedIterator<Item = &ConversationTurn> + ExactSizeIterator {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// A write that ran as a rolled-back dry run and waits for the user.
#[derive(Debug, Clone, Serialize)]
pub struct PendingWrite {
    pub sql: String,
    pub kind: StatementKind,
    pub question: String,
    pub preview: QueryResult,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub history: ConversationHistory,
    pub pending: Option<PendingWrite>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(max_turns: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            history: ConversationHistory::new(max_turns),
            pending: None,
            created_at: Utc::now(),
        }
    }
}

pub type SharedSession = Arc<tokio::sync::Mutex<Session>>;

struct StoredSession {
    session: SharedSession,
    last_used: Instant,
}

/// Live sessions by id. Each session has its own async mutex, so a session
/// answers one question at a time while different sessions run in parallel.
///
/// Sessions idle for longer than `idle_timeout` are dropped, and past
/// `max_sessions` the least recently used one makes room for a new one.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, StoredSession>>,
    max_turns: usize,
    max_sessions: usize,
    idle_timeout: Duration,
}

impl SessionStore {
    pub fn new(max_turns: usize, max_sessions: usize, idle_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_turns,
            max_sessions: max_sessions.max(1),
            idle_timeout,
        }
    }

    pub fn create(&self) -> SharedSession {
        let session = Session::new(self.max_turns);
        let id = session.id.clone();
        let shared = Arc::new(tokio::sync::Mutex::new(session));

        let mut sessions = self.sessions.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.sweep(&mut sessions);

        while sessions.len() >= self.max_sessions {
            let oldest = sessions
                .iter()
                .min_by_key(|(_, stored)| stored.last_used)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(oldest) => {
                    sessions.remove(&oldest);
                    info!("Evicted least recently used session {}", oldest);
                }
                None => break,
            }
        }

        sessions.insert(
            id.clone(),
            StoredSession {
                session: Arc::clone(&shared),
                last_used: Instant::now(),
            },
        );
        info!("Created session {}", id);

        shared
    }

    /// Looks up a live session and marks it as used.
    pub fn get(&self, id: &str) -> Option<SharedSession> {
        let mut sessions = self.sessions.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.sweep(&mut sessions);

        sessions.get_mut(id).map(|stored| {
            stored.last_used = Instant::now();
            Arc::clone(&stored.session)
        })
    }

    pub fn remove(&self, id: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id)
            .is_some();
        debug!("Removed session {}: {}", id, removed);
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(&self, sessions: &mut HashMap<String, StoredSession>) {
        let before = sessions.len();
        sessions.retain(|_, stored| stored.last_used.elapsed() < self.idle_timeout);
        let expired = before - sessions.len();
        if expired > 0 {
            info!("Dropped {} idle session(s)", expired);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_drops_oldest_turns() {
        let mut history = ConversationHistory::new(3);
        for i in 0..5 {
            history.push(ConversationTurn::user(&format!("question {}", i)));
        }

        assert_eq!(history.len(), 3);
        let questions: Vec<&str> = history.turns().map(|t| t.question_text.as_str()).collect();
        assert_eq!(questions, vec!["question 2", "question 3", "question 4"]);
    }

    #[test]
    fn test_assistant_turn_carries_summary() {
        let turn = ConversationTurn::assistant("how many?", Some("SELECT 1".to_string()), "1 row");
        assert_eq!(turn.role, Role::Assistant);
        assert_eq!(turn.generated_sql.as_deref(), Some("SELECT 1"));
        assert_eq!(turn.result_summary.as_deref(), Some("1 row"));
    }

    #[tokio::test]
    async fn test_store_creates_and_removes_sessions() {
        let store = SessionStore::new(10, 100, Duration::from_secs(3600));
        assert!(store.is_empty());

        let session = store.create();
        let id = session.lock().await.id.clone();
        assert!(Uuid::parse_str(&id).is_ok());
        assert!(store.get(&id).is_some());
        assert_eq!(store.len(), 1);

        assert!(store.remove(&id));
        assert!(!store.remove(&id));
        assert!(store.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_idle_sessions_expire() {
        let store = SessionStore::new(10, 100, Duration::from_millis(50));
        let id = store.create().lock().await.id.clone();
        assert!(store.get(&id).is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.get(&id).is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_least_recently_used_session_is_evicted() {
        let store = SessionStore::new(10, 2, Duration::from_secs(3600));
        let first = store.create().lock().await.id.clone();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = store.create().lock().await.id.clone();
        tokio::time::sleep(Duration::from_millis(5)).await;

        // touching the first session makes the second the oldest
        assert!(store.get(&first).is_some());
        tokio::time::sleep(Duration::from_millis(5)).await;
        let third = store.create().lock().await.id.clone();

        assert_eq!(store.len(), 2);
        assert!(store.get(&first).is_some());
        assert!(store.get(&second).is_none());
        assert!(store.get(&third).is_some());
    }

    #[test]
    fn test_session_ids_are_unique() {
        let store = SessionStore::new(10, 100, Duration::from_secs(3600));
        let a = store.create();
        let b = store.create();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 2);
    }
}
