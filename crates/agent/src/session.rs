use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::info;

use leadline_core::domain::session::{Session, SessionId};

use crate::assistant::{AssistantClient, AssistantError};

pub type SharedSession = Arc<Mutex<Session>>;

/// A session picked for one request. `created` is set when it was minted for this request.
#[derive(Clone)]
pub struct ResolvedSession {
    pub id: SessionId,
    pub session: SharedSession,
    pub created: bool,
}

#[derive(Default)]
struct StoreInner {
    sessions: HashMap<SessionId, SharedSession>,
    by_handle: HashMap<String, SessionId>,
}

/// Process-lifetime map from session id to its conversation state.
///
/// The map itself sits behind a `RwLock`; each session has its own `Mutex`
/// that the chat runtime holds for a whole turn, so turns of one session never
/// interleave while different sessions proceed independently.
#[derive(Default)]
pub struct SessionStore {
    inner: RwLock<StoreInner>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get(&self, id: &SessionId) -> Option<SharedSession> {
        self.inner.read().await.sessions.get(id).cloned()
    }

    /// Cookie id first, then a session already bound to `fallback_handle`,
    /// else a fresh session with a new conversation.
    pub async fn resolve(
        &self,
        cookie_id: Option<&str>,
        fallback_handle: Option<&str>,
        assistant: &dyn AssistantClient,
    ) -> Result<ResolvedSession, AssistantError> {
        if let Some(found) = self.lookup(cookie_id, fallback_handle).await {
            return Ok(found);
        }

        // No lock is held across the network call; two cookieless first
        // requests may each create a session.
        let handle = assistant.create_conversation().await?;
        let id = SessionId::generate();
        let session = Arc::new(Mutex::new(Session::new(id.clone(), handle.clone())));

        let mut inner = self.inner.write().await;
        inner.by_handle.insert(handle.0.clone(), id.clone());
        inner.sessions.insert(id.clone(), Arc::clone(&session));
        drop(inner);

        info!(
            event_name = "session.created",
            session_id = %id,
            thread_id = %handle,
            "created chat session"
        );
        Ok(ResolvedSession { id, session, created: true })
    }

    async fn lookup(
        &self,
        cookie_id: Option<&str>,
        fallback_handle: Option<&str>,
    ) -> Option<ResolvedSession> {
        let inner = self.inner.read().await;

        let by_cookie = cookie_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| SessionId(id.to_string()))
            .filter(|id| inner.sessions.contains_key(id));
        let id = by_cookie.or_else(|| {
            fallback_handle
                .map(str::trim)
                .filter(|handle| !handle.is_empty())
                .and_then(|handle| inner.by_handle.get(handle).cloned())
        })?;

        let session = inner.sessions.get(&id).cloned()?;
        Some(ResolvedSession { id, session, created: false })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use leadline_core::domain::session::ConversationHandle;

    use super::SessionStore;
    use crate::assistant::{AssistantClient, AssistantError, RunId};

    /// Hands out `thread_1`, `thread_2`, … and never answers.
    #[derive(Default)]
    pub(crate) struct CountingAssistant {
        pub(crate) created: AtomicUsize,
    }

    #[async_trait]
    impl AssistantClient for CountingAssistant {
        async fn create_conversation(&self) -> Result<ConversationHandle, AssistantError> {
            let next = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(ConversationHandle(format!("thread_{next}")))
        }

        async fn append_message(
            &self,
            _handle: &ConversationHandle,
            _text: &str,
        ) -> Result<(), AssistantError> {
            Ok(())
        }

        async fn run_and_wait(
            &self,
            _handle: &ConversationHandle,
            _assistant_id: &str,
        ) -> Result<RunId, AssistantError> {
            Ok(RunId("run_1".to_string()))
        }

        async fn latest_reply(
            &self,
            _handle: &ConversationHandle,
            _run: &RunId,
        ) -> Result<String, AssistantError> {
            Err(AssistantError::EmptyReply)
        }
    }

    struct FailingAssistant;

    #[async_trait]
    impl AssistantClient for FailingAssistant {
        async fn create_conversation(&self) -> Result<ConversationHandle, AssistantError> {
            Err(AssistantError::Transport("connection refused".to_string()))
        }

        async fn append_message(
            &self,
            _handle: &ConversationHandle,
            _text: &str,
        ) -> Result<(), AssistantError> {
            unreachable!("no conversation exists")
        }

        async fn run_and_wait(
            &self,
            _handle: &ConversationHandle,
            _assistant_id: &str,
        ) -> Result<RunId, AssistantError> {
            unreachable!("no conversation exists")
        }

        async fn latest_reply(
            &self,
            _handle: &ConversationHandle,
            _run: &RunId,
        ) -> Result<String, AssistantError> {
            unreachable!("no conversation exists")
        }
    }

    #[tokio::test]
    async fn new_visitor_gets_fresh_session_and_cookie_reuses_it() {
        let store = SessionStore::new();
        let assistant = CountingAssistant::default();

        let first = store.resolve(None, None, &assistant).await.expect("resolve");
        assert!(first.created);
        let handle = first.session.lock().await.conversation_handle().clone();
        assert_eq!(handle.as_str(), "thread_1");

        let again =
            store.resolve(Some(first.id.as_str()), None, &assistant).await.expect("resolve");
        assert!(!again.created);
        assert_eq!(again.id, first.id);
        assert_eq!(again.session.lock().await.conversation_handle(), &handle);
        assert_eq!(assistant.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn thread_id_fallback_finds_session_without_cookie() {
        let store = SessionStore::new();
        let assistant = CountingAssistant::default();

        let first = store.resolve(None, None, &assistant).await.expect("resolve");
        let found = store.resolve(None, Some("thread_1"), &assistant).await.expect("resolve");

        assert!(!found.created);
        assert_eq!(found.id, first.id);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn unknown_cookie_and_thread_mint_a_new_session() {
        let store = SessionStore::new();
        let assistant = CountingAssistant::default();

        let resolved = store
            .resolve(Some("stale-cookie"), Some("thread_from_elsewhere"), &assistant)
            .await
            .expect("resolve");

        assert!(resolved.created);
        assert_ne!(resolved.id.as_str(), "stale-cookie");
        assert_eq!(resolved.session.lock().await.conversation_handle().as_str(), "thread_1");
    }

    #[tokio::test]
    async fn cookie_wins_over_thread_id() {
        let store = SessionStore::new();
        let assistant = CountingAssistant::default();

        let first = store.resolve(None, None, &assistant).await.expect("first");
        let second = store.resolve(None, None, &assistant).await.expect("second");

        let resolved = store
            .resolve(Some(first.id.as_str()), Some("thread_2"), &assistant)
            .await
            .expect("resolve");
        assert_eq!(resolved.id, first.id);
        assert_ne!(resolved.id, second.id);
    }

    #[tokio::test]
    async fn failed_conversation_creation_stores_nothing() {
        let store = SessionStore::new();

        let result = store.resolve(None, None, &FailingAssistant).await;
        assert!(matches!(result, Err(AssistantError::Transport(_))));
        assert!(store.is_empty().await);
    }
}
