//! Application state and root controller
//!
//! `AppState` is the single owner of sessions, conversations and status.
//! `App` wraps it with the store and backend: user actions mutate state and
//! persist immediately, network work is spawned, and its results come back
//! as `AppEvent`s applied on the UI loop via `App::handle`.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::client::ChatBackend;
use crate::conversation::{self, SendCompletion, SendRejected};
use crate::message::{Conversation, PlaceholderToken, SessionId};
use crate::reconcile::{self, ActivationOptions, ActivationPhase, ActivationResult, ActivationTicket};
use crate::store::{LocalState, LocalStore};

/// Cached assessment of backend reachability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApiStatus {
    #[default]
    Checking,
    Connected,
    Disconnected,
}

impl ApiStatus {
    pub fn from_reachable(reachable: bool) -> Self {
        if reachable {
            ApiStatus::Connected
        } else {
            ApiStatus::Disconnected
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ApiStatus::Checking => "Checking",
            ApiStatus::Connected => "Connected",
            ApiStatus::Disconnected => "Disconnected",
        }
    }
}

/// Everything the UI shows, plus the bookkeeping that keeps async
/// completions honest
#[derive(Debug, Default)]
pub struct AppState {
    pub user_id: Option<String>,
    /// Newest first, no duplicates
    pub sessions: Vec<SessionId>,
    pub conversations: HashMap<SessionId, Conversation>,
    pub active: Option<SessionId>,
    pub api_status: ApiStatus,
    /// Recent events for the Log tab
    pub log: Vec<String>,

    initialized: bool,
    generations: HashMap<SessionId, u64>,
    next_generation: u64,
    selection_seq: u64,
    in_flight: HashMap<SessionId, PlaceholderToken>,
    activations: HashMap<SessionId, (u64, ActivationPhase)>,
}

impl AppState {
    /// Adopt a loaded snapshot (sessions and their conversations)
    fn adopt(&mut self, local: LocalState) {
        self.conversations = local.conversations;
        self.sessions = Vec::with_capacity(local.sessions.len());
        for id in local.sessions.into_iter().rev() {
            self.insert_session(id);
        }
    }

    /// Insert at the head unless present; guarantees a conversation entry
    pub fn insert_session(&mut self, id: SessionId) -> bool {
        self.conversations.entry(id.clone()).or_default();
        if !self.generations.contains_key(&id) {
            self.next_generation += 1;
            self.generations.insert(id.clone(), self.next_generation);
        }
        if self.sessions.contains(&id) {
            return false;
        }
        self.sessions.insert(0, id);
        true
    }

    /// Drop a session and everything tied to it
    pub fn remove_session(&mut self, id: &str) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|s| s != id);
        self.conversations.remove(id);
        self.generations.remove(id);
        self.in_flight.remove(id);
        self.activations.remove(id);
        self.sessions.len() != before
    }

    pub fn generation_of(&self, id: &str) -> Option<u64> {
        self.generations.get(id).copied()
    }

    /// Set the active session as a user action
    pub fn select(&mut self, id: Option<SessionId>) -> u64 {
        self.active = id;
        self.begin_selection()
    }

    /// Start a new selection epoch; earlier activations lose the right to
    /// re-select their session
    pub fn begin_selection(&mut self) -> u64 {
        self.selection_seq += 1;
        self.selection_seq
    }

    pub fn is_latest_selection(&self, seq: u64) -> bool {
        self.selection_seq == seq
    }

    pub fn start_activation(&mut self, ticket: &ActivationTicket) {
        self.activations.insert(
            ticket.session_id.clone(),
            (ticket.seq, ActivationPhase::Ensuring),
        );
    }

    pub fn advance_activation(&mut self, ticket: &ActivationTicket, phase: ActivationPhase) {
        if let Some(entry) = self.activations.get_mut(&ticket.session_id) {
            if entry.0 == ticket.seq {
                entry.1 = phase;
            }
        }
    }

    pub fn finish_activation(&mut self, ticket: &ActivationTicket) {
        if self.activations.get(&ticket.session_id).map(|(seq, _)| *seq) == Some(ticket.seq) {
            self.activations.remove(&ticket.session_id);
        }
    }

    pub fn activation_phase(&self, id: &str) -> Option<ActivationPhase> {
        self.activations.get(id).map(|(_, phase)| *phase)
    }

    pub fn mark_in_flight(&mut self, id: &str, token: PlaceholderToken) {
        self.in_flight.insert(id.to_string(), token);
    }

    pub fn clear_in_flight(&mut self, id: &str, token: PlaceholderToken) {
        if self.in_flight.get(id) == Some(&token) {
            self.in_flight.remove(id);
        }
    }

    /// A send is waiting for its reply in this session
    pub fn is_loading(&self, id: &str) -> bool {
        self.in_flight.contains_key(id)
    }

    /// Any network work outstanding
    pub fn is_busy(&self) -> bool {
        !self.in_flight.is_empty() || !self.activations.is_empty()
    }

    pub fn active_conversation(&self) -> &[crate::message::Message] {
        self.active
            .as_ref()
            .and_then(|id| self.conversations.get(id))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn push_log(&mut self, msg: impl Into<String>) {
        let now = chrono::Local::now().format("%H:%M:%S");
        self.log.push(format!("[{}] {}", now, msg.into()));
    }
}

/// Results of spawned network work
#[derive(Debug)]
pub enum AppEvent {
    Health { reachable: bool },
    ActivationProgress { ticket: ActivationTicket, phase: ActivationPhase },
    ActivationResolved(ActivationResult),
    SendCompleted(SendCompletion),
}

/// Root controller
pub struct App {
    state: AppState,
    store: LocalStore,
    backend: Arc<dyn ChatBackend>,
    events: mpsc::UnboundedSender<AppEvent>,
}

impl App {
    pub fn new(
        store: LocalStore,
        backend: Arc<dyn ChatBackend>,
    ) -> (Self, mpsc::UnboundedReceiver<AppEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let app = Self {
            state: AppState::default(),
            store,
            backend,
            events,
        };
        (app, rx)
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// One-shot startup: health check, user id, restore or create a session.
    /// Returns false if already initialized.
    pub async fn initialize(&mut self) -> bool {
        if self.state.initialized {
            return false;
        }
        self.state.initialized = true;

        let reachable = self.backend.check_health().await;
        self.state.api_status = ApiStatus::from_reachable(reachable);
        self.state
            .push_log(format!("API {}", self.state.api_status.name().to_lowercase()));

        let local = self.store.load();
        let user_id = match local.user_id.clone() {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                if let Err(e) = self.store.save_user_id(&id) {
                    tracing::error!(error = %e, "failed to persist user id");
                }
                id
            }
        };
        tracing::info!(%user_id, sessions = local.sessions.len(), "local state loaded");
        self.state.user_id = Some(user_id);
        let repaired = local.repaired;
        self.state.adopt(local);
        if repaired {
            self.persist_all();
            self.state.push_log("Repaired local store");
        }

        match self.state.sessions.first().cloned() {
            Some(first) if reachable => self.activate(first, ActivationOptions::default()),
            Some(first) => {
                self.state.select(Some(first));
            }
            None => {
                let id = self.next_session_id();
                self.state.insert_session(id.clone());
                self.persist_all();
                self.state.push_log(format!("Created {}", id));

                if reachable {
                    let options = ActivationOptions {
                        show_cached_first: false,
                        select_after_load: true,
                    };
                    self.activate(id, options);
                } else {
                    self.state.select(Some(id));
                }
            }
        }
        true
    }

    /// Time-derived id, bumped past any collision
    fn next_session_id(&self) -> SessionId {
        let mut millis = Utc::now().timestamp_millis();
        loop {
            let id = format!("session_{}", millis);
            if !self.state.sessions.contains(&id) {
                return id;
            }
            millis += 1;
        }
    }

    /// Start a reconciliation for `session_id`
    fn activate(&mut self, session_id: SessionId, options: ActivationOptions) {
        let Some(user_id) = self.state.user_id.clone() else {
            self.state.select(Some(session_id));
            return;
        };
        let Some(generation) = self.state.generation_of(&session_id) else {
            return;
        };

        let seq = if options.show_cached_first {
            self.state.select(Some(session_id.clone()))
        } else {
            self.state.begin_selection()
        };

        let ticket = ActivationTicket {
            session_id,
            seq,
            generation,
            options,
        };
        self.state.start_activation(&ticket);
        tracing::debug!(session_id = %ticket.session_id, seq, "activation started");

        let backend = Arc::clone(&self.backend);
        let events = self.events.clone();
        tokio::spawn(async move {
            let progress_events = events.clone();
            let result = reconcile::fetch_remote(backend.as_ref(), &user_id, ticket, |t, phase| {
                let _ = progress_events.send(AppEvent::ActivationProgress {
                    ticket: t.clone(),
                    phase,
                });
            })
            .await;
            let _ = events.send(AppEvent::ActivationResolved(result));
        });
    }

    /// User picked a session in the sidebar
    pub fn select_session(&mut self, session_id: &str) {
        if !self.state.sessions.iter().any(|s| s == session_id) {
            return;
        }
        if self.state.api_status != ApiStatus::Disconnected {
            self.activate(session_id.to_string(), ActivationOptions::default());
        } else {
            self.state.select(Some(session_id.to_string()));
        }
    }

    /// Create a session at the head of the list and make it active
    pub fn new_session(&mut self) -> SessionId {
        let id = self.next_session_id();
        self.create_session(id.clone());
        id
    }

    pub fn create_session(&mut self, session_id: SessionId) {
        self.state.insert_session(session_id.clone());
        self.persist_all();
        self.state.push_log(format!("Created {}", session_id));

        if self.state.api_status != ApiStatus::Disconnected {
            self.activate(session_id, ActivationOptions::default());
        } else {
            self.state.select(Some(session_id));
        }
    }

    /// Local-only delete; the active session falls to the new head
    pub fn delete_session(&mut self, session_id: &str) {
        if !self.state.remove_session(session_id) {
            return;
        }
        self.persist_all();
        self.state.push_log(format!("Deleted {}", session_id));

        if self.state.active.as_deref() == Some(session_id) {
            let next = self.state.sessions.first().cloned();
            self.state.select(next);
        }
    }

    /// Optimistically append and send; the reply arrives as an event
    pub fn send(&mut self, text: &str) -> Result<PlaceholderToken, SendRejected> {
        let pending = match conversation::begin(&mut self.state, text) {
            Ok(p) => p,
            Err(e) => {
                self.state.push_log(format!("Send rejected: {}", e));
                return Err(e);
            }
        };
        self.persist_conversations();

        let token = pending.token;
        let backend = Arc::clone(&self.backend);
        let events = self.events.clone();
        tokio::spawn(async move {
            let done = conversation::deliver(backend.as_ref(), pending).await;
            let _ = events.send(AppEvent::SendCompleted(done));
        });
        Ok(token)
    }

    /// Re-run the health check in the background
    pub fn recheck_health(&mut self) {
        self.state.api_status = ApiStatus::Checking;
        let backend = Arc::clone(&self.backend);
        let events = self.events.clone();
        tokio::spawn(async move {
            let reachable = backend.check_health().await;
            let _ = events.send(AppEvent::Health { reachable });
        });
    }

    /// Apply the result of spawned work
    pub fn handle(&mut self, event: AppEvent) {
        match event {
            AppEvent::Health { reachable } => {
                self.state.api_status = ApiStatus::from_reachable(reachable);
                self.state
                    .push_log(format!("API {}", self.state.api_status.name().to_lowercase()));
            }
            AppEvent::ActivationProgress { ticket, phase } => {
                self.state.advance_activation(&ticket, phase);
            }
            AppEvent::ActivationResolved(result) => {
                let session_id = result.ticket.session_id.clone();
                if !result.ensured {
                    self.state
                        .push_log(format!("Backend did not register {}", session_id));
                }
                match reconcile::apply(&mut self.state, result) {
                    reconcile::ApplyOutcome::SessionGone => {}
                    outcome => {
                        if outcome == reconcile::ApplyOutcome::Replaced {
                            self.state.push_log(format!("Synced history for {}", session_id));
                        }
                        self.persist_conversations();
                    }
                }
            }
            AppEvent::SendCompleted(done) => {
                let session_id = done.session_id.clone();
                match conversation::complete(&mut self.state, done) {
                    conversation::CompletionOutcome::Discarded => {
                        self.state
                            .push_log(format!("Dropped reply for deleted {}", session_id));
                    }
                    _ => self.persist_conversations(),
                }
            }
        }
    }

    fn persist_sessions(&mut self) {
        if let Err(e) = self.store.save_sessions(&self.state.sessions) {
            tracing::error!(error = %e, "failed to persist sessions");
            self.state.push_log(format!("Save error: {}", e));
        }
    }

    fn persist_conversations(&mut self) {
        if let Err(e) = self.store.save_conversations(&self.state.conversations) {
            tracing::error!(error = %e, "failed to persist conversations");
            self.state.push_log(format!("Save error: {}", e));
        }
    }

    fn persist_all(&mut self) {
        self.persist_sessions();
        self.persist_conversations();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientError, History};
    use crate::message::{Message, Sender, StoredMessage};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// In-memory backend with scripted answers
    struct FakeBackend {
        healthy: bool,
        history: Mutex<HashMap<String, History>>,
        offline_send: bool,
        ensure_fails: bool,
    }

    impl FakeBackend {
        fn new(healthy: bool) -> Self {
            Self {
                healthy,
                history: Mutex::new(HashMap::new()),
                offline_send: false,
                ensure_fails: false,
            }
        }
    }

    #[async_trait]
    impl ChatBackend for FakeBackend {
        async fn check_health(&self) -> bool {
            self.healthy
        }
        async fn ensure_session(&self, _user_id: &str, _session_id: &str) -> bool {
            self.healthy && !self.ensure_fails
        }
        async fn fetch_history(&self, _user_id: &str, session_id: &str) -> History {
            self.history
                .lock()
                .unwrap()
                .get(session_id)
                .cloned()
                .unwrap_or(History::Messages(vec![]))
        }
        async fn send_message(
            &self,
            _user_id: &str,
            _session_id: &str,
            text: &str,
        ) -> Result<String, ClientError> {
            if self.offline_send {
                return Err(ClientError::Timeout {
                    url: "http://fake/chat".into(),
                });
            }
            Ok(format!("echo: {}", text))
        }
    }

    async fn settle(app: &mut App, rx: &mut mpsc::UnboundedReceiver<AppEvent>) {
        while app.state().is_busy() {
            let event = rx.recv().await.expect("event channel closed");
            app.handle(event);
        }
    }

    fn setup(backend: FakeBackend) -> (TempDir, App, mpsc::UnboundedReceiver<AppEvent>) {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        let (app, rx) = App::new(store, Arc::new(backend));
        (dir, app, rx)
    }

    fn assert_in_sync(state: &AppState) {
        assert_eq!(state.sessions.len(), state.conversations.len());
        for id in &state.sessions {
            assert!(state.conversations.contains_key(id), "missing conversation for {}", id);
        }
    }

    #[tokio::test]
    async fn test_initialize_is_one_shot() {
        let (_dir, mut app, mut rx) = setup(FakeBackend::new(true));
        assert!(app.initialize().await);
        settle(&mut app, &mut rx).await;
        assert!(!app.initialize().await);
        assert_eq!(app.state().sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_fresh_start_creates_and_persists_session() {
        let (dir, mut app, mut rx) = setup(FakeBackend::new(true));
        app.initialize().await;
        settle(&mut app, &mut rx).await;

        let state = app.state();
        assert_eq!(state.sessions.len(), 1);
        let sid = &state.sessions[0];
        assert!(sid.starts_with("session_"));
        assert_eq!(state.active.as_ref(), Some(sid));
        assert!(state.conversations[sid].is_empty());

        let persisted = LocalStore::open(dir.path()).unwrap().load();
        assert_eq!(&persisted.sessions, &state.sessions);
        assert!(persisted.conversations[sid].is_empty());
        assert_eq!(persisted.user_id, state.user_id);
    }

    #[tokio::test]
    async fn test_offline_start_activates_locally() {
        let (_dir, mut app, _rx) = setup(FakeBackend::new(false));
        app.initialize().await;

        let state = app.state();
        assert_eq!(state.api_status, ApiStatus::Disconnected);
        assert_eq!(state.active.as_ref(), state.sessions.first());
        assert!(!state.is_busy());
    }

    #[tokio::test]
    async fn test_create_and_delete_keep_sync() {
        let (_dir, mut app, mut rx) = setup(FakeBackend::new(false));
        app.initialize().await;

        let a = app.new_session();
        let b = app.new_session();
        assert_ne!(a, b);
        assert_eq!(app.state().sessions[0], b);
        assert_in_sync(app.state());

        app.delete_session(&a);
        assert_in_sync(app.state());
        app.create_session(b.clone());
        assert_in_sync(app.state());
        assert_eq!(app.state().sessions.iter().filter(|s| **s == b).count(), 1);
        settle(&mut app, &mut rx).await;
    }

    #[tokio::test]
    async fn test_delete_active_falls_to_head() {
        let (_dir, mut app, _rx) = setup(FakeBackend::new(false));
        app.initialize().await;
        let first = app.state().sessions[0].clone();
        let second = app.new_session();
        assert_eq!(app.state().active.as_ref(), Some(&second));

        app.delete_session(&second);
        assert_eq!(app.state().active.as_ref(), Some(&first));

        app.delete_session(&first);
        assert!(app.state().active.is_none());
        assert!(app.state().sessions.is_empty());
    }

    #[tokio::test]
    async fn test_send_round_trip_persists_reply() {
        let (dir, mut app, mut rx) = setup(FakeBackend::new(true));
        app.initialize().await;
        settle(&mut app, &mut rx).await;

        app.send("hi").unwrap();
        let sid = app.state().active.clone().unwrap();
        assert!(app.state().conversations[&sid][1].is_placeholder());

        settle(&mut app, &mut rx).await;
        assert_eq!(
            app.state().conversations[&sid],
            vec![Message::user("hi"), Message::bot("echo: hi")]
        );

        let persisted = LocalStore::open(dir.path()).unwrap().load();
        assert_eq!(persisted.conversations[&sid], app.state().conversations[&sid]);
    }

    #[tokio::test]
    async fn test_send_offline_failure() {
        let mut backend = FakeBackend::new(true);
        backend.offline_send = true;
        let (_dir, mut app, mut rx) = setup(backend);
        app.initialize().await;
        settle(&mut app, &mut rx).await;

        app.send("hi").unwrap();
        settle(&mut app, &mut rx).await;

        let conv = app.state().active_conversation();
        assert_eq!(conv[1].text(), "Sorry — I couldn't process that. Server offline.");
        assert_eq!(app.state().api_status, ApiStatus::Disconnected);
        assert_eq!(app.send("again"), Err(SendRejected::Offline));
    }

    #[tokio::test]
    async fn test_select_keeps_cache_on_empty_history() {
        let backend = FakeBackend::new(true);
        let (dir, mut app, mut rx) = {
            let dir = TempDir::new().unwrap();
            let store = LocalStore::open(dir.path()).unwrap();
            store.save_sessions(&["session_1".to_string()]).unwrap();
            let mut convs = HashMap::new();
            convs.insert("session_1".to_string(), vec![Message::user("local only")]);
            store.save_conversations(&convs).unwrap();
            let (app, rx) = App::new(store, Arc::new(backend));
            (dir, app, rx)
        };

        app.initialize().await;
        // cached messages are visible before the fetch resolves
        assert_eq!(app.state().active_conversation(), &[Message::user("local only")]);
        settle(&mut app, &mut rx).await;
        assert_eq!(app.state().active_conversation(), &[Message::user("local only")]);
        drop(dir);
    }

    #[tokio::test]
    async fn test_select_server_history_wins() {
        let backend = FakeBackend::new(true);
        backend.history.lock().unwrap().insert(
            "session_1".into(),
            History::Messages(vec![StoredMessage {
                sender: Sender::Bot,
                text: "server copy".into(),
            }]),
        );

        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        store.save_sessions(&["session_2".to_string(), "session_1".to_string()]).unwrap();
        let (mut app, mut rx) = App::new(store, Arc::new(backend));

        app.initialize().await;
        settle(&mut app, &mut rx).await;
        assert_eq!(app.state().active.as_deref(), Some("session_2"));

        app.select_session("session_1");
        assert_eq!(app.state().active.as_deref(), Some("session_1"));
        settle(&mut app, &mut rx).await;
        assert_eq!(app.state().active_conversation(), &[Message::bot("server copy")]);
    }

    #[tokio::test]
    async fn test_failed_ensure_is_logged_and_history_still_fetched() {
        let mut backend = FakeBackend::new(true);
        backend.ensure_fails = true;
        backend.history.lock().unwrap().insert(
            "session_1".into(),
            History::Messages(vec![StoredMessage {
                sender: Sender::User,
                text: "kept on server".into(),
            }]),
        );

        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        store.save_sessions(&["session_1".to_string()]).unwrap();
        let (mut app, mut rx) = App::new(store, Arc::new(backend));

        app.initialize().await;
        settle(&mut app, &mut rx).await;

        assert!(app
            .state()
            .log
            .iter()
            .any(|line| line.ends_with("Backend did not register session_1")));
        assert_eq!(app.state().active_conversation(), &[Message::user("kept on server")]);
    }

    #[tokio::test]
    async fn test_select_while_rechecking_still_reconciles() {
        let backend = FakeBackend::new(true);
        backend.history.lock().unwrap().insert(
            "session_1".into(),
            History::Messages(vec![StoredMessage {
                sender: Sender::Bot,
                text: "server copy".into(),
            }]),
        );

        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        store.save_sessions(&["session_2".to_string(), "session_1".to_string()]).unwrap();
        let (mut app, mut rx) = App::new(store, Arc::new(backend));
        app.initialize().await;
        settle(&mut app, &mut rx).await;

        app.recheck_health();
        assert_eq!(app.state().api_status, ApiStatus::Checking);

        app.select_session("session_1");
        assert!(app.state().activation_phase("session_1").is_some());

        settle(&mut app, &mut rx).await;
        assert_eq!(app.state().active_conversation(), &[Message::bot("server copy")]);
    }

    #[tokio::test]
    async fn test_initialize_persists_store_repairs() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("sessions.json"),
            r#"["session_a","session_a","session_b"]"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("conversations.json"),
            r#"{"session_a":[{"sender":"user","text":"x"}],"ghost":[{"sender":"bot","text":"y"}]}"#,
        )
        .unwrap();

        let store = LocalStore::open(dir.path()).unwrap();
        let (mut app, _rx) = App::new(store, Arc::new(FakeBackend::new(false)));
        app.initialize().await;

        let sessions: Vec<String> =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("sessions.json")).unwrap())
                .unwrap();
        assert_eq!(sessions, vec!["session_a", "session_b"]);

        let convs: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("conversations.json")).unwrap(),
        )
        .unwrap();
        assert!(convs.get("ghost").is_none());
        assert_eq!(convs["session_b"], serde_json::json!([]));

        let reloaded = LocalStore::open(dir.path()).unwrap().load();
        assert!(!reloaded.repaired);
    }
}
