//! Session reconciliation
//!
//! Activation runs idle -> ensuring -> fetching -> resolved. The network half
//! (`fetch_remote`) runs off the UI loop; `apply` folds the result into
//! `AppState` on the loop. The server wins only when it returns messages.

use crate::app::AppState;
use crate::client::{ChatBackend, History};
use crate::message::{self, Conversation, Message, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationPhase {
    Idle,
    Ensuring,
    Fetching,
    Resolved,
}

impl ActivationPhase {
    pub fn name(&self) -> &'static str {
        match self {
            ActivationPhase::Idle => "idle",
            ActivationPhase::Ensuring => "ensuring",
            ActivationPhase::Fetching => "fetching",
            ActivationPhase::Resolved => "resolved",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationOptions {
    /// Make the session active right away, showing cached messages
    pub show_cached_first: bool,
    /// Mark the session active once history is merged
    pub select_after_load: bool,
}

impl Default for ActivationOptions {
    fn default() -> Self {
        Self {
            show_cached_first: true,
            select_after_load: true,
        }
    }
}

/// Identity captured when an activation starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationTicket {
    pub session_id: SessionId,
    /// Selection sequence at start; only the latest may re-select
    pub seq: u64,
    /// Session generation at start; stale after deletion
    pub generation: u64,
    pub options: ActivationOptions,
}

/// What the network half brought back
#[derive(Debug, Clone)]
pub struct ActivationResult {
    pub ticket: ActivationTicket,
    pub ensured: bool,
    pub history: History,
}

/// How a cached conversation and server history combine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    KeepCache,
    UseServer(Conversation),
}

/// Server is authoritative only when it returns data. A cache holding a
/// placeholder stays put so the in-flight send can resolve it.
pub fn resolve(cached: &[Message], history: History) -> Resolution {
    if message::has_pending(cached) {
        return Resolution::KeepCache;
    }
    match history {
        History::Messages(msgs) if !msgs.is_empty() => {
            Resolution::UseServer(msgs.into_iter().map(Message::from).collect())
        }
        _ => Resolution::KeepCache,
    }
}

/// Ensure (best effort) then fetch. `progress` sees the fetching transition.
pub async fn fetch_remote(
    backend: &dyn ChatBackend,
    user_id: &str,
    ticket: ActivationTicket,
    progress: impl Fn(&ActivationTicket, ActivationPhase),
) -> ActivationResult {
    let ensured = backend.ensure_session(user_id, &ticket.session_id).await;
    if !ensured {
        tracing::debug!(session_id = %ticket.session_id, "continuing without ensured session");
    }

    progress(&ticket, ActivationPhase::Fetching);
    let history = backend.fetch_history(user_id, &ticket.session_id).await;

    ActivationResult {
        ticket,
        ensured,
        history,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Server history replaced the cache
    Replaced,
    /// Cache kept (empty/unavailable history or pending send)
    Kept,
    /// Session deleted meanwhile; nothing touched
    SessionGone,
}

/// Fold an activation result into state. Caller persists on `Replaced`/`Kept`.
pub fn apply(state: &mut AppState, result: ActivationResult) -> ApplyOutcome {
    let ActivationResult { ticket, history, .. } = result;
    state.finish_activation(&ticket);

    if state.generation_of(&ticket.session_id) != Some(ticket.generation) {
        tracing::debug!(session_id = %ticket.session_id, "activation for a deleted session dropped");
        return ApplyOutcome::SessionGone;
    }

    let cached = state
        .conversations
        .get(&ticket.session_id)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let outcome = match resolve(cached, history) {
        Resolution::UseServer(conv) => {
            state.conversations.insert(ticket.session_id.clone(), conv);
            ApplyOutcome::Replaced
        }
        Resolution::KeepCache => {
            state.conversations.entry(ticket.session_id.clone()).or_default();
            ApplyOutcome::Kept
        }
    };

    if ticket.options.select_after_load && state.is_latest_selection(ticket.seq) {
        state.active = Some(ticket.session_id.clone());
    }

    tracing::debug!(
        session_id = %ticket.session_id,
        phase = ActivationPhase::Resolved.name(),
        ?outcome,
        "activation resolved"
    );
    outcome
}
