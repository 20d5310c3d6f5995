//! Conversation controller - optimistic send with placeholder replacement
//!
//! `begin` appends the user message and a placeholder on the UI loop,
//! `deliver` talks to the backend off the loop, and `complete` swaps the
//! placeholder for the reply (or an apology) in the session captured at
//! `begin`, whichever session is active by then.

use thiserror::Error;

use crate::app::{ApiStatus, AppState};
use crate::client::{ChatBackend, ClientError};
use crate::message::{self, Message, PlaceholderToken, SessionId};

pub const APOLOGY: &str = "Sorry — I couldn't process that.";
pub const OFFLINE_SUFFIX: &str = " Server offline.";

/// Why a send was refused (nothing was mutated)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendRejected {
    #[error("Nothing to send")]
    Empty,
    #[error("No session selected")]
    NoActiveSession,
    #[error("API is offline. Start the chat server, then press Ctrl-R.")]
    Offline,
    #[error("Still starting up")]
    NotReady,
    #[error("Still waiting for the previous reply in this session")]
    Busy,
}

/// A send captured at `begin`, carried through the network call
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub user_id: String,
    pub session_id: SessionId,
    pub generation: u64,
    pub token: PlaceholderToken,
    pub text: String,
}

#[derive(Debug)]
pub struct SendCompletion {
    pub session_id: SessionId,
    pub generation: u64,
    pub token: PlaceholderToken,
    pub outcome: Result<String, ClientError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Placeholder replaced in place
    Replaced,
    /// Placeholder was gone; reply appended instead of lost
    Appended,
    /// Session deleted while in flight
    Discarded,
}

/// User-visible text for a failed send
pub fn apology(err: &ClientError) -> String {
    if err.is_connectivity() {
        format!("{}{}", APOLOGY, OFFLINE_SUFFIX)
    } else {
        APOLOGY.to_string()
    }
}

/// Check preconditions, then append user message and placeholder to the
/// active conversation.
pub fn begin(state: &mut AppState, text: &str) -> Result<PendingSend, SendRejected> {
    let text = text.trim();
    if text.is_empty() {
        return Err(SendRejected::Empty);
    }
    let session_id = state.active.clone().ok_or(SendRejected::NoActiveSession)?;
    if state.api_status == ApiStatus::Disconnected {
        return Err(SendRejected::Offline);
    }
    let user_id = state.user_id.clone().ok_or(SendRejected::NotReady)?;
    if state.is_loading(&session_id) {
        return Err(SendRejected::Busy);
    }
    let generation = state
        .generation_of(&session_id)
        .ok_or(SendRejected::NoActiveSession)?;

    let token = PlaceholderToken::new();
    let conv = state.conversations.entry(session_id.clone()).or_default();
    conv.push(Message::user(text));
    conv.push(Message::pending(token));
    state.mark_in_flight(&session_id, token);

    tracing::info!(%session_id, %token, "message queued");

    Ok(PendingSend {
        user_id,
        session_id,
        generation,
        token,
        text: text.to_string(),
    })
}

/// Best-effort ensure, then send
pub async fn deliver(backend: &dyn ChatBackend, send: PendingSend) -> SendCompletion {
    if !backend.ensure_session(&send.user_id, &send.session_id).await {
        tracing::debug!(session_id = %send.session_id, "sending without ensured session");
    }

    let outcome = backend
        .send_message(&send.user_id, &send.session_id, &send.text)
        .await;

    SendCompletion {
        session_id: send.session_id,
        generation: send.generation,
        token: send.token,
        outcome,
    }
}

/// Resolve the placeholder. Always clears the loading state for the
/// captured session. Caller persists unless `Discarded`.
pub fn complete(state: &mut AppState, completion: SendCompletion) -> CompletionOutcome {
    let SendCompletion {
        session_id,
        generation,
        token,
        outcome,
    } = completion;

    state.clear_in_flight(&session_id, token);

    let resolved = match &outcome {
        Ok(text) => Message::bot(text.as_str()),
        Err(e) => {
            if e.is_connectivity() {
                state.api_status = ApiStatus::Disconnected;
            }
            tracing::warn!(%session_id, error = %e, "send failed");
            Message::bot(apology(e))
        }
    };

    if state.generation_of(&session_id) != Some(generation) {
        tracing::debug!(%session_id, "reply for a deleted session dropped");
        return CompletionOutcome::Discarded;
    }

    let conv = state.conversations.entry(session_id.clone()).or_default();
    match message::replace(conv, token, resolved.clone()) {
        Some(next) => {
            *conv = next;
            CompletionOutcome::Replaced
        }
        None => {
            tracing::warn!(%session_id, %token, "placeholder missing, appending reply");
            conv.push(resolved);
            CompletionOutcome::Appended
        }
    }
}
